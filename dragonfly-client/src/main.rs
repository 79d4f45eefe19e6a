/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

mod logging;
mod piece;
mod scheduler;
mod server;
mod session;
mod shutdown;
mod supernode;
mod writer;

use clap::Parser;
use dragonfly_client_config::{Args, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.version {
        println!("dfget {VERSION}");
        return ExitCode::SUCCESS;
    }

    let _guards = logging::init(&args);

    if args.internal_piece_server {
        return run_piece_server(&args).await;
    }

    let code = session::run(args).await;
    ExitCode::from(code.clamp(0, 255) as u8)
}

/// run_piece_server is the body of a re-exec'd `--internal-piece-server`
/// process: bind (or discover) a port, print it for the parent session
/// to read, then serve pieces until the idle reaper shuts it down.
async fn run_piece_server(args: &Args) -> ExitCode {
    let Some(tfn) = args.task_file_name.clone() else {
        eprintln!("--internal-piece-server requires --task-file-name");
        return ExitCode::FAILURE;
    };
    let bind_ip = args.bind_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let data_dir = args
        .data_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let meta_path = match dragonfly_client_init::Home::resolve() {
        Ok(home) => home.meta_path(),
        Err(err) => {
            eprintln!("failed to resolve home directory: {err}");
            return ExitCode::FAILURE;
        }
    };

    match server::run_standalone(bind_ip, tfn, data_dir, meta_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "piece server exited with an error");
            ExitCode::FAILURE
        }
    }
}
