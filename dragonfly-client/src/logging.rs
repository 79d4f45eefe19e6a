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

use dragonfly_client_config::Args;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// LogGuards keeps the non-blocking writer's background flush thread
/// alive for the process lifetime; dropping it would silently stop
/// delivering buffered log lines.
pub struct LogGuards(#[allow(dead_code)] Vec<WorkerGuard>);

/// init sets up structured logging, splitting the session process's
/// output into `dfclient.log` and a re-exec'd piece server's into
/// `dfserver.log` so the two don't interleave in the same file. With
/// `--console`, a second layer mirrors events to stdout.
pub fn init(args: &Args) -> LogGuards {
    let log_dir = dragonfly_client_init::Home::resolve()
        .map(|home| home.log_dir)
        .unwrap_or_else(|_| PathBuf::from("."));
    let _ = dragonfly_client_init::create_directory(&log_dir);

    let file_name = if args.internal_piece_server {
        "dfserver.log"
    } else {
        "dfclient.log"
    };
    let appender = tracing_appender::rolling::daily(&log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if args.console {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    } else {
        registry.init();
    }

    LogGuards(vec![guard])
}
