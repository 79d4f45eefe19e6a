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

use crate::scheduler::{Scheduler, SessionLocation};
use crate::supernode::client::{RegisterRequest, SupernodeClient};
use crate::supernode::protocol::{PEER_HTTP_PATH_PREFIX, SUPERNODE_PORT};
use crate::writer::ServiceWriter;
use dragonfly_client_backend::{Backend, DownloadRequest, HttpBackend};
use dragonfly_client_config::{Args, NodeConfig};
use dragonfly_client_core::error::BackReasonCell;
use dragonfly_client_core::{BackReason, Error, Result};
use dragonfly_client_init::Home;
use dragonfly_client_storage::TaskPaths;
use dragonfly_client_util::headers::fill_headers;
use dragonfly_client_util::limiter::RateLimiter;
use dragonfly_client_util::net::check_connect;
use dragonfly_client_util::rate::parse_rate_limit;
use rand::seq::SliceRandom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// CONNECT_PROBE_TIMEOUT bounds how long a single supernode reachability
/// probe is allowed to take while hunting for the first live node.
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(600);
/// PIECE_SERVER_SPAWN_TIMEOUT bounds how long a session waits for a
/// freshly re-exec'd piece server to report its bound port on stdout.
const PIECE_SERVER_SPAWN_TIMEOUT: Duration = Duration::from_secs(5);
/// MIN_FREE_SPACE is added on top of the file length when asserting the
/// data directory has enough room.
const MIN_FREE_SPACE: u64 = 100 * 1024 * 1024;

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "UNKNOWN".to_string())
}

fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// run drives a single download session end to end: resolve the
/// environment, register with a supernode, make sure a piece server is
/// listening locally, run the scheduler, and fall back to a direct
/// source download if the p2p path gave up. The returned code is the
/// process exit code the caller should use.
pub async fn run(args: Args) -> i32 {
    match run_inner(&args).await {
        Ok(code) => code,
        Err(err) => {
            warn!(error = %err, "session failed before a back reason could be recorded");
            1
        }
    }
}

async fn run_inner(args: &Args) -> Result<i32> {
    args.validate()?;

    let home = Home::resolve()?;
    home.create_directories()?;

    let mut nodes = resolve_nodes(args)?;
    nodes.shuffle(&mut rand::thread_rng());

    let Some((entry_node, local_ip)) = probe_first_reachable(&nodes).await else {
        return Ok(BackReason::NodeEmpty.code() as i32);
    };
    nodes.retain(|n| n != &entry_node);
    nodes.insert(0, entry_node);

    let back_reason = Arc::new(BackReasonCell::new());
    let output = args.resolved_output();
    let real_target = PathBuf::from(&output);
    let sign = dragonfly_client_storage::execute_sign(std::process::id(), now_epoch_seconds());
    let cid = dragonfly_client_storage::cid(&local_ip, &sign);

    let (data_dir, mirror_target) = resolve_data_dir(&home, &real_target)?;
    let paths = TaskPaths::new(real_target.as_path(), data_dir.as_path(), &sign);

    let piece_server_port =
        ensure_piece_server(args, &home, &data_dir, &paths.task_file_name).await?;

    let header_map = fill_headers(&args.header);
    let headers_json = (!header_map.is_empty())
        .then(|| serde_json::to_string(&header_map).unwrap_or_default());
    let task_url = filtered_url(args.url.as_deref().unwrap_or_default(), &args.filter_fields());

    let register_req = RegisterRequest {
        raw_url: args.url.clone().unwrap_or_default(),
        task_url,
        md5: args.md5.clone(),
        identifier: args.identifier_for_register().map(str::to_string),
        port: piece_server_port,
        path: format!("{PEER_HTTP_PATH_PREFIX}{}", paths.task_file_name),
        call_system: args.call_system(),
        cid: cid.clone(),
        ip: local_ip,
        host_name: hostname(),
        headers: headers_json,
        dfdaemon: args.dfdaemon,
    };

    let supernode = Arc::new(SupernodeClient::new()?);
    let outcome = match supernode.register(&mut nodes, &register_req).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "register failed on every node");
            back_reason.set(BackReason::RegisterFail);
            return finish(args, &back_reason, &real_target).await;
        }
    };

    let paths = match assert_free_space(&data_dir, &real_target, outcome.file_length as u64)? {
        Some(redirected) => {
            info!(data_dir = %redirected.display(), "data dir lacks space, redirecting into target directory");
            let bind_ip = resolve_bind_ip(args);
            if !notify_check(&bind_ip, piece_server_port, &paths.task_file_name, &redirected).await {
                warn!("piece server did not acknowledge the redirected data dir");
            }
            TaskPaths::new(real_target.as_path(), redirected.as_path(), &sign)
        }
        None => paths,
    };

    let local_rate_limit = args
        .locallimit
        .as_deref()
        .map(parse_rate_limit)
        .transpose()?;
    let total_rate_limit = args
        .effective_total_limit()
        .map(parse_rate_limit)
        .transpose()?;
    let rate_limiter = Arc::new(RateLimiter::new(
        local_rate_limit.or(total_rate_limit).unwrap_or(0),
    ));

    let location = Arc::new(RwLock::new(SessionLocation {
        node: outcome.node.clone(),
        task_id: outcome.task_id.clone(),
    }));

    let (writer_tx, writer_join) = ServiceWriter::spawn(
        &paths,
        mirror_target.clone(),
        outcome.piece_size,
        supernode.clone(),
        location.clone(),
        cid.clone(),
        back_reason.clone(),
    )?;

    let scheduler = Scheduler {
        supernode,
        http: reqwest::Client::new(),
        rate_limiter,
        cid,
        location,
        back_reason: back_reason.clone(),
        register_req,
        nodes,
        local_rate_limit,
        paths,
        mirror_target,
        real_target: real_target.clone(),
        expected_md5: args.md5.clone(),
    };

    let piece_size_history = [outcome.piece_size, outcome.piece_size];
    let result = scheduler
        .run(
            writer_tx,
            writer_join,
            piece_size_history,
            outcome.task_id,
            outcome.node,
        )
        .await?;

    if !result.success && !back_reason.is_set() {
        back_reason.set(BackReason::DownError);
    }

    finish(args, &back_reason, &real_target).await
}

/// finish maps a recorded back reason to the process exit code,
/// running the back-to-source fallback first unless `--notbs` was
/// given (in which case the reason is tagged so the exit code still
/// reflects that p2p failed, just not why the fallback wasn't tried).
async fn finish(
    args: &Args,
    back_reason: &Arc<BackReasonCell>,
    real_target: &Path,
) -> Result<i32> {
    if !back_reason.is_set() {
        return Ok(0);
    }

    if args.notbs {
        back_reason.add_notbs_addition();
        return Ok(back_reason.exit_code());
    }

    info!(reason = ?back_reason.get(), "p2p download failed, falling back to source");
    let backend = HttpBackend::new();
    let rate_limiter = Arc::new(RateLimiter::new(
        args.totallimit
            .as_deref()
            .map(parse_rate_limit)
            .transpose()?
            .unwrap_or(0),
    ));
    let target_dir = real_target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let request = DownloadRequest {
        url: args.url.clone().unwrap_or_default(),
        headers: fill_headers(&args.header),
        target_dir,
        expected_md5: args.md5.clone(),
        rate_limiter,
    };

    match backend.download(request).await {
        Ok(result) => {
            if let Some(parent) = real_target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&result.staged_path, real_target)?;
            Ok(0)
        }
        Err(err) => {
            warn!(error = %err, "back-to-source download failed");
            back_reason.force(BackReason::SourceError);
            Ok(back_reason.exit_code())
        }
    }
}

/// resolve_nodes prefers `--node`, falling back to the bootstrap config
/// file the way the original client did.
fn resolve_nodes(args: &Args) -> Result<Vec<String>> {
    if let Some(nodes) = args.nodes_from_flag() {
        return Ok(nodes);
    }
    NodeConfig::load(Path::new(dragonfly_client_config::node::DEFAULT_CONFIG_PATH))?.require()
}

/// probe_first_reachable returns the first node that accepts a TCP
/// connect, along with the local address that connection bound (this
/// host's outbound IP as seen by the supernode).
#[instrument(skip(nodes))]
async fn probe_first_reachable(nodes: &[String]) -> Option<(String, String)> {
    for node in nodes {
        if let Some(ip) = check_connect(node, SUPERNODE_PORT, CONNECT_PROBE_TIMEOUT).await {
            return Some((node.clone(), ip));
        }
    }
    None
}

/// filtered_url strips the query params named in `filter` from `url`,
/// matching `--filter key&sign`.
fn filtered_url(url: &str, filter: &[String]) -> String {
    if filter.is_empty() {
        return url.to_string();
    }
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or(pair);
            !filter.iter().any(|f| f == key)
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

/// resolve_data_dir decides between writing the service file straight
/// into the default data directory and across-write mode: when the
/// data dir and the target's directory live on different filesystems
/// (or devices), the across-write path gives the scheduler a mirror
/// file already on the target's filesystem so the final rename is
/// local, not a cross-device copy.
fn resolve_data_dir(home: &Home, real_target: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let target_dir = real_target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(target_dir)?;

    let data_dir_dev = std::fs::metadata(&home.data_dir)?.dev();
    let target_dev = std::fs::metadata(target_dir)?.dev();

    if data_dir_dev == target_dev {
        return Ok((home.data_dir.clone(), None));
    }

    let mirror = target_dir.join(format!(
        ".{}.dfget-mirror",
        real_target.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    ));
    Ok((home.data_dir.clone(), Some(mirror)))
}

/// assert_free_space checks whether `data_dir` has room for the
/// declared file length plus headroom. When it doesn't, but the target
/// directory's filesystem has at least twice that much free, this
/// returns that directory as a replacement data dir instead of
/// failing outright; the caller is expected to repoint the task at it.
fn assert_free_space(data_dir: &Path, real_target: &Path, file_length: u64) -> Result<Option<PathBuf>> {
    let needed = file_length + MIN_FREE_SPACE;
    let available = fs2::available_space(data_dir)?;
    if available >= needed {
        return Ok(None);
    }

    let target_dir = real_target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let target_needed = 2 * file_length + MIN_FREE_SPACE;
    let target_available = fs2::available_space(target_dir)?;
    if target_available >= target_needed {
        return Ok(Some(target_dir.to_path_buf()));
    }

    Err(Error::SpaceLackError(format!(
        "{available} available in data dir, need at least {needed}; \
         {target_available} available in target dir, need at least {target_needed}"
    )))
}

/// resolve_bind_ip is the local address the piece server listens on.
fn resolve_bind_ip(args: &Args) -> String {
    args.bind_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string())
}

/// ensure_piece_server returns a piece server port this host can serve
/// pieces from, reusing whichever one the meta file remembers if it is
/// still alive, and otherwise re-exec'ing this binary with
/// `--internal-piece-server` so the server keeps running after this
/// session process exits.
async fn ensure_piece_server(
    args: &Args,
    home: &Home,
    data_dir: &Path,
    tfn: &str,
) -> Result<u16> {
    let meta = dragonfly_client_storage::MetaFile::new(home.meta_path());
    let bind_ip = resolve_bind_ip(args);

    if let Some(port) = meta
        .load()
        .get("servicePort")
        .and_then(|v| v.as_u64())
        .and_then(|p| u16::try_from(p).ok())
    {
        if notify_check(&bind_ip, port, tfn, data_dir).await {
            return Ok(port);
        }
    }

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--internal-piece-server")
        .arg("--task-file-name")
        .arg(tfn)
        .arg("--bind-ip")
        .arg(&bind_ip)
        .arg("--data-dir")
        .arg(data_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null());
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = Command::from(command).spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::DirError("piece server child has no stdout".into()))?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let port = tokio::time::timeout(PIECE_SERVER_SPAWN_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Error::DirError("piece server did not report a port in time".into()))??
        .ok_or_else(|| Error::DirError("piece server exited before reporting a port".into()))?
        .trim()
        .parse::<u16>()
        .map_err(|e| Error::ParamError(e.to_string()))?;

    // Drop our handle to the child: `process_group(0)` detaches it from
    // this session so it survives after the session process exits.
    drop(child);

    let mut data = meta.load();
    data.insert("servicePort".to_string(), serde_json::Value::from(port));
    if let Err(err) = meta.dump(&data) {
        warn!(error = %err, "failed to persist servicePort");
    }

    Ok(port)
}

/// notify_check probes `/check/<tfn>` on an already-running piece
/// server, both confirming it is alive and telling it where this
/// session's data directory is.
async fn notify_check(bind_ip: &str, port: u16, tfn: &str, data_dir: &Path) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };
    let url = format!("http://{bind_ip}:{port}/check/{tfn}");
    let param = serde_json::json!({"dataDir": data_dir.display().to_string(), "totalLimit": 0});
    let Ok(response) = client.get(&url).header("param", param.to_string()).send().await else {
        return false;
    };
    response.status().is_success()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_url_strips_named_query_params() {
        let url = "http://example.com/f?key=abc&sign=xyz&keep=1";
        let filtered = filtered_url(url, &["key".to_string(), "sign".to_string()]);
        assert_eq!(filtered, "http://example.com/f?keep=1");
    }

    #[test]
    fn filtered_url_drops_empty_query_entirely() {
        let url = "http://example.com/f?key=abc";
        let filtered = filtered_url(url, &["key".to_string()]);
        assert_eq!(filtered, "http://example.com/f");
    }

    #[test]
    fn filtered_url_is_a_no_op_without_a_filter() {
        let url = "http://example.com/f?key=abc";
        assert_eq!(filtered_url(url, &[]), url);
    }

    #[test]
    fn resolve_data_dir_keeps_the_default_dir_on_the_same_device() {
        let dir = tempfile::TempDir::new().unwrap();
        let home = Home {
            usr_home: dir.path().to_path_buf(),
            data_dir: dir.path().join("data"),
            meta_dir: dir.path().join("meta"),
            log_dir: dir.path().join("logs"),
        };
        std::fs::create_dir_all(&home.data_dir).unwrap();
        let target = dir.path().join("out").join("file.bin");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();

        let (data_dir, mirror) = resolve_data_dir(&home, &target).unwrap();
        assert_eq!(data_dir, home.data_dir);
        assert!(mirror.is_none());
    }
}
