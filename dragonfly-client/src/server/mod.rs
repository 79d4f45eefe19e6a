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

pub mod gc;

use crate::piece::codec;
use crate::shutdown::{Shutdown, ShutdownTrigger};
use crate::supernode::client::SupernodeClient;
use dragonfly_client_config::VERSION;
use dragonfly_client_core::{Error, Result};
use dragonfly_client_util::limiter::RateLimiter;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument, warn};
use warp::http::{HeaderMap, Response, StatusCode};
use warp::Filter;

const SEED_PORT_LOW: u16 = 15000;
const SEED_PORT_HIGH: u16 = 65000;
const CHECK_PORT_TIMEOUT: Duration = Duration::from_secs(5);

/// TaskMeta is the piece server's per-TFN bookkeeping: where the task's
/// service file lives, its latest reported rate, and whether the task
/// is done (so the GC knows it may reclaim the file soon).
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    pub data_dir: PathBuf,
    pub rate_limit: u64,
    pub finished: bool,
    pub task_id: Option<String>,
    pub cid: Option<String>,
    pub super_node: Option<String>,
}

pub type TaskMap = Arc<Mutex<HashMap<String, TaskMeta>>>;

/// AliveSignal is the `alive_qu` of the design: every handled request
/// bumps it; the reaper treats a 5-minute silence as "nobody is using
/// this server anymore". `try_send` on a full channel is dropped
/// rather than blocking the request handler.
#[derive(Clone)]
pub struct AliveSignal(mpsc::Sender<()>);

pub struct AliveWatch(mpsc::Receiver<()>);

impl AliveSignal {
    pub fn new() -> (Self, AliveWatch) {
        let (tx, rx) = mpsc::channel(1024);
        (Self(tx), AliveWatch(rx))
    }

    fn bump(&self) {
        let _ = self.0.try_send(());
    }
}

impl AliveWatch {
    /// await_activity drains every pending bump then waits up to
    /// `timeout` for the next one, returning `true` if one arrived
    /// (the server is not idle) and `false` on timeout.
    pub async fn await_activity(&mut self, timeout: Duration) -> bool {
        while self.0.try_recv().is_ok() {}
        matches!(tokio::time::timeout(timeout, self.0.recv()).await, Ok(Some(())))
    }
}

/// seed_port mirrors the original client's `floor(now/300) mod
/// (65000-15000) + 15000`: the starting port for this host rotates
/// every 5 minutes so successive server generations don't collide
/// with a slow-to-exit predecessor.
pub fn seed_port(now_epoch_secs: u64) -> u16 {
    let span = (SEED_PORT_HIGH - SEED_PORT_LOW) as u64;
    SEED_PORT_LOW + ((now_epoch_secs / 300) % span) as u16
}

pub enum BindOutcome {
    Bound(TcpListener, u16),
    Reused(u16),
}

/// bind_piece_server walks the port range starting at `seed_port`,
/// binding the first free one. A port already in use is checked for a
/// live dragonfly piece server serving the same `tfn`; if it answers,
/// this invocation reuses that port instead of starting its own
/// listener.
#[instrument(skip(tfn))]
pub async fn bind_piece_server(bind_ip: &str, tfn: &str) -> Result<BindOutcome> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let base = seed_port(now);
    let span = SEED_PORT_HIGH - SEED_PORT_LOW;

    for offset in 0..span {
        let port = SEED_PORT_LOW + (base - SEED_PORT_LOW + offset) % span;
        let addr: SocketAddr = format!("{bind_ip}:{port}")
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::ParamError(e.to_string()))?;
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(BindOutcome::Bound(listener, port)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                if let Some(reused) = probe_existing(bind_ip, port, tfn).await {
                    info!(port, "reusing already-running peer server");
                    return Ok(BindOutcome::Reused(reused));
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::DirError(
        "no free port in the piece server's port range".into(),
    ))
}

async fn probe_existing(bind_ip: &str, port: u16, tfn: &str) -> Option<u16> {
    let client = reqwest::Client::builder()
        .timeout(CHECK_PORT_TIMEOUT)
        .build()
        .ok()?;
    let url = format!("http://{bind_ip}:{port}/check/{tfn}");
    let param = serde_json::json!({"dataDir": "", "totalLimit": 0});
    let response = client
        .get(&url)
        .header("param", param.to_string())
        .send()
        .await
        .ok()?;
    let text = response.text().await.ok()?;
    (text == format!("{tfn}@{VERSION}")).then_some(port)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckParam {
    data_dir: String,
    #[serde(default)]
    total_limit: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateParam {
    rate_limit: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishParam {
    tfn: String,
    task_id: String,
    cid: String,
    super_node: String,
}

fn parse_param<T: serde::de::DeserializeOwned>(headers: &HeaderMap) -> Option<T> {
    let raw = headers.get("param")?.to_str().ok()?;
    serde_json::from_str(raw).ok()
}

fn parse_byte_range(raw: &str) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// apportion is the server's per-client share of `total_limit`: an
/// unset or non-positive total means every client gets its own
/// requested rate back unmodified; otherwise each client's share is
/// `ceil(client_rate * total / sum_of_all_rates)`.
pub fn apportion(client_rate: u64, total_limit: i64, sum_of_rates: u64) -> u64 {
    if total_limit <= 0 || sum_of_rates == 0 {
        return client_rate;
    }
    let total = total_limit as u64;
    (client_rate.saturating_mul(total)).div_ceil(sum_of_rates)
}

async fn read_range(path: &std::path::Path, start: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[derive(Clone)]
struct ServerState {
    tasks: TaskMap,
    rate_limiter: Arc<RateLimiter>,
    total_limit: Arc<Mutex<i64>>,
    alive: AliveSignal,
}

async fn upload(
    tfn: String,
    headers: HeaderMap,
    state: ServerState,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    state.alive.bump();

    let data_dir = {
        let tasks = state.tasks.lock().await;
        tasks.get(&tfn).map(|t| t.data_dir.clone())
    };
    let Some(data_dir) = data_dir else {
        return Ok(not_found());
    };

    let piece_size: Option<u32> = headers
        .get("pieceSize")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());
    let piece_num: Option<u64> = headers
        .get("pieceNum")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());
    let range = headers
        .get(warp::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_byte_range);

    let (Some(piece_size), Some(piece_num), Some((start, end))) = (piece_size, piece_num, range)
    else {
        return Ok(not_found());
    };
    if end < start {
        return Ok(not_found());
    }

    // The requested range is in framed coordinates (it was derived from
    // the supernode's framed piece length); subtract the header+trailer
    // overhead the fetcher never sees on disk to find the raw offsets.
    let framing_overhead = (codec::HEADER_LEN + 1) as u64;
    let Some(raw_start) = start.checked_sub(piece_num * framing_overhead) else {
        return Ok(not_found());
    };
    let Some(raw_len) = (end - start + 1).checked_sub(framing_overhead) else {
        return Ok(not_found());
    };

    let service_path = data_dir.join(format!("{tfn}.service"));
    let body = match read_range(&service_path, raw_start, raw_len as usize).await {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, tfn, "piece range read failed");
            return Ok(not_found());
        }
    };

    state.rate_limiter.acquire(body.len() as u64, true).await;
    let framed = codec::encode(&body, piece_size);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(warp::http::header::CONNECTION, "keep-alive")
        .body(framed)
        .unwrap())
}

fn not_found() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Vec::new())
        .unwrap()
}

async fn check(
    tfn: String,
    headers: HeaderMap,
    state: ServerState,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    state.alive.bump();
    let Some(param) = parse_param::<CheckParam>(&headers) else {
        return Ok(warp::reply::with_status(
            String::new(),
            StatusCode::BAD_REQUEST,
        ));
    };

    {
        let mut tasks = state.tasks.lock().await;
        let entry = tasks.entry(tfn.clone()).or_default();
        entry.data_dir = PathBuf::from(param.data_dir);
    }
    if param.total_limit > 0 {
        *state.total_limit.lock().await = param.total_limit;
    }

    Ok(warp::reply::with_status(
        format!("{tfn}@{VERSION}"),
        StatusCode::OK,
    ))
}

async fn parse_rate(
    tfn: String,
    headers: HeaderMap,
    state: ServerState,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    state.alive.bump();
    let Some(param) = parse_param::<RateParam>(&headers) else {
        return Ok(warp::reply::with_status(
            String::new(),
            StatusCode::BAD_REQUEST,
        ));
    };

    let sum: u64 = {
        let mut tasks = state.tasks.lock().await;
        let entry = tasks.entry(tfn).or_default();
        entry.rate_limit = param.rate_limit;
        tasks.values().map(|t| t.rate_limit).sum()
    };
    let total_limit = *state.total_limit.lock().await;
    let share = apportion(param.rate_limit, total_limit, sum);

    Ok(warp::reply::with_status(share.to_string(), StatusCode::OK))
}

async fn finish(
    headers: HeaderMap,
    state: ServerState,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    state.alive.bump();
    let Some(param) = parse_param::<FinishParam>(&headers) else {
        return Ok(warp::reply::with_status(
            String::new(),
            StatusCode::BAD_REQUEST,
        ));
    };

    {
        let mut tasks = state.tasks.lock().await;
        let entry = tasks.entry(param.tfn).or_default();
        entry.finished = true;
        entry.task_id = Some(param.task_id);
        entry.cid = Some(param.cid);
        entry.super_node = Some(param.super_node);
    }

    Ok(warp::reply::with_status(String::new(), StatusCode::OK))
}

fn routes(
    state: ServerState,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let upload_route = warp::path!("peer" / "file" / String)
        .and(warp::get())
        .and(warp::header::headers_cloned())
        .and(with_state.clone())
        .and_then(upload);

    let check_route = warp::path!("check" / String)
        .and(warp::get())
        .and(warp::header::headers_cloned())
        .and(with_state.clone())
        .and_then(check);

    let rate_route = warp::path!("rate" / String)
        .and(warp::get())
        .and(warp::header::headers_cloned())
        .and(with_state.clone())
        .and_then(parse_rate);

    let finish_route = warp::path!("client" / "finish")
        .and(warp::get())
        .and(warp::header::headers_cloned())
        .and(with_state)
        .and_then(finish);

    upload_route.or(check_route).or(rate_route).or(finish_route)
}

/// serve runs the piece server until `shutdown` fires, driving the
/// listener accepted up-front by `bind_piece_server`.
pub async fn serve(
    listener: TcpListener,
    tasks: TaskMap,
    rate_limiter: Arc<RateLimiter>,
    alive: AliveSignal,
    mut shutdown: Shutdown,
) {
    let state = ServerState {
        tasks,
        rate_limiter,
        total_limit: Arc::new(Mutex::new(0)),
        alive,
    };
    let (addr, server) =
        warp::serve(routes(state)).bind_with_graceful_shutdown(
            listener.local_addr().expect("bound listener has a local addr"),
            async move {
                shutdown.recv().await;
            },
        );
    info!(%addr, "piece server listening");
    server.await;
}

/// run_standalone is the body of a re-exec'd `--internal-piece-server`
/// process: bind (or discover a reusable) port, print it as the first
/// line of stdout for the parent session to read, then serve until the
/// idle reaper decides to shut down.
pub async fn run_standalone(
    bind_ip: String,
    tfn: String,
    data_dir: PathBuf,
    meta_path: PathBuf,
) -> Result<()> {
    let outcome = bind_piece_server(&bind_ip, &tfn).await?;
    let (listener, port) = match outcome {
        BindOutcome::Bound(listener, port) => (Some(listener), port),
        BindOutcome::Reused(port) => (None, port),
    };

    println!("{port}");
    use std::io::Write;
    let _ = std::io::stdout().flush();

    let Some(listener) = listener else {
        return Ok(());
    };

    let tasks: TaskMap = Arc::new(Mutex::new(HashMap::new()));
    tasks.lock().await.insert(
        tfn,
        TaskMeta {
            data_dir,
            ..Default::default()
        },
    );

    let (alive_signal, alive_watch) = AliveSignal::new();
    let (trigger, shutdown) = ShutdownTrigger::new();
    let checker_lock = Arc::new(Mutex::new(()));
    let gc_lock = Arc::new(Mutex::new(()));
    let meta = Arc::new(dragonfly_client_storage::MetaFile::new(meta_path));
    let supernode = Arc::new(SupernodeClient::new()?);
    let rate_limiter = Arc::new(RateLimiter::new(0));
    let data_dir_for_gc = {
        let tasks = tasks.lock().await;
        tasks.values().next().map(|t| t.data_dir.clone())
    }
    .unwrap_or_default();

    tokio::spawn(gc::run_reaper(
        trigger,
        alive_watch,
        checker_lock,
        gc_lock.clone(),
        meta,
    ));
    tokio::spawn(gc::run_gc(
        data_dir_for_gc,
        tasks.clone(),
        gc_lock,
        supernode,
        shutdown.clone(),
    ));

    serve(listener, tasks, rate_limiter, alive_signal, shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_port_stays_in_range() {
        for secs in [0u64, 299, 300, 301, 86_400, 1_700_000_000] {
            let port = seed_port(secs);
            assert!((SEED_PORT_LOW..SEED_PORT_HIGH).contains(&port));
        }
    }

    #[test]
    fn apportion_passes_through_when_no_total_limit() {
        assert_eq!(apportion(500, 0, 1200), 500);
        assert_eq!(apportion(500, -1, 1200), 500);
    }

    #[test]
    fn apportion_scales_by_share_of_total() {
        // client asked for 500, total cap 1000, combined asks 1500 -> ceil(500*1000/1500)
        assert_eq!(apportion(500, 1000, 1500), 334);
    }

    /// Drives `upload` against a real on-disk service file the way the
    /// fetcher's `Range`/`pieceNum`/`pieceSize` headers are actually
    /// shaped, to pin down the framed-to-raw coordinate conversion the
    /// fetcher and the server have to agree on.
    #[tokio::test]
    async fn upload_converts_framed_range_to_raw_offsets() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("tfn-1.service"), b"ABCDEFGHIJ")
            .await
            .unwrap();

        let tasks: TaskMap = Default::default();
        tasks.lock().await.insert(
            "tfn-1".to_string(),
            TaskMeta {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        let state = ServerState {
            tasks,
            rate_limiter: Arc::new(RateLimiter::new(0)),
            total_limit: Arc::new(Mutex::new(0)),
            alive: AliveSignal::new().0,
        };

        // Second of two 5-byte raw pieces, each framed to 10 bytes
        // (5 raw + 4-byte header + 1-byte trailer): framed piece 1
        // spans bytes 10-19 on the wire, raw bytes 5-9 on disk.
        let mut headers = HeaderMap::new();
        headers.insert("pieceSize", warp::http::HeaderValue::from_static("10"));
        headers.insert("pieceNum", warp::http::HeaderValue::from_static("1"));
        headers.insert(
            warp::http::header::RANGE,
            warp::http::HeaderValue::from_static("bytes=10-19"),
        );

        let reply = upload("tfn-1".to_string(), headers, state).await.unwrap();
        let response = warp::Reply::into_response(reply);
        assert_eq!(response.status(), StatusCode::OK);

        let framed = warp::hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(codec::decode(&framed).unwrap(), b"FGHIJ");
    }

    #[tokio::test]
    async fn check_then_rate_round_trip_updates_task_map() {
        let tasks: TaskMap = Default::default();
        let state = ServerState {
            tasks: tasks.clone(),
            rate_limiter: Arc::new(RateLimiter::new(0)),
            total_limit: Arc::new(Mutex::new(0)),
            alive: AliveSignal::new().0,
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "param",
            warp::http::HeaderValue::from_str(
                &serde_json::json!({"dataDir": "/tmp/data", "totalLimit": 0}).to_string(),
            )
            .unwrap(),
        );
        let reply = check("tfn-1".to_string(), headers, state.clone()).await.unwrap();
        let response = warp::Reply::into_response(reply);
        assert_eq!(response.status(), StatusCode::OK);

        let map = tasks.lock().await;
        assert_eq!(map.get("tfn-1").unwrap().data_dir, PathBuf::from("/tmp/data"));
    }
}
