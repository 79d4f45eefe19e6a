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

use crate::piece::ResultItem;
use crate::supernode::protocol::{parse_piece_md5, PieceTaskWire, RANGE_NOT_EXIST_DESC, RESULT_FAIL, RESULT_SEMISUC, TASK_STATUS_RUNNING};
use bytes::{Bytes, BytesMut};
use dragonfly_client_util::digest::Md5Computer;
use dragonfly_client_util::limiter::RateLimiter;
use dragonfly_client_util::net::check_connect;
use futures::StreamExt;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// FETCH_CHUNK_SIZE is the read granularity the rate limiter is
/// charged against, fixed regardless of how large the actual chunk
/// read from the socket turns out to be.
const FETCH_CHUNK_SIZE: u64 = 256 * 1024;

const PEER_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

/// fetch_piece runs the full lifecycle of downloading one assigned
/// piece from its peer: reachability probe, ranged GET, rate-limited
/// streaming read, and an MD5 check against the supernode's declared
/// digest. The returned item always carries `task.range`; only a
/// successful fetch carries `piece_cont`.
#[instrument(skip(http, task, rate_limiter), fields(range = %task.range, peer = %task.peer_ip))]
pub async fn fetch_piece(
    http: &reqwest::Client,
    task: &PieceTaskWire,
    task_id: &str,
    cid: &str,
    supernode_host: &str,
    rate_limiter: &RateLimiter,
) -> ResultItem {
    let Some((expected_md5, piece_len)) = parse_piece_md5(&task.piece_md5) else {
        warn!(piece_md5 = %task.piece_md5, "malformed pieceMd5, failing fetch");
        return fail_item(task, task_id);
    };

    let from_supernode = task.peer_ip == supernode_host;
    let read_budget = if from_supernode {
        Duration::from_secs_f64(piece_len as f64 / (128.0 * 1024.0) + 1.0)
    } else {
        Duration::from_secs_f64(piece_len as f64 / (1.5 * 1024.0 * 1024.0) + 1.0)
    };

    if !from_supernode
        && check_connect(&task.peer_ip, task.peer_port, PEER_CONNECT_TIMEOUT)
            .await
            .is_none()
    {
        return fail_item(task, task_id);
    }

    let piece_start = task.piece_num as u64 * task.piece_size as u64;
    let piece_end = piece_start + piece_len as u64 - 1;
    let real_range = format!("{piece_start}-{piece_end}");

    let url = format!("http://{}:{}{}", task.peer_ip, task.peer_port, task.path);
    let start = Instant::now();
    match read_piece(http, &url, &real_range, task.piece_num, task.piece_size, read_budget, rate_limiter).await {
        Ok(framed) => {
            let actual = {
                let mut hasher = Md5Computer::new();
                hasher.update(&framed);
                hasher.finalize_hex()
            };
            if actual == expected_md5 {
                success_item(task, task_id, cid, framed)
            } else {
                warn!(expected_md5, actual, "piece md5 mismatch");
                fail_item(task, task_id)
            }
        }
        Err(err) => {
            warn!(error = %err, elapsed = ?start.elapsed(), "piece fetch failed");
            if from_supernode && err.to_string().to_lowercase().contains(RANGE_NOT_EXIST_DESC) {
                let backoff = rand::thread_rng().gen_range(1.0..3.0);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
            fail_item(task, task_id)
        }
    }
}

async fn read_piece(
    http: &reqwest::Client,
    url: &str,
    range: &str,
    piece_num: u32,
    piece_size: u32,
    read_budget: Duration,
    rate_limiter: &RateLimiter,
) -> dragonfly_client_core::Result<Bytes> {
    // No total `.timeout()` here: `read_budget` below is the total
    // deadline for the whole transfer. `PEER_REQUEST_TIMEOUT` instead
    // bounds the gap between successive chunks, so a peer that goes
    // silent mid-stream is caught without also failing large, slow
    // pieces that are still making progress.
    let response = http
        .get(url)
        .header("Range", format!("bytes={range}"))
        .header("pieceNum", piece_num.to_string())
        .header("pieceSize", piece_size.to_string())
        .send()
        .await?
        .error_for_status()?;

    let start = Instant::now();
    let mut buf = BytesMut::new();
    let mut stream = response.bytes_stream();
    loop {
        let next = match tokio::time::timeout(PEER_REQUEST_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err(dragonfly_client_core::Error::ReadTimeoutError(format!(
                    "range {range} went idle for longer than {PEER_REQUEST_TIMEOUT:?}"
                )));
            }
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if start.elapsed() > read_budget {
            return Err(dragonfly_client_core::Error::ReadTimeoutError(format!(
                "range {range} exceeded its read budget of {read_budget:?}"
            )));
        }
        buf.extend_from_slice(&chunk);
        rate_limiter.acquire(FETCH_CHUNK_SIZE, true).await;
    }
    Ok(buf.freeze())
}

fn fail_item(task: &PieceTaskWire, task_id: &str) -> ResultItem {
    ResultItem {
        task_id: task_id.to_string(),
        super_node: String::new(),
        src_cid: String::new(),
        dst_cid: task.cid.clone(),
        range: task.range.clone(),
        result: RESULT_FAIL,
        status: TASK_STATUS_RUNNING,
        piece_cont: None,
        piece_size: Some(task.piece_size),
        piece_num: Some(task.piece_num),
    }
}

fn success_item(task: &PieceTaskWire, task_id: &str, cid: &str, framed: Bytes) -> ResultItem {
    ResultItem {
        task_id: task_id.to_string(),
        super_node: String::new(),
        src_cid: cid.to_string(),
        dst_cid: task.cid.clone(),
        range: task.range.clone(),
        result: RESULT_SEMISUC,
        status: TASK_STATUS_RUNNING,
        piece_cont: Some(framed),
        piece_size: Some(task.piece_size),
        piece_num: Some(task.piece_num),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::codec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_task(peer_ip: String, peer_port: u16, path: String, piece_md5: String) -> PieceTaskWire {
        PieceTaskWire {
            range: "0-99".to_string(),
            peer_ip,
            peer_port,
            path,
            piece_num: 0,
            piece_size: 4 * 1024 * 1024,
            piece_md5,
            cid: "peer-cid".to_string(),
            down_link: None,
        }
    }

    #[tokio::test]
    async fn successful_fetch_verifies_md5_and_returns_semisuc() {
        let server = MockServer::start().await;
        let framed = codec::encode(b"piece body", 4 * 1024 * 1024);
        let mut hasher = Md5Computer::new();
        hasher.update(&framed);
        let md5 = hasher.finalize_hex();

        Mock::given(method("GET"))
            .and(path("/peer/file/tfn"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(framed.clone()))
            .mount(&server)
            .await;

        let host_header = server.address().ip().to_string();
        let task = sample_task(host_header, server.address().port(), "/peer/file/tfn".to_string(), format!("{md5}:{}", framed.len()));

        let http = reqwest::Client::new();
        let limiter = RateLimiter::new(0);
        let item = fetch_piece(&http, &task, "task-1", "my-cid", "unrelated-supernode", &limiter).await;

        assert_eq!(item.result, RESULT_SEMISUC);
        assert_eq!(item.piece_cont.unwrap(), framed);
    }

    #[tokio::test]
    async fn md5_mismatch_yields_fail_result() {
        let server = MockServer::start().await;
        let framed = codec::encode(b"piece body", 4 * 1024 * 1024);

        Mock::given(method("GET"))
            .and(path("/peer/file/tfn"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(framed))
            .mount(&server)
            .await;

        let task = sample_task(
            server.address().ip().to_string(),
            server.address().port(),
            "/peer/file/tfn".to_string(),
            "deadbeefdeadbeefdeadbeefdeadbeef:15".to_string(),
        );

        let http = reqwest::Client::new();
        let limiter = RateLimiter::new(0);
        let item = fetch_piece(&http, &task, "task-1", "my-cid", "unrelated-supernode", &limiter).await;

        assert_eq!(item.result, RESULT_FAIL);
        assert!(item.piece_cont.is_none());
    }

    #[tokio::test]
    async fn unreachable_peer_yields_fail_result_without_http_call() {
        let task = sample_task(
            "10.255.255.1".to_string(),
            9,
            "/peer/file/tfn".to_string(),
            "d41d8cd98f00b204e9800998ecf8427e:5".to_string(),
        );

        let http = reqwest::Client::new();
        let limiter = RateLimiter::new(0);
        let item = fetch_piece(&http, &task, "task-1", "my-cid", "some-supernode", &limiter).await;

        assert_eq!(item.result, RESULT_FAIL);
    }
}
