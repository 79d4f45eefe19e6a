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

use crate::backend::{Backend, DownloadRequest, DownloadResult};
use dragonfly_client_core::{Error, Result};
use dragonfly_client_util::digest::Md5Computer;
use dragonfly_client_util::limiter::RateLimiter;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

/// STREAM_CHUNK_HINT is the buffer size the original back-source
/// downloader requested of the socket; reqwest's own streaming does
/// not guarantee this exact framing, so it is used here only as the
/// size of our own write buffer.
const STREAM_CHUNK_HINT: usize = 512 * 1024;

/// HttpBackend is the direct (non-p2p) origin backend used by the
/// back-to-source fallback. Per-socket read timeouts are disabled,
/// matching the original `socket.setdefaulttimeout(None)`: a
/// back-source download is the last resort and should not itself time
/// out mid-transfer.
pub struct HttpBackend {
    client: reqwest::Client,
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpBackend {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .expect("build reqwest client");
        Self { client }
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    #[instrument(skip_all, fields(url = %request.url))]
    async fn download(&self, request: DownloadRequest) -> Result<DownloadResult> {
        info!("back-source download started");

        let mut header_map = HeaderMap::new();
        for (key, value) in &request.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                header_map.insert(name, value);
            }
        }

        let response = self
            .client
            .get(&request.url)
            .headers(header_map)
            .send()
            .await?
            .error_for_status()?;

        std::fs::create_dir_all(&request.target_dir)?;
        let staged_path = request.target_dir.join(format!(
            "dfget-{}.backsource",
            uuid_like_suffix()
        ));
        let mut file = tokio::fs::File::create(&staged_path).await?;

        let mut hasher = request.expected_md5.as_ref().map(|_| Md5Computer::new());
        let mut total: u64 = 0;
        let mut buffered = Vec::with_capacity(STREAM_CHUNK_HINT);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            total += chunk.len() as u64;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            buffered.extend_from_slice(&chunk);
            request.rate_limiter.acquire(chunk.len() as u64, true).await;

            if buffered.len() >= STREAM_CHUNK_HINT {
                file.write_all(&buffered).await?;
                buffered.clear();
            }
        }
        if !buffered.is_empty() {
            file.write_all(&buffered).await?;
        }
        file.flush().await?;

        if let (Some(expected), Some(hasher)) = (request.expected_md5, hasher) {
            let actual = hasher.finalize_hex();
            if actual != expected {
                warn!(expected, actual, "back-source md5 mismatch");
                return Err(Error::Md5NotMatchError(format!(
                    "real:{actual} and expect:{expected}"
                )));
            }
        }

        info!(total_bytes = total, "back-source download finished");
        Ok(DownloadResult {
            staged_path,
            total_bytes: total,
        })
    }
}

fn uuid_like_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_body_and_verifies_md5() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let backend = HttpBackend::new();
        let result = backend
            .download(DownloadRequest {
                url: format!("{}/f", server.uri()),
                headers: Default::default(),
                target_dir: dir.path().to_path_buf(),
                expected_md5: Some("5eb63bbbe01eeed093cb22bb8f5acdc3".to_string()),
                rate_limiter: Arc::new(RateLimiter::new(0)),
            })
            .await
            .unwrap();

        assert_eq!(result.total_bytes, 11);
        let contents = std::fs::read(result.staged_path).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn md5_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/f"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let backend = HttpBackend::new();
        let result = backend
            .download(DownloadRequest {
                url: format!("{}/f", server.uri()),
                headers: Default::default(),
                target_dir: dir.path().to_path_buf(),
                expected_md5: Some("deadbeefdeadbeefdeadbeefdeadbeef".to_string()),
                rate_limiter: Arc::new(RateLimiter::new(0)),
            })
            .await;

        assert!(matches!(result, Err(Error::Md5NotMatchError(_))));
    }
}
