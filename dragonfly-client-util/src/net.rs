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

use std::time::Duration;
use tokio::net::TcpStream;

/// check_connect probes `(host, port)` with a TCP connect and returns
/// the local address it bound, mirroring `netutil.check_connect`. The
/// local address is used both as a reachability probe and, during
/// supernode selection, as this host's outbound IP.
pub async fn check_connect(host: &str, port: u16, timeout: Duration) -> Option<String> {
    let addr = format!("{host}:{port}");
    let connect = TcpStream::connect(&addr);
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream.local_addr().ok().map(|a| a.ip().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let ip = check_connect("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(ip.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn times_out_on_an_unroutable_address() {
        let ip = check_connect("10.255.255.1", 12345, Duration::from_millis(50)).await;
        assert!(ip.is_none());
    }
}
