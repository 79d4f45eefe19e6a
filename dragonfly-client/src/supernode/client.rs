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

use crate::supernode::protocol::{
    PullResponse, RegisterResponse, RESULT_INVALID, SCHEMA_HTTP, SUCCESS, SUPERNODE_PORT,
    TASK_CODE_CONTINUE, TASK_CODE_FINISH, TASK_CODE_LIMITED, TASK_CODE_NEED_AUTH,
    TASK_CODE_WAIT, TASK_CODE_WAIT_AUTH, TASK_STATUS_START,
};
use dragonfly_client_config::VERSION;
use dragonfly_client_core::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};

const ADAPTER_RETRIES: usize = 2;
const REGISTER_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs_f64(2.0);
const WAIT_AUTH_BACKOFF: Duration = Duration::from_millis(2500);

/// RegisterRequest carries every field the supernode's `/peer/registry`
/// expects, minus the per-node `superNodeIp` added at send time.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub raw_url: String,
    pub task_url: String,
    pub md5: Option<String>,
    pub identifier: Option<String>,
    pub port: u16,
    pub path: String,
    pub call_system: String,
    pub cid: String,
    pub ip: String,
    pub host_name: String,
    pub headers: Option<String>,
    pub dfdaemon: bool,
}

impl RegisterRequest {
    fn form_fields(&self, node: &str) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("rawUrl", self.raw_url.clone()),
            ("taskUrl", self.task_url.clone()),
        ];
        if let Some(md5) = &self.md5 {
            fields.push(("md5", md5.clone()));
        } else if let Some(identifier) = &self.identifier {
            fields.push(("identifier", identifier.clone()));
        }
        fields.push(("version", VERSION.to_string()));
        fields.push(("port", self.port.to_string()));
        fields.push(("path", self.path.clone()));
        fields.push(("callSystem", self.call_system.clone()));
        fields.push(("cid", self.cid.clone()));
        fields.push(("ip", self.ip.clone()));
        fields.push(("hostName", self.host_name.clone()));
        if let Some(headers) = &self.headers {
            fields.push(("headers", headers.clone()));
        }
        fields.push((
            "dfdaemon",
            if self.dfdaemon { "true" } else { "false" }.to_string(),
        ));
        fields.push(("superNodeIp", node.to_string()));
        fields
    }
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub node: String,
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: u32,
}

/// PullState is the scheduler's view of in-flight progress, sent back
/// to the supernode on every `/peer/task` poll so it can tell which
/// range just completed.
#[derive(Debug, Clone)]
pub struct PullState {
    pub task_id: String,
    pub super_node: String,
    pub cid: String,
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: i32,
    pub status: i32,
}

impl PullState {
    pub fn start(task_id: String, super_node: String, cid: String) -> Self {
        Self {
            task_id,
            super_node,
            cid,
            src_cid: String::new(),
            dst_cid: String::new(),
            range: String::new(),
            result: RESULT_INVALID,
            status: TASK_STATUS_START,
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("taskId", self.task_id.clone()),
            ("superNode", self.super_node.clone()),
            ("cid", self.cid.clone()),
            ("srcCid", self.src_cid.clone()),
            ("dstCid", self.dst_cid.clone()),
            ("range", self.range.clone()),
            ("result", self.result.to_string()),
            ("status", self.status.to_string()),
        ]
    }
}

/// SupernodeClient wraps the handful of HTTP calls a session makes
/// against its current supernode: register, pull a piece task, report
/// a successful piece, and report the service going down.
pub struct SupernodeClient {
    http: reqwest::Client,
}

impl SupernodeClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    /// register iterates `nodes` (consuming it, first to last), POSTing
    /// to each in turn until one accepts the task or the list is
    /// exhausted. A `NEED_AUTH` response ends the whole process with
    /// exit code 22, matching the supernode's hard authentication wall.
    #[instrument(skip(self, nodes, req))]
    pub async fn register(
        &self,
        nodes: &mut Vec<String>,
        req: &RegisterRequest,
    ) -> Result<RegisterOutcome> {
        let mut last: Option<RegisterResponse> = None;
        let mut last_node = String::new();

        while !nodes.is_empty() {
            let node = nodes.remove(0);
            last_node = node.clone();
            info!(node, remaining = nodes.len(), "registering with supernode");
            match self.register_once(&node, req).await {
                Ok(resp) => {
                    let code = resp.code;
                    last = Some(resp);
                    if code == SUCCESS || code == TASK_CODE_NEED_AUTH {
                        break;
                    }
                }
                Err(err) => warn!(node, error = %err, "register attempt failed"),
            }
        }

        let response =
            last.ok_or_else(|| Error::DownError("no supernode accepted registration".into()))?;
        if response.code == TASK_CODE_NEED_AUTH {
            std::process::exit(22);
        }
        if response.code != SUCCESS {
            return Err(Error::DownError(format!(
                "register result code {}",
                response.code
            )));
        }
        let data = response
            .data
            .ok_or_else(|| Error::DownError("register succeeded with no data".into()))?;

        Ok(RegisterOutcome {
            node: last_node,
            task_id: data.task_id,
            file_length: data.file_length,
            piece_size: data.piece_size,
        })
    }

    async fn register_once(&self, node: &str, req: &RegisterRequest) -> Result<RegisterResponse> {
        loop {
            let url = format!("{SCHEMA_HTTP}://{node}:{SUPERNODE_PORT}/peer/registry");
            let fields = req.form_fields(node);
            let response = send_with_retries(|| {
                self.http
                    .post(&url)
                    .form(&fields)
                    .timeout(REGISTER_READ_TIMEOUT)
                    .send()
            })
            .await?
            .error_for_status()?;
            let parsed: RegisterResponse = response.json().await?;
            if parsed.code == TASK_CODE_WAIT_AUTH {
                info!(node, "supernode asked to wait for auth");
                tokio::time::sleep(WAIT_AUTH_BACKOFF).await;
                continue;
            }
            return Ok(parsed);
        }
    }

    async fn pull_once(&self, state: &PullState) -> Result<PullResponse> {
        loop {
            let url = format!(
                "{SCHEMA_HTTP}://{}:{SUPERNODE_PORT}/peer/task",
                state.super_node
            );
            let pairs = state.query_pairs();
            let response = send_with_retries(|| {
                self.http
                    .get(&url)
                    .query(&pairs)
                    .timeout(DEFAULT_READ_TIMEOUT)
                    .send()
            })
            .await?
            .error_for_status()?;
            let parsed: PullResponse = response.json().await?;
            if parsed.code == TASK_CODE_WAIT {
                let sleep_s = rand::thread_rng().gen_range(0.6..2.0);
                tokio::time::sleep(Duration::from_secs_f64(sleep_s)).await;
                continue;
            }
            return Ok(parsed);
        }
    }

    /// pull_piece_task polls the current supernode for the next batch
    /// of piece work. When the response code is not recognized, it
    /// migrates: re-registers with a remaining node and retries, up to
    /// once per remaining node (an iterative stand-in for the
    /// originally-recursive migration retry).
    #[instrument(skip(self, state, nodes, register_req, piece_size_history))]
    pub async fn pull_piece_task(
        &self,
        state: &mut PullState,
        nodes: &mut Vec<String>,
        register_req: &RegisterRequest,
        piece_size_history: &mut [u32; 2],
    ) -> Result<PullResponse> {
        let retry_budget = nodes.len() + 1;
        for attempt in 0..retry_budget {
            let resp = match self.pull_once(state).await {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(error = %err, attempt, "pull piece task request failed");
                    PullResponse {
                        code: -1,
                        data: None,
                    }
                }
            };
            if matches!(
                resp.code,
                TASK_CODE_CONTINUE | TASK_CODE_FINISH | TASK_CODE_LIMITED | SUCCESS
            ) {
                return Ok(resp);
            }

            warn!(code = resp.code, attempt, "pull piece task migrating");
            let migrated = self.register(nodes, register_req).await?;
            state.super_node = migrated.node.clone();
            state.task_id = migrated.task_id.clone();
            piece_size_history[1] = migrated.piece_size;
            state.status = TASK_STATUS_START;
        }
        Err(Error::DownError(
            "pull piece task failed after exhausting every node".into(),
        ))
    }

    /// suc_piece is a best-effort notification; failures are logged
    /// and otherwise ignored.
    pub async fn suc_piece(&self, task_id: &str, cid: &str, dst_cid: &str, range: &str, node: &str) {
        let url = format!("{SCHEMA_HTTP}://{node}:{SUPERNODE_PORT}/peer/piece/suc");
        let pairs = [
            ("taskId", task_id),
            ("cid", cid),
            ("dstCid", dst_cid),
            ("pieceRange", range),
        ];
        if let Err(err) = self
            .http
            .get(&url)
            .query(&pairs)
            .timeout(DEFAULT_READ_TIMEOUT)
            .send()
            .await
        {
            warn!(error = %err, "suc piece report failed");
        }
    }

    /// down_service is a best-effort notification that the local
    /// service for `task_id` is going away.
    pub async fn down_service(&self, task_id: &str, cid: &str, node: &str) {
        if node.is_empty() || node == "UNKNOWN" || task_id.is_empty() || task_id == "UNKNOWN" {
            return;
        }
        let url = format!("{SCHEMA_HTTP}://{node}:{SUPERNODE_PORT}/peer/service/down");
        let pairs = [("taskId", task_id), ("cid", cid)];
        if let Err(err) = self
            .http
            .get(&url)
            .query(&pairs)
            .timeout(DEFAULT_READ_TIMEOUT)
            .send()
            .await
        {
            warn!(error = %err, "down service report failed");
        }
    }
}

/// send_with_retries re-issues `make_request` up to `ADAPTER_RETRIES`
/// additional times on transport-level failure (connection refused,
/// timeout, DNS), mirroring the original client's adapter-level retry
/// count. It never retries an HTTP response that merely carries an
/// error status.
async fn send_with_retries<F, Fut>(mut make_request: F) -> reqwest::Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = reqwest::Result<reqwest::Response>>,
{
    let mut attempt = 0;
    loop {
        match make_request().await {
            Ok(resp) => return Ok(resp),
            Err(err) if attempt < ADAPTER_RETRIES && !err.is_status() => {
                attempt += 1;
                warn!(attempt, error = %err, "retrying supernode request");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supernode::protocol::RESULT_SEMISUC;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> RegisterRequest {
        RegisterRequest {
            raw_url: "http://example.com/f".to_string(),
            task_url: "http://example.com/f".to_string(),
            md5: None,
            identifier: None,
            port: 16000,
            path: "/peer/file/tfn".to_string(),
            call_system: "UNKNOWN".to_string(),
            cid: "cid-1".to_string(),
            ip: "10.0.0.1".to_string(),
            host_name: "host".to_string(),
            headers: None,
            dfdaemon: false,
        }
    }

    #[tokio::test]
    async fn register_succeeds_on_first_responsive_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/peer/registry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": SUCCESS,
                "data": {"taskId": "task-1", "fileLength": 1024, "pieceSize": 4194304},
            })))
            .mount(&server)
            .await;

        let client = SupernodeClient::new().unwrap();
        let host = format!("127.0.0.1:{}", server.address().port());
        let mut nodes = vec![host.clone()];
        let outcome = client.register(&mut nodes, &sample_request()).await.unwrap();

        assert_eq!(outcome.task_id, "task-1");
        assert_eq!(outcome.piece_size, 4194304);
        assert_eq!(outcome.node, host);
    }

    #[tokio::test]
    async fn register_fails_when_no_node_responds_successfully() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/peer/registry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 500,
                "data": null,
            })))
            .mount(&server)
            .await;

        let client = SupernodeClient::new().unwrap();
        let mut nodes = vec![format!("127.0.0.1:{}", server.address().port())];
        assert!(client.register(&mut nodes, &sample_request()).await.is_err());
    }

    #[tokio::test]
    async fn pull_piece_task_returns_continue_without_migrating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/peer/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": TASK_CODE_CONTINUE,
                "data": [],
            })))
            .mount(&server)
            .await;

        let client = SupernodeClient::new().unwrap();
        let host = format!("127.0.0.1:{}", server.address().port());
        let mut state = PullState::start("task-1".to_string(), host, "cid-1".to_string());
        state.result = RESULT_SEMISUC;
        let mut nodes = vec![];
        let mut history = [4194304u32, 4194304u32];

        let resp = client
            .pull_piece_task(&mut state, &mut nodes, &sample_request(), &mut history)
            .await
            .unwrap();
        assert_eq!(resp.code, TASK_CODE_CONTINUE);
    }
}
