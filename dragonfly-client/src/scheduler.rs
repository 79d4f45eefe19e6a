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

use crate::piece::fetcher::fetch_piece;
use crate::piece::{ResultItem, WriterMsg};
use crate::supernode::client::{PullState, RegisterRequest, SupernodeClient};
use crate::supernode::protocol::{
    FinishData, PieceTaskWire, RESULT_FAIL, RESULT_INVALID, RESULT_SEMISUC, RESULT_SUC,
    TASK_CODE_CONTINUE, TASK_CODE_FINISH, TASK_CODE_LIMITED, TASK_STATUS_FINISH,
};
use dragonfly_client_core::error::BackReasonCell;
use dragonfly_client_core::{BackReason, Result};
use dragonfly_client_storage::TaskPaths;
use dragonfly_client_util::digest::md5_file;
use dragonfly_client_util::limiter::RateLimiter;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// SessionLocation is the scheduler's current supernode binding,
/// shared read-only with the service writer so its best-effort `suc`
/// reports always target whichever node the scheduler is presently
/// talking to.
#[derive(Debug, Clone, Default)]
pub struct SessionLocation {
    pub node: String,
    pub task_id: String,
}

const COLLECT_TIMEOUT: Duration = Duration::from_secs(2);
const RATE_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
/// MERGE_RUNNING_CEILING bounds how many in-flight pieces the scheduler
/// tolerates before pulling the supernode anyway, even with a
/// non-terminal last result and a still-busy local queue.
const MERGE_RUNNING_CEILING: usize = 2;

pub struct SchedulerOutcome {
    pub success: bool,
    pub total_bytes: u64,
}

/// Scheduler drives the pull-task loop: dispatch fetchers for offered
/// pieces, fold their results back into `running`/`success`, and hand
/// the assembled file off once the supernode reports `FINISH`.
pub struct Scheduler {
    pub supernode: Arc<SupernodeClient>,
    pub http: reqwest::Client,
    pub rate_limiter: Arc<RateLimiter>,
    pub cid: String,
    pub location: Arc<RwLock<SessionLocation>>,
    pub back_reason: Arc<BackReasonCell>,
    pub register_req: RegisterRequest,
    pub nodes: Vec<String>,
    pub local_rate_limit: Option<u64>,
    pub paths: TaskPaths,
    pub mirror_target: Option<PathBuf>,
    pub real_target: PathBuf,
    pub expected_md5: Option<String>,
}

impl Scheduler {
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn run(
        mut self,
        writer_tx: mpsc::Sender<WriterMsg>,
        writer_join: JoinHandle<Result<u64>>,
        mut piece_size_history: [u32; 2],
        task_id: String,
        super_node: String,
    ) -> Result<SchedulerOutcome> {
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ResultItem>();
        let mut state = PullState::start(task_id, super_node, self.cid.clone());
        let mut running: HashSet<String> = HashSet::new();
        let mut success: HashSet<String> = HashSet::new();
        let mut last_rate_refresh = Instant::now() - RATE_REFRESH_INTERVAL;

        let outcome = loop {
            let dequeued = tokio::time::timeout(COLLECT_TIMEOUT, result_rx.recv()).await;
            let mut pull_now = true;

            if let Ok(Some(item)) = dequeued {
                apply_result(&mut running, &mut success, &item);
                state.range = item.range.clone();
                state.src_cid = item.src_cid.clone();
                state.dst_cid = item.dst_cid.clone();
                state.result = item.result;
                pull_now = matches!(item.result, RESULT_SUC | RESULT_FAIL | RESULT_INVALID)
                    || result_rx.is_empty() && running.len() <= MERGE_RUNNING_CEILING;
            }
            if !pull_now {
                continue;
            }

            let response = match self
                .supernode
                .pull_piece_task(
                    &mut state,
                    &mut self.nodes,
                    &self.register_req,
                    &mut piece_size_history,
                )
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "pull piece task failed terminally");
                    self.back_reason.set(BackReason::DownError);
                    break None;
                }
            };

            {
                let mut loc = self.location.write().await;
                loc.node = state.super_node.clone();
                loc.task_id = state.task_id.clone();
            }

            if piece_size_history[0] != piece_size_history[1] {
                let _ = writer_tx
                    .send(WriterMsg::Reset(piece_size_history[1], 0))
                    .await;
                running.clear();
                success.clear();
                piece_size_history[0] = piece_size_history[1];
            }

            match response.code {
                TASK_CODE_CONTINUE => {
                    if let Some(serde_json::Value::Array(tasks)) = response.data {
                        for raw in tasks {
                            let Ok(task) = serde_json::from_value::<PieceTaskWire>(raw) else {
                                continue;
                            };
                            self.dispatch_piece(
                                task,
                                &mut running,
                                &success,
                                &state,
                                &result_tx,
                                &writer_tx,
                                &mut last_rate_refresh,
                            )
                            .await;
                        }
                    }
                }
                TASK_CODE_FINISH => {
                    state.status = TASK_STATUS_FINISH;
                    let finish_md5 = response
                        .data
                        .and_then(|v| serde_json::from_value::<FinishData>(v).ok())
                        .map(|d| d.md5);
                    break Some(finish_md5);
                }
                TASK_CODE_LIMITED => {
                    info!("supernode reports the task is rate limited, retrying");
                }
                other => {
                    warn!(code = other, "unexpected pull response code");
                }
            }

            if self.back_reason.is_set() {
                break None;
            }
        };

        drop(result_rx);
        let _ = writer_tx.send(WriterMsg::Last).await;
        let total_bytes = writer_join.await??;

        let Some(finish_md5) = outcome else {
            return Ok(SchedulerOutcome {
                success: false,
                total_bytes,
            });
        };
        if self.back_reason.is_set() {
            return Ok(SchedulerOutcome {
                success: false,
                total_bytes,
            });
        }

        let source = self
            .mirror_target
            .clone()
            .unwrap_or_else(|| self.paths.client_file());
        if let Some(expected) = finish_md5.or(self.expected_md5.clone()) {
            let actual = md5_file(&source)?;
            if actual != expected {
                warn!(expected, actual, "final file md5 mismatch");
                self.back_reason.set(BackReason::Md5NotMatch);
                return Ok(SchedulerOutcome {
                    success: false,
                    total_bytes,
                });
            }
        }

        if let Some(parent) = self.real_target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&source, &self.real_target)?;
        info!(target = %self.real_target.display(), total_bytes, "download finished");
        Ok(SchedulerOutcome {
            success: true,
            total_bytes,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_piece(
        &self,
        task: PieceTaskWire,
        running: &mut HashSet<String>,
        success: &HashSet<String>,
        state: &PullState,
        result_tx: &mpsc::UnboundedSender<ResultItem>,
        writer_tx: &mpsc::Sender<WriterMsg>,
        last_rate_refresh: &mut Instant,
    ) {
        if success.contains(&task.range) {
            let mut item = ResultItem::invalid(state.task_id.clone(), state.super_node.clone());
            item.result = RESULT_SEMISUC;
            item.range = task.range.clone();
            let _ = result_tx.send(item);
            return;
        }
        if running.contains(&task.range) {
            return;
        }
        running.insert(task.range.clone());

        if last_rate_refresh.elapsed() >= RATE_REFRESH_INTERVAL {
            *last_rate_refresh = Instant::now();
            let desired = self.local_rate_limit.unwrap_or_else(|| {
                task.down_link.unwrap_or(0).max(0) as u64 * 1024
            });
            self.rate_limiter.refresh(desired).await;
        }

        let http = self.http.clone();
        let task_id = state.task_id.clone();
        let cid = self.cid.clone();
        let super_node_host = state.super_node.clone();
        let rate_limiter = self.rate_limiter.clone();
        let result_tx = result_tx.clone();
        let writer_tx = writer_tx.clone();

        tokio::spawn(async move {
            let item = fetch_piece(&http, &task, &task_id, &cid, &super_node_host, &rate_limiter).await;
            let _ = writer_tx.send(WriterMsg::Piece(item.clone())).await;
            let _ = result_tx.send(item);
        });
    }
}

fn apply_result(running: &mut HashSet<String>, success: &mut HashSet<String>, item: &ResultItem) {
    match item.result {
        RESULT_SUC | RESULT_SEMISUC => {
            running.remove(&item.range);
            success.insert(item.range.clone());
        }
        RESULT_FAIL | RESULT_INVALID => {
            running.remove(&item.range);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_result_moves_range_from_running_to_success() {
        let mut running = HashSet::new();
        let mut success = HashSet::new();
        running.insert("0-99".to_string());

        let mut item = ResultItem::invalid("t", "n");
        item.range = "0-99".to_string();
        item.result = RESULT_SEMISUC;
        apply_result(&mut running, &mut success, &item);

        assert!(!running.contains("0-99"));
        assert!(success.contains("0-99"));
    }

    #[test]
    fn apply_result_drops_failed_range_from_running_without_marking_success() {
        let mut running = HashSet::new();
        let mut success = HashSet::new();
        running.insert("0-99".to_string());

        let mut item = ResultItem::invalid("t", "n");
        item.range = "0-99".to_string();
        item.result = RESULT_FAIL;
        apply_result(&mut running, &mut success, &item);

        assert!(!running.contains("0-99"));
        assert!(!success.contains("0-99"));
    }
}
