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

use super::{AliveWatch, TaskMap};
use crate::shutdown::ShutdownTrigger;
use crate::supernode::client::SupernodeClient;
use dragonfly_client_storage::TaskPaths;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// IDLE_TIMEOUT is how long the server tolerates a silent `alive`
/// channel before assuming no client is using it anymore.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(15);
const EXPIRE_FINISHED: Duration = Duration::from_secs(180);
const EXPIRE_UNKNOWN: Duration = Duration::from_secs(3600);

/// Expiry classifies a tracked file so the sweep can decide whether to
/// even stat it: a task this server never heard of is a leftover from
/// a dead client and gets a generous grace period; one it knows is
/// still running is left alone entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Finished(Duration),
    Unknown(Duration),
    StillRunning,
}

pub fn classify(known: bool, finished: bool) -> Expiry {
    if known && finished {
        Expiry::Finished(EXPIRE_FINISHED)
    } else if !known {
        Expiry::Unknown(EXPIRE_UNKNOWN)
    } else {
        Expiry::StillRunning
    }
}

/// run_reaper waits for `alive` to go quiet for `IDLE_TIMEOUT`, then
/// locks `checker_lock` and re-checks before tearing the server down,
/// so a request that lands in the gap between timeout and lock can
/// still save the server.
pub async fn run_reaper(
    trigger: ShutdownTrigger,
    mut alive: AliveWatch,
    checker_lock: Arc<Mutex<()>>,
    gc_lock: Arc<Mutex<()>>,
    meta: Arc<dragonfly_client_storage::MetaFile>,
) {
    loop {
        if alive.await_activity(IDLE_TIMEOUT).await {
            continue;
        }

        let _checker = checker_lock.lock().await;
        if alive.await_activity(Duration::from_millis(0)).await {
            continue;
        }

        let mut data = meta.load();
        data.remove("servicePort");
        if let Err(err) = meta.dump(&data) {
            warn!(error = %err, "failed to clear servicePort on shutdown");
        }

        let _gc = gc_lock.lock().await;
        info!("piece server idle, shutting down");
        trigger.trigger();
        return;
    }
}

/// run_gc walks `data_dir` every `GC_INTERVAL`, deleting files whose
/// tracked task is finished (or untracked) and idle past their expiry,
/// reporting tracked deletions to the supernode before forgetting them.
pub async fn run_gc(
    data_dir: std::path::PathBuf,
    tasks: TaskMap,
    gc_lock: Arc<Mutex<()>>,
    supernode: Arc<SupernodeClient>,
    mut shutdown: crate::shutdown::Shutdown,
) {
    let mut interval = tokio::time::interval(GC_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => return,
        }

        let _guard = gc_lock.lock().await;
        let entries = match std::fs::read_dir(&data_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, dir = %data_dir.display(), "gc sweep failed to list data dir");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let tfn = TaskPaths::task_name_from_service_path(file_name).to_string();

            let (known, finished, report) = {
                let map = tasks.lock().await;
                match map.get(&tfn) {
                    Some(meta) => (
                        true,
                        meta.finished,
                        meta.finished
                            .then(|| (meta.task_id.clone(), meta.cid.clone(), meta.super_node.clone())),
                    ),
                    None => (false, false, None),
                }
            };
            let expiry = classify(known, finished);
            let grace = match expiry {
                Expiry::StillRunning => continue,
                Expiry::Finished(d) | Expiry::Unknown(d) => d,
            };

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let last_touched = latest_of(metadata.accessed(), metadata.modified());
            let Ok(elapsed) = last_touched.and_then(|t| {
                SystemTime::now()
                    .duration_since(t)
                    .map_err(|_| std::io::Error::other("clock skew"))
            }) else {
                continue;
            };
            if elapsed < grace {
                continue;
            }

            if let Err(err) = std::fs::remove_file(&path) {
                warn!(error = %err, path = %path.display(), "gc failed to remove expired file");
                continue;
            }
            info!(tfn, path = %path.display(), "gc removed expired file");

            if let Some((Some(task_id), Some(cid), Some(super_node))) = report {
                supernode.down_service(&task_id, &cid, &super_node).await;
            }
            tasks.lock().await.remove(&tfn);
        }
    }
}

fn latest_of(
    a: std::io::Result<SystemTime>,
    b: std::io::Result<SystemTime>,
) -> std::io::Result<SystemTime> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok(a.max(b)),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tracked_unfinished_task_is_never_expired() {
        assert_eq!(classify(true, false), Expiry::StillRunning);
    }

    #[test]
    fn classify_tracked_finished_task_uses_short_grace() {
        assert_eq!(classify(true, true), Expiry::Finished(EXPIRE_FINISHED));
    }

    #[test]
    fn classify_untracked_file_uses_long_grace() {
        assert_eq!(classify(false, false), Expiry::Unknown(EXPIRE_UNKNOWN));
    }
}
