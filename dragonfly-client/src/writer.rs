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

use crate::piece::WriterMsg;
use crate::scheduler::SessionLocation;
use crate::supernode::client::SupernodeClient;
use crate::supernode::protocol::QU_CLIENT_SIZE;
use dragonfly_client_core::error::BackReasonCell;
use dragonfly_client_core::{BackReason, Result};
use dragonfly_client_storage::TaskPaths;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

/// Every this-many successfully written pieces, the service file gets
/// an out-of-band fdatasync instead of one per piece.
const SYNC_EVERY_N_PIECES: u32 = 4;

fn raw_piece_offset(piece_num: u32, piece_size: u32) -> u64 {
    piece_num as u64 * (piece_size as u64 - 5)
}

fn link_force(src: &Path, dst: &Path) -> std::io::Result<()> {
    let _ = std::fs::remove_file(dst);
    std::fs::hard_link(src, dst)
}

/// ServiceWriter is the single consumer of the writer queue. Each
/// accepted piece is decoded back to raw bytes (header and trailer
/// stripped) and written at its computed raw offset, so the service
/// file always holds the plain reconstructed file content rather than
/// wire framing; the piece server re-frames on the fly when serving a
/// range to a peer.
pub struct ServiceWriter;

impl ServiceWriter {
    /// spawn opens the service file, hardlinks the client file onto
    /// it, optionally starts a mirror writer bound to `branch_target`,
    /// and returns the message sender plus a join handle that
    /// resolves to the total raw bytes written once `Last` is
    /// processed.
    pub fn spawn(
        paths: &TaskPaths,
        branch_target: Option<PathBuf>,
        piece_size: u32,
        supernode: Arc<SupernodeClient>,
        location: Arc<RwLock<SessionLocation>>,
        cid: String,
        back_reason: Arc<BackReasonCell>,
    ) -> Result<(mpsc::Sender<WriterMsg>, JoinHandle<Result<u64>>)> {
        let service_path = paths.service_file();
        std::fs::File::create(&service_path)?;
        link_force(&service_path, &paths.client_file())?;

        let mirror = match branch_target {
            Some(branch) => {
                std::fs::File::create(&branch)?;
                let (mtx, mrx) = mpsc::channel(QU_CLIENT_SIZE);
                let handle = tokio::spawn(run_mirror(branch, piece_size, mrx));
                Some((mtx, handle))
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(QU_CLIENT_SIZE);
        let join = tokio::spawn(run(
            rx,
            service_path,
            piece_size,
            supernode,
            location,
            cid,
            back_reason,
            mirror,
        ));
        Ok((tx, join))
    }
}

#[instrument(skip_all)]
async fn run(
    mut rx: mpsc::Receiver<WriterMsg>,
    service_path: PathBuf,
    mut piece_size: u32,
    supernode: Arc<SupernodeClient>,
    location: Arc<RwLock<SessionLocation>>,
    cid: String,
    back_reason: Arc<BackReasonCell>,
    mirror: Option<(mpsc::Sender<WriterMsg>, JoinHandle<Result<u64>>)>,
) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).open(&service_path).await?;
    let mut total: u64 = 0;
    let mut since_sync: u32 = 0;
    let mut failed = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Reset(new_size, file_length) => {
                piece_size = new_size;
                total = 0;
                since_sync = 0;
                failed = false;
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
                if let Some((mtx, _)) = &mirror {
                    let _ = mtx.send(WriterMsg::Reset(new_size, file_length)).await;
                }
            }
            WriterMsg::Last => {
                if let Err(err) = file.flush().await {
                    warn!(error = %err, "service file flush failed");
                }
                if let Err(err) = file.sync_data().await {
                    warn!(error = %err, "service file fsync failed");
                }
                if let Some((mtx, handle)) = mirror {
                    let _ = mtx.send(WriterMsg::Last).await;
                    drop(mtx);
                    let _ = handle.await;
                }
                return Ok(total);
            }
            WriterMsg::Piece(item) => {
                if failed {
                    continue;
                }
                let Some(expected_size) = item.piece_size else {
                    continue;
                };
                if expected_size != piece_size {
                    continue;
                }
                let (Some(piece_num), Some(framed)) = (item.piece_num, item.piece_cont.as_ref())
                else {
                    continue;
                };
                let raw = match crate::piece::codec::decode(framed) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(error = %err, "dropping malformed framed piece");
                        continue;
                    }
                };

                let offset = raw_piece_offset(piece_num, piece_size);
                if let Err(err) = write_at(&mut file, offset, raw).await {
                    warn!(error = %err, "service file write failed");
                    back_reason.set(BackReason::WriteError);
                    failed = true;
                    continue;
                }
                total += raw.len() as u64;

                {
                    let loc = location.read().await;
                    supernode
                        .suc_piece(&loc.task_id, &cid, &item.dst_cid, &item.range, &loc.node)
                        .await;
                }

                if let Some((mtx, _)) = &mirror {
                    let _ = mtx.send(WriterMsg::Piece(item.clone())).await;
                }

                since_sync += 1;
                if since_sync >= SYNC_EVERY_N_PIECES {
                    since_sync = 0;
                    if let Err(err) = file.sync_data().await {
                        warn!(error = %err, "periodic fdatasync failed");
                    }
                }
            }
        }
    }
    Ok(total)
}

/// run_mirror reconstructs the same raw content as the service file
/// into `branch_target`, a file living in the final target's own
/// directory so the scheduler can rename it into place without an
/// across-filesystem copy.
async fn run_mirror(
    path: PathBuf,
    mut piece_size: u32,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).open(&path).await?;
    let mut total: u64 = 0;
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Reset(new_size, _file_length) => {
                piece_size = new_size;
                total = 0;
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
            }
            WriterMsg::Last => {
                file.flush().await?;
                file.sync_data().await?;
                return Ok(total);
            }
            WriterMsg::Piece(item) => {
                if item.piece_size != Some(piece_size) {
                    continue;
                }
                let (Some(piece_num), Some(framed)) = (item.piece_num, item.piece_cont.as_ref())
                else {
                    continue;
                };
                if let Ok(raw) = crate::piece::codec::decode(framed) {
                    let offset = raw_piece_offset(piece_num, piece_size);
                    if write_at(&mut file, offset, raw).await.is_ok() {
                        total += raw.len() as u64;
                    }
                }
            }
        }
    }
    Ok(total)
}

async fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::codec;
    use crate::piece::ResultItem;
    use crate::supernode::protocol::RESULT_SEMISUC;
    use wiremock::MockServer;

    fn piece_item(piece_num: u32, piece_size: u32, body: &[u8]) -> crate::piece::WriterMsg {
        let mut item = ResultItem::invalid("task-1", "node-1");
        item.result = RESULT_SEMISUC;
        item.piece_num = Some(piece_num);
        item.piece_size = Some(piece_size);
        item.piece_cont = Some(codec::encode(body, piece_size).into());
        item.dst_cid = "peer-cid".to_string();
        item.range = format!("{}-{}", piece_num as u64 * piece_size as u64, 0);
        crate::piece::WriterMsg::Piece(item)
    }

    #[tokio::test]
    async fn writes_pieces_at_their_raw_offset_and_reports_total() {
        let server = MockServer::start().await;
        let supernode = Arc::new(SupernodeClient::new().unwrap());
        let location = Arc::new(RwLock::new(SessionLocation {
            node: format!("127.0.0.1:{}", server.address().port()),
            task_id: "task-1".to_string(),
        }));
        let back_reason = Arc::new(BackReasonCell::new());

        let dir = tempfile::TempDir::new().unwrap();
        let paths = TaskPaths::new(dir.path().join("out.bin"), dir.path(), "1-1.0");

        let piece_size = 10u32;
        let (tx, join) = ServiceWriter::spawn(
            &paths,
            None,
            piece_size,
            supernode,
            location,
            "cid-1".to_string(),
            back_reason,
        )
        .unwrap();

        tx.send(piece_item(0, piece_size, b"hello")).await.unwrap();
        tx.send(piece_item(1, piece_size, b"world")).await.unwrap();
        tx.send(crate::piece::WriterMsg::Last).await.unwrap();
        drop(tx);

        let total = join.await.unwrap().unwrap();
        assert_eq!(total, 10);

        let contents = std::fs::read(paths.service_file()).unwrap();
        assert_eq!(&contents[0..5], b"hello");
        assert_eq!(&contents[5..10], b"world");
    }

    #[tokio::test]
    async fn stale_piece_size_items_are_dropped() {
        let server = MockServer::start().await;
        let supernode = Arc::new(SupernodeClient::new().unwrap());
        let location = Arc::new(RwLock::new(SessionLocation {
            node: format!("127.0.0.1:{}", server.address().port()),
            task_id: "task-1".to_string(),
        }));
        let back_reason = Arc::new(BackReasonCell::new());

        let dir = tempfile::TempDir::new().unwrap();
        let paths = TaskPaths::new(dir.path().join("out.bin"), dir.path(), "1-1.0");

        let (tx, join) = ServiceWriter::spawn(
            &paths,
            None,
            10,
            supernode,
            location,
            "cid-1".to_string(),
            back_reason,
        )
        .unwrap();

        // Stale piece size (4 instead of the writer's current 10): dropped.
        tx.send(piece_item(0, 4, b"stale")).await.unwrap();
        tx.send(crate::piece::WriterMsg::Last).await.unwrap();
        drop(tx);

        let total = join.await.unwrap().unwrap();
        assert_eq!(total, 0);
    }
}
