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

pub mod codec;
pub mod fetcher;

use crate::supernode::protocol::TASK_STATUS_RUNNING;
use bytes::Bytes;

/// ResultItem moves between the fetcher, the scheduler and the
/// service writer. `piece_cont` carries the framed bytes exactly as
/// received from the peer; only present on a successful fetch.
#[derive(Debug, Clone)]
pub struct ResultItem {
    pub task_id: String,
    pub super_node: String,
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: i32,
    pub status: i32,
    pub piece_cont: Option<Bytes>,
    pub piece_size: Option<u32>,
    pub piece_num: Option<u32>,
}

impl ResultItem {
    pub fn invalid(task_id: impl Into<String>, super_node: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            src_cid: String::new(),
            dst_cid: String::new(),
            range: String::new(),
            result: crate::supernode::protocol::RESULT_INVALID,
            status: TASK_STATUS_RUNNING,
            piece_cont: None,
            piece_size: None,
            piece_num: None,
        }
    }
}

/// WriterMsg is the message shape consumed by the service writer (and,
/// in mirror mode, forwarded on to the target writer).
#[derive(Debug, Clone)]
pub enum WriterMsg {
    Piece(ResultItem),
    /// Reset truncates the on-disk file to zero length after a
    /// piece-size migration, carrying the new piece size and file
    /// length the writer should use from now on.
    Reset(u32, u64),
    /// Last signals there is no more data; the writer flushes, closes,
    /// and notifies completion.
    Last,
}
