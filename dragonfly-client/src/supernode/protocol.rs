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

use serde::{Deserialize, Serialize};

pub const SUCCESS: i32 = 200;

pub const RESULT_FAIL: i32 = 500;
pub const RESULT_SUC: i32 = 501;
pub const RESULT_INVALID: i32 = 502;
pub const RESULT_SEMISUC: i32 = 503;

pub const TASK_STATUS_START: i32 = 700;
pub const TASK_STATUS_RUNNING: i32 = 701;
pub const TASK_STATUS_FINISH: i32 = 702;

pub const TASK_CODE_FINISH: i32 = 600;
pub const TASK_CODE_CONTINUE: i32 = 601;
pub const TASK_CODE_WAIT: i32 = 602;
pub const TASK_CODE_LIMITED: i32 = 603;
pub const TASK_CODE_NEED_AUTH: i32 = 608;
pub const TASK_CODE_WAIT_AUTH: i32 = 609;

/// TASK_CODE_SOURCE_ERROR is not part of the upstream wire protocol; it
/// is assigned a value outside the documented 600-609 block so it can
/// never collide with a future official code, and recognized here as a
/// distinct terminal failure rather than folded into the generic
/// migrate-and-retry path.
pub const TASK_CODE_SOURCE_ERROR: i32 = 690;

pub const SCHEMA_HTTP: &str = "http";
pub const SUPERNODE_PORT: u16 = 8002;

pub const SERVER_PORT_DOWN: u16 = 15000;
pub const SERVER_PORT_UP: u16 = 65000;

pub const RANGE_NOT_EXIST_DESC: &str = "range not satisfiable";
pub const ADDR_USED_DESC: &str = "address already in use";

pub const PEER_HTTP_PATH_PREFIX: &str = "/peer/file/";
pub const LOCAL_HTTP_PATH_CHECK: &str = "/check/";
pub const LOCAL_HTTP_PATH_CLIENT: &str = "/client/";
pub const LOCAL_HTTP_PATH_RATE: &str = "/rate/";

/// QU_CLIENT_SIZE bounds the writer and mirror-writer queues.
pub const QU_CLIENT_SIZE: usize = 6;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub code: i32,
    pub data: Option<RegisterData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    pub task_id: String,
    pub file_length: i64,
    pub piece_size: u32,
}

/// PullResponse's `data` shape depends on `code`: a piece task array
/// when continuing, `{md5}` when finishing. Callers branch on `code`
/// before interpreting it.
#[derive(Debug, Clone, Deserialize)]
pub struct PullResponse {
    pub code: i32,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceTaskWire {
    pub range: String,
    pub peer_ip: String,
    pub peer_port: u16,
    pub path: String,
    pub piece_num: u32,
    pub piece_size: u32,
    /// piece_md5 is `"<hex>:<len>"`.
    pub piece_md5: String,
    pub cid: String,
    #[serde(default)]
    pub down_link: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinishData {
    pub md5: String,
}

/// parse_piece_md5 splits the wire `"<hex>:<len>"` convention.
pub fn parse_piece_md5(raw: &str) -> Option<(&str, u64)> {
    let (hex, len) = raw.split_once(':')?;
    let len: u64 = len.parse().ok()?;
    Some((hex, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_length() {
        let (hex, len) = parse_piece_md5("d41d8cd98f00b204e9800998ecf8427e:4194309").unwrap();
        assert_eq!(hex, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(len, 4194309);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_piece_md5("nocolon").is_none());
        assert!(parse_piece_md5("hex:notanumber").is_none());
    }
}
