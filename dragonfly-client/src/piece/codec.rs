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

use dragonfly_client_core::{Error, Result};

/// PIECE_TRAILER ends every framed piece response.
pub const PIECE_TRAILER: u8 = 0x7f;

/// HEADER_LEN is the size of the leading big-endian length/size word.
pub const HEADER_LEN: usize = 4;

/// encode wraps `body` the way the piece server does before writing it
/// to a peer: a 4-byte header carrying `readLen | (pieceSize << 4)`,
/// the body itself, then the trailer byte. `readLen` is `body.len() +
/// HEADER_LEN + 1`, matching the convention that the supernode's
/// declared piece length always includes the framing overhead.
pub fn encode(body: &[u8], piece_size: u32) -> Vec<u8> {
    let read_len = body.len() as u32 + HEADER_LEN as u32 + 1;
    let header = read_len | (piece_size << 4);

    let mut framed = Vec::with_capacity(HEADER_LEN + body.len() + 1);
    framed.extend_from_slice(&header.to_be_bytes());
    framed.extend_from_slice(body);
    framed.push(PIECE_TRAILER);
    framed
}

/// decode strips the header and trailer off a framed piece, returning
/// the raw body. It does not attempt to recover `pieceSize` from the
/// header word, since the header packs it by addition rather than by a
/// byte-aligned field and callers always already know the piece size
/// from the task that requested the fetch.
pub fn decode(framed: &[u8]) -> Result<&[u8]> {
    if framed.len() < HEADER_LEN + 1 {
        return Err(Error::DownError(format!(
            "framed piece too short: {} bytes",
            framed.len()
        )));
    }
    if framed[framed.len() - 1] != PIECE_TRAILER {
        return Err(Error::DownError("framed piece missing trailer byte".into()));
    }
    Ok(&framed[HEADER_LEN..framed.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_inverts_encode() {
        let body = b"some piece payload bytes";
        let framed = encode(body, 4 * 1024 * 1024);
        assert_eq!(decode(&framed).unwrap(), body);
    }

    #[test]
    fn decode_inverts_encode_for_empty_body() {
        let framed = encode(b"", 4096);
        assert_eq!(decode(&framed).unwrap(), b"");
    }

    #[test]
    fn decode_rejects_missing_trailer() {
        let mut framed = encode(b"abc", 4096);
        *framed.last_mut().unwrap() = 0x00;
        assert!(decode(&framed).is_err());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(decode(&[0, 0]).is_err());
    }
}
