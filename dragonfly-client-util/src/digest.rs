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

use dragonfly_client_core::Result;
use md5::{Digest, Md5};
use sha1::Sha1;
use std::io::Read;
use std::path::Path;

/// Md5Computer accumulates chunks of a piece the way the original
/// `md5computer.Md5Computer` did, so callers can feed framed chunks in
/// as they arrive off the wire.
#[derive(Default)]
pub struct Md5Computer(Md5);

impl Md5Computer {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.0.update(data);
        }
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// md5_file hashes a whole file in 4 MiB chunks, mirroring
/// `Md5Computer.md5_file` in the original client.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5Computer::new();
    let mut buf = vec![0u8; 4 * 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// sha1_hex returns the lowercase hex SHA1 digest of `data`, used by
/// the host metadata file's integrity signature.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_md5_matches_known_value() {
        let hasher = Md5Computer::new();
        assert_eq!(hasher.finalize_hex(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn incremental_update_matches_oneshot() {
        let mut a = Md5Computer::new();
        a.update(b"hello ");
        a.update(b"world");
        let mut b = Md5Computer::new();
        b.update(b"hello world");
        assert_eq!(a.finalize_hex(), b.finalize_hex());
    }

    #[test]
    fn sha1_of_empty_is_known_value() {
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }
}
