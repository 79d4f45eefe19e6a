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

use dragonfly_client_util::digest::sha1_hex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// SHA1_HEX_LEN is the width of the ASCII sha1 signature prefix on
/// every meta file: `sha1_hex(body) || body`.
const SHA1_HEX_LEN: usize = 40;

/// MetaFile is the small persistent key-value blob the host keeps
/// across invocations, most importantly `servicePort` so a piece
/// server launched by one invocation can be reused by the next. Its
/// on-disk layout is `sha1_hex(body) || body`; a mismatched signature
/// on load discards the body rather than erroring.
pub struct MetaFile {
    path: PathBuf,
}

impl MetaFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// load reads the cache, returning an empty map when the file is
    /// absent, truncated, not valid JSON, or its signature doesn't
    /// match — any of these is treated as "nothing reusable", never a
    /// hard error, matching the original `metafile.MetaFile.load`.
    pub fn load(&self) -> HashMap<String, Value> {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return HashMap::new();
        };
        if bytes.len() < SHA1_HEX_LEN {
            return HashMap::new();
        }
        let (sign, body) = bytes.split_at(SHA1_HEX_LEN);
        let Ok(sign) = std::str::from_utf8(sign) else {
            return HashMap::new();
        };
        if sign != sha1_hex(body) {
            return HashMap::new();
        }
        serde_json::from_slice::<Map<String, Value>>(body)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default()
    }

    /// dump writes `data` back with a fresh signature, creating parent
    /// directories if needed. Best-effort at the caller: a write
    /// failure here should be logged and swallowed.
    pub fn dump(&self, data: &HashMap<String, Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(data)?;
        let sign = sha1_hex(&body);
        let mut contents = Vec::with_capacity(SHA1_HEX_LEN + body.len());
        contents.extend_from_slice(sign.as_bytes());
        contents.extend_from_slice(&body);
        std::fs::write(&self.path, contents)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_dump_and_load() {
        let dir = TempDir::new().unwrap();
        let meta = MetaFile::new(dir.path().join("host.meta"));

        let mut data = HashMap::new();
        data.insert("servicePort".to_string(), Value::from(23456));
        meta.dump(&data).unwrap();

        let loaded = meta.load();
        assert_eq!(loaded.get("servicePort"), Some(&Value::from(23456)));
    }

    #[test]
    fn corrupted_signature_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.meta");
        std::fs::write(&path, b"0000000000000000000000000000000000000000{}").unwrap();

        let meta = MetaFile::new(path);
        assert!(meta.load().is_empty());
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let meta = MetaFile::new("/nonexistent/host.meta");
        assert!(meta.load().is_empty());
    }
}
