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
use std::path::Path;

/// Default location of the bootstrap node config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dragonfly.conf";

/// NodeConfig holds the bootstrap supernode addresses read from the
/// INI-format config file (section `[node]`, key `address`). This
/// replaces the original `configutil.py`'s import-time global parse
/// with an explicit `load` call.
#[derive(Debug, Default, Clone)]
pub struct NodeConfig {
    pub addresses: Vec<String>,
}

impl NodeConfig {
    /// load parses `path`, tolerating a missing file (the original
    /// client raised only when `--node` was absent AND the file could
    /// not be read; the caller is responsible for that fallback
    /// ordering).
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };

        let mut in_node_section = false;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(['#', ';']) {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_node_section = line.eq_ignore_ascii_case("[node]");
                continue;
            }
            if !in_node_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if key.trim().eq_ignore_ascii_case("address") {
                    let addresses = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    return Ok(Self { addresses });
                }
            }
        }
        Ok(Self::default())
    }

    /// require returns an error when the file produced no addresses,
    /// matching the original client's behaviour of raising when
    /// `/etc/dragonfly.conf` is missing or empty and `--node` was not
    /// given.
    pub fn require(self) -> Result<Vec<String>> {
        if self.addresses.is_empty() {
            return Err(Error::ParamError(
                "/etc/dragonfly.conf not found or has no node data".to_string(),
            ));
        }
        Ok(self.addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_address_list_from_node_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\naddress=10.0.0.1,10.0.0.2").unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.addresses, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn ignores_sections_other_than_node() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[other]\naddress=1.1.1.1\n[node]\naddress=2.2.2.2").unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.addresses, vec!["2.2.2.2"]);
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let config = NodeConfig::load(Path::new("/nonexistent/dragonfly.conf")).unwrap();
        assert!(config.addresses.is_empty());
    }

    #[test]
    fn require_errors_on_empty_config() {
        assert!(NodeConfig::default().require().is_err());
    }
}
