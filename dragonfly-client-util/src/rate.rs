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

/// parse_rate_limit parses the `--locallimit`/`--totallimit` format
/// `\d+[kKmM]`, K=1024, M=1024*1024, returning bytes/second.
pub fn parse_rate_limit(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::ParamError(format!("--locallimit or -s format is invalid: {raw}")))?;
    match unit {
        "k" | "K" => Ok(value * 1024),
        "m" | "M" => Ok(value * 1024 * 1024),
        _ => Err(Error::ParamError(format!(
            "--locallimit or -s format is invalid: {raw}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kilobyte_suffix() {
        assert_eq!(parse_rate_limit("20k").unwrap(), 20 * 1024);
        assert_eq!(parse_rate_limit("20K").unwrap(), 20 * 1024);
    }

    #[test]
    fn parses_megabyte_suffix() {
        assert_eq!(parse_rate_limit("5M").unwrap(), 5 * 1024 * 1024);
    }

    #[test]
    fn rejects_missing_suffix() {
        assert!(parse_rate_limit("1024").is_err());
    }
}
