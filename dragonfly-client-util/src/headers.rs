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

use std::collections::HashMap;

/// fill_headers turns the repeated `--header "Key: Value"` CLI
/// arguments into a header map, joining repeated keys with a comma the
/// way the original `fill_headers` did.
pub fn fill_headers(raw: &[String]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        headers
            .entry(key)
            .and_modify(|existing: &mut String| {
                if !value.is_empty() {
                    existing.push(',');
                    existing.push_str(&value);
                }
            })
            .or_insert(value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_repeated_keys_with_comma() {
        let raw = vec!["Accept: */*".to_string(), "Accept: text/plain".to_string()];
        let headers = fill_headers(&raw);
        assert_eq!(headers.get("Accept").unwrap(), "*/*,text/plain");
    }

    #[test]
    fn trims_whitespace_around_key_and_value() {
        let raw = vec!["  Host  :   example.com  ".to_string()];
        let headers = fill_headers(&raw);
        assert_eq!(headers.get("Host").unwrap(), "example.com");
    }

    #[test]
    fn ignores_malformed_entries() {
        let raw = vec!["not-a-header".to_string()];
        assert!(fill_headers(&raw).is_empty());
    }
}
