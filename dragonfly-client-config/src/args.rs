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

use clap::{Parser, ValueEnum};
use dragonfly_client_core::{Error, Result};
use regex::Regex;

/// Pattern selects how the file is retrieved: through the p2p network
/// or directly via CDN passthrough. `cdn` disables `--totallimit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum Pattern {
    P2p,
    Cdn,
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern::P2p
    }
}

/// Args is the CLI surface the original `paramparser.py` exposed,
/// translated one flag at a time.
#[derive(Parser, Debug, Clone)]
#[command(name = "dfget", about = "dragonfly is a file distribution system based p2p")]
pub struct Args {
    /// Will download a file from this url. Required unless
    /// `--internal-piece-server` is set, since that mode never
    /// downloads anything itself.
    #[arg(long, short = 'u')]
    pub url: Option<String>,

    /// Output path that not only contains the dir part but also name part.
    #[arg(long, short = 'O', visible_alias = "o")]
    pub output: Option<String>,

    /// Expected file md5.
    #[arg(long, short = 'm')]
    pub md5: Option<String>,

    /// System name that executes dfget, its format is
    /// company_department_appName.
    #[arg(long)]
    pub callsystem: Option<String>,

    /// Do not back source when p2p fails.
    #[arg(long)]
    pub notbs: bool,

    /// Rate limit about a single download task, its format is 20M/m/K/k.
    #[arg(long, short = 's')]
    pub locallimit: Option<String>,

    /// Rate limit about the whole host, its format is 20M/m/K/k.
    #[arg(long)]
    pub totallimit: Option<String>,

    /// Identify download task, it is available merely when md5 param
    /// not exist.
    #[arg(long, short = 'i')]
    pub identifier: Option<String>,

    /// Download timeout (seconds).
    #[arg(long, visible_alias = "exceed", short = 'e')]
    pub timeout: Option<u64>,

    /// Filter some query params of url, e.g. -f 'key&sign' will filter
    /// key and sign query param.
    #[arg(long, short = 'f')]
    pub filter: Option<String>,

    /// Show progress bar.
    #[arg(long, short = 'b')]
    pub showbar: bool,

    /// Download pattern, cdn pattern not support totallimit.
    #[arg(long, short = 'p', value_enum, default_value_t = Pattern::P2p)]
    pub pattern: Pattern,

    /// Print the version and exit.
    #[arg(long, short = 'v')]
    pub version: bool,

    /// Specify nodes (comma-separated), overrides the config file.
    #[arg(long, short = 'n')]
    pub node: Option<String>,

    /// Show log on console.
    #[arg(long)]
    pub console: bool,

    /// Http header, e.g. --header="Accept: *" --header="Host: abc".
    #[arg(long)]
    pub header: Vec<String>,

    /// Caller is from df-daemon.
    #[arg(long)]
    pub dfdaemon: bool,

    /// Re-exec marker: run as the long-lived piece server instead of a
    /// download session. Not part of the public CLI surface.
    #[arg(long, hide = true)]
    pub internal_piece_server: bool,

    /// Task file name the piece server should bind to, passed by the
    /// session that re-exec'd this process.
    #[arg(long, hide = true)]
    pub task_file_name: Option<String>,

    /// Local address the piece server listens on, passed by the
    /// session that re-exec'd this process.
    #[arg(long, hide = true)]
    pub bind_ip: Option<String>,

    /// Data directory the piece server serves pieces out of, passed by
    /// the session that re-exec'd this process.
    #[arg(long, hide = true)]
    pub data_dir: Option<String>,
}

impl Args {
    /// validate enforces the invariants the original client asserted
    /// at parse time: a url matching the supported schemas, and an
    /// output path that isn't a directory. Skipped in
    /// `--internal-piece-server` mode, which carries no url at all.
    pub fn validate(&self) -> Result<()> {
        if self.internal_piece_server {
            return Ok(());
        }
        let re = Regex::new(r"(?i)^(https?)://(.+?)(:(\d+))?(/.*$|\?.*$|$)").unwrap();
        let Some(url) = &self.url else {
            return Err(Error::ParamError(
                "please specify the cmd param(--url or -u)".to_string(),
            ));
        };
        if !re.is_match(url) {
            return Err(Error::ParamError(
                "please specify the cmd param(--url or -u)".to_string(),
            ));
        }
        Ok(())
    }

    /// resolved_output derives the output path, applying the same
    /// default as `paramparser.default_output`: strip the schema and
    /// take the last path segment.
    pub fn resolved_output(&self) -> String {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let url = self.url.as_deref().unwrap_or_default();
        match url.rfind('/') {
            Some(idx) if idx != url.len() - 1 => url[idx + 1..].to_string(),
            _ => {
                // No path separator past the schema: strip "http://"/"https://".
                url.splitn(2, "://").nth(1).unwrap_or(url).to_string()
            }
        }
    }

    /// identifier_for_register applies the rule that `--identifier`
    /// is ignored whenever `--md5` is set.
    pub fn identifier_for_register(&self) -> Option<&str> {
        if self.md5.is_some() {
            None
        } else {
            self.identifier.as_deref()
        }
    }

    /// effective_total_limit returns `None` when the cdn pattern is in
    /// effect, since cdn pattern does not support a total limit.
    pub fn effective_total_limit(&self) -> Option<&str> {
        if self.pattern == Pattern::Cdn {
            None
        } else {
            self.totallimit.as_deref()
        }
    }

    pub fn call_system(&self) -> String {
        self.callsystem.clone().unwrap_or_else(|| "UNKNOWN".into())
    }

    /// filter_fields splits `--filter` on `&` into the query keys to
    /// strip from the task url.
    pub fn filter_fields(&self) -> Vec<String> {
        self.filter
            .as_deref()
            .map(|f| f.split('&').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// nodes_from_flag splits `--node` on `,`, returning `None` when
    /// the flag was not given so the caller falls back to the config
    /// file.
    pub fn nodes_from_flag(&self) -> Option<Vec<String>> {
        self.node
            .as_deref()
            .map(|n| n.split(',').map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(url: &str) -> Args {
        Args {
            url: Some(url.to_string()),
            output: None,
            md5: None,
            callsystem: None,
            notbs: false,
            locallimit: None,
            totallimit: None,
            identifier: None,
            timeout: None,
            filter: None,
            showbar: false,
            pattern: Pattern::P2p,
            version: false,
            node: None,
            console: false,
            header: vec![],
            dfdaemon: false,
            internal_piece_server: false,
            task_file_name: None,
            bind_ip: None,
            data_dir: None,
        }
    }

    #[test]
    fn validates_http_and_https_urls_case_insensitively() {
        assert!(args("HTTP://example.com/f").validate().is_ok());
        assert!(args("https://example.com/f").validate().is_ok());
        assert!(args("ftp://example.com/f").validate().is_err());
    }

    #[test]
    fn default_output_strips_schema_when_no_path() {
        let a = args("http://example.com");
        assert_eq!(a.resolved_output(), "example.com");
    }

    #[test]
    fn default_output_takes_last_path_segment() {
        let a = args("http://example.com/dir/file.tar.gz");
        assert_eq!(a.resolved_output(), "file.tar.gz");
    }

    #[test]
    fn identifier_is_ignored_when_md5_present() {
        let mut a = args("http://example.com/f");
        a.md5 = Some("d41d8cd98f00b204e9800998ecf8427e".into());
        a.identifier = Some("some-id".into());
        assert_eq!(a.identifier_for_register(), None);
    }

    #[test]
    fn cdn_pattern_disables_total_limit() {
        let mut a = args("http://example.com/f");
        a.totallimit = Some("20M".into());
        a.pattern = Pattern::Cdn;
        assert_eq!(a.effective_total_limit(), None);
    }

    #[test]
    fn node_flag_splits_on_comma() {
        let mut a = args("http://example.com/f");
        a.node = Some("h1,h2,h3".into());
        assert_eq!(
            a.nodes_from_flag().unwrap(),
            vec!["h1".to_string(), "h2".to_string(), "h3".to_string()]
        );
    }
}
