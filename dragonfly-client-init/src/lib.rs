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
use std::path::PathBuf;
use tracing::info;

/// Home bundles the directories every client invocation needs before
/// it can register with a supernode: the user home, the default data
/// directory, the meta directory, and the log directory.
#[derive(Debug, Clone)]
pub struct Home {
    pub usr_home: PathBuf,
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Home {
    /// resolve mirrors the original client's
    /// `os.path.expanduser('~/.small-dragonfly/')` layout.
    pub fn resolve() -> Result<Self> {
        let home = home_dir()?;
        let usr_home = home.join(".small-dragonfly");
        Ok(Self {
            data_dir: usr_home.join("data"),
            meta_dir: usr_home.join("meta"),
            log_dir: usr_home.join("logs"),
            usr_home,
        })
    }

    /// create_directories makes every directory in `self`, matching
    /// `fileutil.create_directories` semantics: succeed if the
    /// directory already exists, fail if the path exists and is not a
    /// directory.
    pub fn create_directories(&self) -> Result<()> {
        for dir in [&self.usr_home, &self.data_dir, &self.meta_dir, &self.log_dir] {
            create_directory(dir)?;
        }
        info!(dir = %self.data_dir.display(), "data directory ready");
        Ok(())
    }

    pub fn meta_path(&self) -> PathBuf {
        self.meta_dir.join("host.meta")
    }
}

/// create_directory creates `dir` (and its parents) if missing, and
/// errors if the path exists but is not a directory.
pub fn create_directory(dir: &std::path::Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    if !dir.is_dir() {
        return Err(Error::DirError(format!(
            "create dir:{} error",
            dir.display()
        )));
    }
    Ok(())
}

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| Error::DirError("could not resolve the user's home directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static HOME_ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn resolve_nests_under_small_dragonfly() {
        let _guard = HOME_ENV_LOCK.lock().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("HOME", dir.path());
        let home = Home::resolve().unwrap();
        assert_eq!(home.usr_home, dir.path().join(".small-dragonfly"));
        assert_eq!(home.data_dir, home.usr_home.join("data"));
    }

    #[test]
    fn create_directories_is_idempotent() {
        let _guard = HOME_ENV_LOCK.lock().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("HOME", dir.path());
        let home = Home::resolve().unwrap();
        home.create_directories().unwrap();
        home.create_directories().unwrap();
        assert!(home.data_dir.is_dir());
    }

    #[test]
    fn create_directory_errors_when_path_is_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();
        assert!(create_directory(&file_path).is_err());
    }
}
