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

use std::path::{Path, PathBuf};

/// execute_sign is `<pid>-<start_epoch_seconds_with_ms>`, the per-process
/// suffix that makes a task file name and cid unique to this invocation.
pub fn execute_sign(pid: u32, start_epoch_seconds: f64) -> String {
    format!("{pid}-{start_epoch_seconds:.3}")
}

/// TaskPaths derives every on-disk name the scheduler and writer need
/// from the target output path, the data directory, and the process's
/// execute sign.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    /// task_file_name (TFN) identifies this download on the host.
    pub task_file_name: String,
    data_dir: PathBuf,
    real_target: PathBuf,
}

impl TaskPaths {
    pub fn new(real_target: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, sign: &str) -> Self {
        let real_target = real_target.into();
        let basename = real_target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            task_file_name: format!("{basename}-{sign}"),
            data_dir: data_dir.into(),
            real_target,
        }
    }

    /// service_file is where verified framed pieces are written; it
    /// becomes the canonical source for serving peers.
    pub fn service_file(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.service", self.task_file_name))
    }

    /// client_file is a hardlink exposing the service file (or the
    /// mirror target, in across-write mode) under the bare task name.
    pub fn client_file(&self) -> PathBuf {
        self.data_dir.join(&self.task_file_name)
    }

    pub fn real_target(&self) -> &Path {
        &self.real_target
    }

    /// task_name_from_service_path strips the `.service` suffix,
    /// mirroring `core.get_task_name` which the GC uses to look an
    /// on-disk file back up in the piece server's task map.
    pub fn task_name_from_service_path(file_name: &str) -> &str {
        match file_name.rfind(".service") {
            Some(idx) => &file_name[..idx],
            None => file_name,
        }
    }
}

/// cid is this client's peer identity at the supernode: `<local_ip>-<sign>`.
pub fn cid(local_ip: &str, sign: &str) -> String {
    format!("{local_ip}-{sign}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_file_name_combines_basename_and_sign() {
        let paths = TaskPaths::new("/tmp/out/archive.tar.gz", "/data", "123-456.789");
        assert_eq!(paths.task_file_name, "archive.tar.gz-123-456.789");
    }

    #[test]
    fn service_and_client_files_live_in_data_dir() {
        let paths = TaskPaths::new("/tmp/out/archive.tar.gz", "/data", "123-456.789");
        assert_eq!(
            paths.service_file(),
            PathBuf::from("/data/archive.tar.gz-123-456.789.service")
        );
        assert_eq!(
            paths.client_file(),
            PathBuf::from("/data/archive.tar.gz-123-456.789")
        );
    }

    #[test]
    fn task_name_from_service_path_strips_suffix() {
        assert_eq!(
            TaskPaths::task_name_from_service_path("archive-1-2.3.service"),
            "archive-1-2.3"
        );
        assert_eq!(
            TaskPaths::task_name_from_service_path("archive-1-2.3"),
            "archive-1-2.3"
        );
    }

    #[test]
    fn cid_combines_ip_and_sign() {
        assert_eq!(cid("10.0.0.5", "123-456.789"), "10.0.0.5-123-456.789");
    }
}
