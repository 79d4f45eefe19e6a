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

use std::sync::atomic::{AtomicU32, Ordering};

/// Result is the result type used throughout the dragonfly client crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Error enumerates every way a download session can fail. Each variant
/// mirrors one of the error kinds of the original client: a parameter
/// validation failure, a download or directory error, and so on.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// ParamError means a CLI parameter failed validation.
    #[error("invalid parameter: {0}")]
    ParamError(String),

    /// DownError means the p2p download path failed terminally.
    #[error("download error: {0}")]
    DownError(String),

    /// DirError means a directory could not be created or inspected.
    #[error("directory error: {0}")]
    DirError(String),

    /// SpaceLackError means the data or target filesystem lacks free space.
    #[error("space lack: {0}")]
    SpaceLackError(String),

    /// Md5NotMatchError means a digest check against the supernode's
    /// declared value failed.
    #[error("md5 not match: {0}")]
    Md5NotMatchError(String),

    /// FileIOError means a filesystem operation on the service, client,
    /// or target file failed.
    #[error("file io error: {0}")]
    FileIOError(String),

    /// ReadTimeoutError means a piece GET exceeded its read budget.
    #[error("read timeout: {0}")]
    ReadTimeoutError(String),

    /// NeedBack unwinds a p2p session into the back-to-source fallback.
    #[error("need back-to-source: {0}")]
    NeedBack(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// BackReason is the process-wide reason a session fell back to
/// direct source download. `None` means no fallback is in progress.
/// `BACK_REASON_ADDITION` is added when `--notbs` forced the scheduler
/// to skip back-to-source entirely rather than run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BackReason {
    None = 0,
    RegisterFail = 1,
    Md5NotMatch = 2,
    DownError = 3,
    NoSpace = 4,
    InitError = 5,
    WriteError = 6,
    HostSysError = 7,
    /// SourceError covers a back-to-source download failing outright,
    /// a locally-assigned code with no upstream equivalent.
    SourceError = 8,
    /// NodeEmpty means every supernode candidate was exhausted before
    /// one accepted registration.
    NodeEmpty = 9,
}

/// Added to a back reason's numeric code when `--notbs` forced the
/// client to skip the back-to-source fallback.
pub const BACK_REASON_ADDITION: u32 = 1000;

impl BackReason {
    pub fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code % BACK_REASON_ADDITION {
            0 => Some(BackReason::None),
            1 => Some(BackReason::RegisterFail),
            2 => Some(BackReason::Md5NotMatch),
            3 => Some(BackReason::DownError),
            4 => Some(BackReason::NoSpace),
            5 => Some(BackReason::InitError),
            6 => Some(BackReason::WriteError),
            7 => Some(BackReason::HostSysError),
            8 => Some(BackReason::SourceError),
            9 => Some(BackReason::NodeEmpty),
            _ => None,
        }
    }
}

/// BackReasonCell is a lock-free cell so any task can read or set the
/// session-wide fallback reason without a mutex.
#[derive(Debug, Default)]
pub struct BackReasonCell(AtomicU32);

impl BackReasonCell {
    pub fn new() -> Self {
        Self(AtomicU32::new(BackReason::None.code()))
    }

    /// set records `reason` unless a reason is already recorded: the
    /// first failure wins, matching the Python client's `if not
    /// env.back_reason: env.back_reason = ...` guard.
    pub fn set(&self, reason: BackReason) {
        let _ = self.0.compare_exchange(
            BackReason::None.code(),
            reason.code(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// force unconditionally overwrites the stored reason.
    pub fn force(&self, reason: BackReason) {
        self.0.store(reason.code(), Ordering::SeqCst);
    }

    pub fn get(&self) -> BackReason {
        BackReason::from_code(self.0.load(Ordering::SeqCst)).unwrap_or(BackReason::None)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst) != BackReason::None.code()
    }

    /// add_notbs_addition adds `BACK_REASON_ADDITION` to the stored
    /// reason so the process exit code reflects that back-to-source was
    /// deliberately skipped.
    pub fn add_notbs_addition(&self) {
        let cur = self.0.load(Ordering::SeqCst);
        if cur != BackReason::None.code() && cur < BACK_REASON_ADDITION {
            self.0.store(cur + BACK_REASON_ADDITION, Ordering::SeqCst);
        }
    }

    /// exit_code maps the stored reason to the process exit code: 0
    /// when none is set, the reason's raw numeric code otherwise.
    pub fn exit_code(&self) -> i32 {
        self.0.load(Ordering::SeqCst) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let cell = BackReasonCell::new();
        cell.set(BackReason::DownError);
        cell.set(BackReason::WriteError);
        assert_eq!(cell.get(), BackReason::DownError);
    }

    #[test]
    fn notbs_addition_applies_once() {
        let cell = BackReasonCell::new();
        cell.set(BackReason::DownError);
        cell.add_notbs_addition();
        assert_eq!(cell.exit_code(), 1003);
        cell.add_notbs_addition();
        assert_eq!(cell.exit_code(), 1003);
    }

    #[test]
    fn none_has_zero_exit_code() {
        let cell = BackReasonCell::new();
        assert_eq!(cell.exit_code(), 0);
        assert!(!cell.is_set());
    }
}
