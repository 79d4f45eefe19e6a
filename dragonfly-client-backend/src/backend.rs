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
use dragonfly_client_util::limiter::RateLimiter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// DownloadRequest describes a direct (non-p2p) fetch of the origin
/// URL, the only shape the back-to-source path needs.
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// target_dir is where the backend creates its `.backsource`
    /// staging file before the caller moves it into place.
    pub target_dir: PathBuf,
    /// expected_md5, when set, is verified against the downloaded
    /// bytes before the caller is told the download is usable.
    pub expected_md5: Option<String>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// DownloadResult reports where the downloaded bytes ended up and how
/// many were written, so the caller can move the staging file into the
/// final target.
pub struct DownloadResult {
    pub staged_path: PathBuf,
    pub total_bytes: u64,
}

/// Backend is implemented by each pluggable origin-download
/// mechanism. Only an HTTP backend is used today, but the trait is
/// kept object-safe so additional schemes (object storage, etc.) can
/// be added without touching the back-to-source call site.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn download(&self, request: DownloadRequest) -> Result<DownloadResult>;
}
