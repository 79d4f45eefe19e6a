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

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_WINDOW: Duration = Duration::from_millis(2);

struct Bucket {
    /// capacity is the maximum number of tokens the bucket can hold.
    capacity: u64,
    /// raw is the requested rate in tokens/second, used to detect a
    /// genuine `refresh` (as opposed to one that leaves the rate
    /// unchanged).
    raw: u64,
    /// rate is tokens produced per window.
    rate: u64,
    window: Duration,
    last: Instant,
    tokens: u64,
}

/// RateLimiter is a token bucket shared across peer connections (the
/// piece server's global limiter) or owned by a single download (the
/// fetcher's and back-source downloader's per-session limiters).
/// `rate <= 0` disables the limiter entirely: every `acquire` is then
/// a pass-through that always succeeds.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self::with_window(rate, DEFAULT_WINDOW)
    }

    pub fn with_window(rate: u64, window: Duration) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                capacity: rate,
                raw: rate,
                rate: tokens_per_window(rate, window),
                window,
                last: Instant::now(),
                tokens: 0,
            }),
        }
    }

    /// acquire takes `tokens` from the bucket. When the bucket holds
    /// fewer than `tokens` and `blocking` is true, it sleeps for the
    /// minimum number of windows needed to cover the shortfall and
    /// retries. When `blocking` is false, an insufficient bucket
    /// returns `-1` instead of sleeping. A single request larger than
    /// the configured capacity is never refused: the capacity is
    /// raised to admit it instead.
    pub async fn acquire(&self, tokens: u64, blocking: bool) -> i64 {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.raw == 0 {
                    return tokens as i64;
                }
                if bucket.capacity < tokens {
                    bucket.capacity = tokens;
                }

                let now = Instant::now();
                let elapsed_windows =
                    (now.duration_since(bucket.last).as_secs_f64() / bucket.window.as_secs_f64())
                        .floor() as u64;
                let new_tokens = elapsed_windows.saturating_mul(bucket.rate);
                let available = (bucket.tokens.saturating_add(new_tokens)).min(bucket.capacity);

                if available >= tokens {
                    bucket.tokens = available - tokens;
                    bucket.last = now;
                    return tokens as i64;
                }

                if !blocking {
                    return -1;
                }

                let shortfall = tokens - available;
                let rate = bucket.rate.max(1);
                let windows_needed = shortfall.div_ceil(rate);
                bucket.window.mul_f64(windows_needed as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// refresh atomically resets capacity and per-window rate when
    /// `rate` differs from the currently configured rate; a no-op
    /// otherwise.
    pub async fn refresh(&self, rate: u64) {
        let mut bucket = self.bucket.lock().await;
        if bucket.raw != rate {
            bucket.capacity = rate;
            bucket.rate = tokens_per_window(rate, bucket.window);
            bucket.raw = rate;
        }
    }
}

fn tokens_per_window(rate: u64, window: Duration) -> u64 {
    (rate as f64 * window.as_secs_f64()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.acquire(1_000_000, false).await, 1_000_000);
    }

    #[tokio::test]
    async fn oversized_single_request_is_never_refused() {
        let limiter = RateLimiter::new(10);
        assert_eq!(limiter.acquire(1_000, true).await, 1_000);
    }

    #[tokio::test]
    async fn non_blocking_acquire_returns_negative_one_when_insufficient() {
        let limiter = RateLimiter::with_window(1, Duration::from_secs(3600));
        // Drain whatever tiny number of tokens accrued since construction.
        let _ = limiter.acquire(1_000_000, false).await;
        assert_eq!(limiter.acquire(1_000_000, false).await, -1);
    }

    #[tokio::test]
    async fn refresh_is_a_no_op_when_rate_is_unchanged() {
        let limiter = RateLimiter::new(100);
        limiter.acquire(50, true).await;
        limiter.refresh(100).await;
        // The bucket should not have been reset to full capacity.
        let bucket = limiter.bucket.lock().await;
        assert_eq!(bucket.capacity, 100);
    }

    #[tokio::test]
    async fn refresh_resets_capacity_when_rate_changes() {
        let limiter = RateLimiter::new(100);
        limiter.refresh(500).await;
        let bucket = limiter.bucket.lock().await;
        assert_eq!(bucket.capacity, 500);
        assert_eq!(bucket.raw, 500);
    }
}
