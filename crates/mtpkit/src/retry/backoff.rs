//! Exponential backoff for busy-class responses.

use std::time::Duration;

use log::debug;
use rand::Rng;

use super::fallback::RungFuture;
use crate::error::Error;

/// Minimum sleep between attempts, whatever the computed delay says.
const MIN_DELAY_MS: u64 = 50;

/// Retries an operation when the device answers busy-class codes
/// (DeviceBusy, SessionNotOpen, session-busy). Everything else propagates
/// on the first attempt; the last attempt's error is the one returned.
#[derive(Debug, Clone, Copy)]
pub struct BusyBackoff {
    pub retries: u32,
    pub base_ms: u64,
    pub jitter_pct: f64,
}

impl Default for BusyBackoff {
    fn default() -> Self {
        Self { retries: 3, base_ms: 200, jitter_pct: 0.2 }
    }
}

impl BusyBackoff {
    pub fn new(retries: u32, base_ms: u64, jitter_pct: f64) -> Self {
        Self { retries, base_ms, jitter_pct }
    }

    /// Sleep before retry `attempt` (1-based): `base · 2^(attempt-1)` plus a
    /// uniform jitter of ±`jitter_pct · base`, floored at 50 ms.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter_span = self.jitter_pct * self.base_ms as f64;
        let jitter = if jitter_span > 0.0 {
            rand::rng().random_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        let ms = (exp as f64 + jitter).max(MIN_DELAY_MS as f64);
        Duration::from_millis(ms as u64)
    }

    /// Runs `body` up to `retries + 1` times over the shared context.
    pub async fn run<Ctx, T, F>(&self, ctx: &mut Ctx, mut body: F) -> Result<T, Error>
    where
        F: for<'a> FnMut(&'a mut Ctx) -> RungFuture<'a, T> + Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match body(ctx).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy_retryable() && attempt <= self.retries => {
                    let delay = self.delay(attempt);
                    debug!(
                        "busy backoff: attempt {attempt} failed ({e}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
