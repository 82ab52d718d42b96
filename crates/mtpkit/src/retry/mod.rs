//! Retry machinery: ordered fallback ladders and busy backoff.

mod backoff;
mod fallback;

pub use backoff::BusyBackoff;
pub use fallback::{AttemptRecord, FallbackLadder, LadderOutcome, RungFuture};
