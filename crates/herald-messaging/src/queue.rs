//! Retry scheduling for the federated delivery queue.
//!
//! The policy is exponential backoff with jitter: the n-th failure schedules
//! the next attempt `base * 2^(n-1)` seconds out, plus up to 25% jitter,
//! never beyond the configured cap. Paired with the hard `max_attempts`
//! ceiling this spaces retries out without retrying forever.

use chrono::Duration;
use rand::Rng;

use herald_common::config::FederationConfig;

/// Deterministic part of the delay after `failures` consecutive failures
/// (`failures >= 1`), in seconds.
pub fn backoff_floor_secs(failures: u32, cfg: &FederationConfig) -> u64 {
    let n = failures.max(1);
    let exp = cfg
        .backoff_base_secs
        .saturating_mul(2u64.saturating_pow((n - 1).min(32)));
    exp.min(cfg.backoff_cap_secs)
}

/// Full jittered delay after `failures` consecutive failures.
///
/// The jitter spreads a burst of same-aged tasks so a recovering node is not
/// hit by all of them in the same second; it never pushes the delay past the
/// cap.
pub fn backoff_delay(failures: u32, cfg: &FederationConfig) -> Duration {
    let floor = backoff_floor_secs(failures, cfg);
    let jitter = rand::rng().random_range(0..=floor / 4);
    let secs = floor.saturating_add(jitter).min(cfg.backoff_cap_secs.max(floor));
    Duration::seconds(secs as i64)
}
