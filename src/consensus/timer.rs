use rand::Rng;
use std::time::Duration;

/// Draws a fresh election timeout uniformly from `[min_ms, max_ms)`.
///
/// Each election cycle uses a new draw, which keeps split votes rare and a
/// failed round retrying rather than deadlocking.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..max_ms.max(min_ms + 1));
    Duration::from_millis(timeout_ms)
}
