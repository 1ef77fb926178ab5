//! Cooperative cancellation and retry backoff for [`super::SyncController::sync_with`].
//!
//! No external RNG crate is in this workspace's dependency graph, so jitter
//! uses a small xorshift generator seeded from the system clock. It is not
//! cryptographic; it only needs to avoid synchronized retry storms across
//! concurrent syncs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{JitterKind, SyncPolicy};

/// Cooperative cancellation flag, cloneable so a caller can hold one half
/// and trigger it while [`super::SyncController::sync_with`] runs on the
/// other.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// A fresh, not-yet-aborted signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether `abort()` has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A minimal xorshift64* generator, good enough for retry jitter.
pub struct Rng(u64);

impl Rng {
    /// Construct with an explicit seed, for deterministic tests.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    /// Construct seeded from the system clock plus a process-local counter,
    /// so back-to-back calls in the same microsecond still diverge.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let counter = ENTROPY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::seeded(nanos ^ counter.wrapping_mul(0x2545_F491_4F6C_DD1D))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform integer in `[low, high)`. Returns `low` if `high <= low`.
    pub fn gen_range(&mut self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        low + self.next_u64() % (high - low)
    }
}

/// Compute the delay before the next retry attempt, per `policy`'s backoff
/// and jitter settings.
///
/// `attempt` is the zero-based attempt number that just failed; `previous_delay_ms`
/// is the delay actually used before that attempt (needed for decorrelated
/// jitter, which derives the next window from the last one rather than a
/// pure exponential curve).
pub fn next_delay_ms(policy: &SyncPolicy, attempt: u32, previous_delay_ms: u64, rng: &mut Rng) -> u64 {
    let shift = attempt.min(32);
    let exponential = policy.base_delay_ms.saturating_mul(1u64 << shift).min(policy.max_delay_ms);

    match policy.jitter {
        JitterKind::None => exponential,
        JitterKind::Full => rng.gen_range(0, exponential.max(1)),
        JitterKind::Decorrelated => {
            let low = policy.base_delay_ms;
            let high = previous_delay_ms.max(policy.base_delay_ms).saturating_mul(3).min(policy.max_delay_ms);
            rng.gen_range(low, high.max(low + 1)).min(policy.max_delay_ms)
        }
    }
}
