//! Confirmation code registry.
//!
//! The PCI serial protocol acknowledges commands by echoing back a
//! single-byte code the host chose when it sent the command. Only twenty
//! codes exist (`codec::framing::CONFIRMATION_ALPHABET`), so they're leased
//! out round-robin and reclaimed on acknowledgement, on timeout, or under
//! memory pressure when every code is in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::codec::framing::CONFIRMATION_ALPHABET;

/// How long an in-flight code can sit unacknowledged before the reaper
/// reclaims it.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Polling interval `acquire` uses once the pool is fully exhausted even
/// after a reap and a forced release.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// `acquire` gives up waiting for a free code after this long and
/// force-releases the oldest lease unconditionally.
const ACQUIRE_BACKSTOP: Duration = Duration::from_secs(3);
/// Fraction of the pool in use at which `try_acquire` force-releases the
/// oldest lease before handing out a new one.
const PRESSURE_RATIO: f32 = 0.9;

struct Lease {
    code: u8,
    acquired_at: Instant,
}

/// Bounded pool of in-flight confirmation codes. Not thread-safe on its
/// own; the PCI session wraps one in an `Arc<Mutex<_>>` (see [`acquire`]).
pub struct ConfirmationRegistry {
    in_use: VecDeque<Lease>,
    cursor: usize,
}

impl ConfirmationRegistry {
    pub fn new() -> Self {
        Self {
            in_use: VecDeque::new(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        CONFIRMATION_ALPHABET.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    fn pressure(&self) -> f32 {
        self.in_use.len() as f32 / self.capacity() as f32
    }

    /// Reclaims any lease older than [`CONFIRMATION_TIMEOUT`], returning the
    /// reclaimed codes.
    pub fn reap_timed_out(&mut self) -> Vec<u8> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        self.in_use.retain(|lease| {
            if now.duration_since(lease.acquired_at) >= CONFIRMATION_TIMEOUT {
                reaped.push(lease.code);
                false
            } else {
                true
            }
        });
        if !reaped.is_empty() {
            warn!(?reaped, "reaped timed-out confirmation codes");
        }
        reaped
    }

    /// Force-releases the single oldest lease, if any. Used under pressure
    /// and by `acquire`'s absolute backstop.
    pub fn force_release_oldest(&mut self) -> Option<u8> {
        let oldest = self.in_use.pop_front()?;
        warn!(
            code = oldest.code as char,
            "force-released oldest confirmation lease"
        );
        Some(oldest.code)
    }

    /// Releases a code once its confirmation arrives (or its owner gives up
    /// retrying it). No-op if the code isn't currently leased.
    pub fn release(&mut self, code: u8) {
        if let Some(pos) = self.in_use.iter().position(|l| l.code == code) {
            self.in_use.remove(pos);
        }
    }

    /// Non-blocking allocation attempt: reaps timed-out leases, force-frees
    /// the oldest under pressure, then scans the alphabet round-robin for a
    /// free code. Returns `None` if every code is genuinely in use.
    pub fn try_acquire(&mut self) -> Option<u8> {
        self.reap_timed_out();
        if self.pressure() >= PRESSURE_RATIO {
            self.force_release_oldest();
        }
        for _ in 0..self.capacity() {
            let candidate = CONFIRMATION_ALPHABET[self.cursor];
            self.cursor = (self.cursor + 1) % self.capacity();
            if !self.in_use.iter().any(|l| l.code == candidate) {
                self.in_use.push_back(Lease {
                    code: candidate,
                    acquired_at: Instant::now(),
                });
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for ConfirmationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquires a code from `registry`, cooperatively polling at
/// [`ACQUIRE_POLL_INTERVAL`] if the pool is momentarily exhausted, and
/// force-releasing the oldest lease after [`ACQUIRE_BACKSTOP`] so a stuck
/// pool never blocks forever.
pub async fn acquire(registry: &Arc<Mutex<ConfirmationRegistry>>) -> u8 {
    let deadline = Instant::now() + ACQUIRE_BACKSTOP;
    loop {
        {
            let mut guard = registry.lock().await;
            if let Some(code) = guard.try_acquire() {
                return code;
            }
            if Instant::now() >= deadline {
                guard.force_release_oldest();
                if let Some(code) = guard.try_acquire() {
                    return code;
                }
            }
        }
        tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_never_hands_out_the_same_code_twice() {
        let mut reg = ConfirmationRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..reg.capacity() {
            let code = reg.try_acquire().unwrap();
            assert!(seen.insert(code), "code {code} handed out twice while in use");
        }
    }

    #[test]
    fn release_frees_a_slot_for_reuse() {
        let mut reg = ConfirmationRegistry::new();
        let first = reg.try_acquire().unwrap();
        reg.release(first);
        for _ in 1..reg.capacity() {
            reg.try_acquire().unwrap();
        }
        assert!(reg.try_acquire().is_some());
    }

    #[test]
    fn pool_never_exceeds_alphabet_size() {
        let mut reg = ConfirmationRegistry::new();
        for _ in 0..reg.capacity() {
            reg.try_acquire().unwrap();
        }
        assert_eq!(reg.in_use_count(), reg.capacity());
    }

    #[test]
    fn full_pool_force_releases_oldest_under_pressure() {
        let mut reg = ConfirmationRegistry::new();
        let first = reg.try_acquire().unwrap();
        // Fill to >= 90% pressure (18 of 20 codes).
        for _ in 1..18 {
            reg.try_acquire().unwrap();
        }
        assert_eq!(reg.in_use_count(), 18);
        let _next = reg.try_acquire().unwrap();
        // Pressure crossed the threshold, so the oldest (`first`) should
        // have been evicted rather than the pool growing past capacity.
        assert!(reg.in_use_count() <= reg.capacity());
        let _ = first;
    }

    #[tokio::test]
    async fn acquire_resolves_once_a_code_is_released() {
        let registry = Arc::new(Mutex::new(ConfirmationRegistry::new()));
        let mut held = Vec::new();
        {
            let mut guard = registry.lock().await;
            for _ in 0..guard.capacity() {
                held.push(guard.try_acquire().unwrap());
            }
        }
        let registry_clone = registry.clone();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry_clone.lock().await.release(held[0]);
        });
        let code = acquire(&registry).await;
        assert_eq!(code, held[0]);
        releaser.await.unwrap();
    }
}
