//! C1 — per-user token bucket over provider calls (spec §4.1).
//!
//! Grounded in the teacher's `crates/smtp/src/core/throttle.rs`
//! concurrency/rate dual-check (`is_allowed`) and `crates/smtp/src/queue/throttle.rs`'s
//! keyed-limiter-over-a-concurrent-map shape; `dashmap::Entry` there plays
//! the same role `governor`'s keyed rate limiter plays here. `governor`
//! itself is the token-bucket crate the wider example pack reaches for
//! (`sgunadhya-oxidesk`, `sparklive-rustmailer`) rather than a hand-rolled
//! bucket.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ok,
    /// Refusal is a normal result, never an error (spec §4.1 "never fails").
    RetryAfterMs(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct Capacity {
    pub per_sec: u32,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub read: Capacity,
    pub write: Capacity,
    /// project-wide ceiling, spec §4.1 "global per-process bucket".
    pub daily_ceiling: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            read: Capacity { per_sec: 5, burst: 5 },
            write: Capacity { per_sec: 5, burst: 5 },
            daily_ceiling: 1_000_000,
        }
    }
}

fn quota(cap: Capacity) -> Quota {
    let per_sec = NonZeroU32::new(cap.per_sec.max(1)).unwrap();
    let burst = NonZeroU32::new(cap.burst.max(1)).unwrap();
    Quota::per_second(per_sec).allow_burst(burst)
}

fn daily_quota(ceiling: u32) -> Quota {
    let ceiling = ceiling.max(1);
    let replenish_every_secs = (24 * 60 * 60 / ceiling as u64).max(1);
    Quota::with_period(Duration::from_secs(replenish_every_secs))
        .expect("nonzero period")
        .allow_burst(NonZeroU32::new(ceiling).unwrap())
}

/// Shared mutable state; every access goes through `governor`'s own
/// internal synchronization (spec §5 "Callers treat it as a single
/// point"). Single-process correctness is exact; under multiple workers
/// this in-memory limiter is best-effort per spec §4.1 — a distributed
/// deployment would swap `Coordinator` for one backed by a shared
/// counter store (e.g. Redis `INCR`/`EXPIRE`), which is not implemented
/// here since the spec only requires correctness for one process.
pub struct RateLimiter {
    read: DefaultKeyedRateLimiter<UserId>,
    write: DefaultKeyedRateLimiter<UserId>,
    daily: DefaultDirectRateLimiter,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            read: GovernorLimiter::keyed(quota(config.read)),
            write: GovernorLimiter::keyed(quota(config.write)),
            daily: GovernorLimiter::direct(daily_quota(config.daily_ceiling)),
        }
    }

    /// `acquire` never blocks; it reports either `Ok` or the delay until
    /// the next token, per spec §4.1's explicit contract.
    pub fn acquire(&self, user: UserId, kind: BucketKind) -> Decision {
        if let Err(not_until) = self.daily.check() {
            return Decision::RetryAfterMs(wait_time_ms(not_until.wait_time_from(DefaultClock::default().now())));
        }

        let bucket = match kind {
            BucketKind::Read => &self.read,
            BucketKind::Write => &self.write,
        };

        match bucket.check_key(&user) {
            Ok(()) => Decision::Ok,
            Err(not_until) => {
                Decision::RetryAfterMs(wait_time_ms(not_until.wait_time_from(DefaultClock::default().now())))
            }
        }
    }

    /// Convenience for callers willing to wait up to `deadline` for a
    /// token rather than handling the refusal themselves (still bounded
    /// — spec §4.1 "never blocks longer than a caller-supplied deadline").
    pub async fn acquire_within(&self, user: UserId, kind: BucketKind, deadline: Duration) -> Decision {
        match self.acquire(user, kind) {
            Decision::Ok => Decision::Ok,
            Decision::RetryAfterMs(ms) if Duration::from_millis(ms) <= deadline => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.acquire(user, kind)
            }
            other => other,
        }
    }
}

fn wait_time_ms(wait: Duration) -> u64 {
    wait.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid() -> UserId {
        UserId(uuid::Uuid::new_v4())
    }

    #[test]
    fn burst_then_refusal_with_retry_after() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            read: Capacity { per_sec: 1, burst: 1 },
            write: Capacity { per_sec: 1, burst: 1 },
            daily_ceiling: 1_000_000,
        });
        let user = uid();
        assert_eq!(limiter.acquire(user, BucketKind::Read), Decision::Ok);
        match limiter.acquire(user, BucketKind::Read) {
            Decision::RetryAfterMs(ms) => assert!(ms > 0),
            Decision::Ok => panic!("expected refusal after burst exhausted"),
        }
    }

    #[test]
    fn read_and_write_buckets_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            read: Capacity { per_sec: 1, burst: 1 },
            write: Capacity { per_sec: 1, burst: 1 },
            daily_ceiling: 1_000_000,
        });
        let user = uid();
        assert_eq!(limiter.acquire(user, BucketKind::Read), Decision::Ok);
        // Write bucket is untouched by exhausting read.
        assert_eq!(limiter.acquire(user, BucketKind::Write), Decision::Ok);
    }

    #[test]
    fn users_do_not_starve_each_other() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            read: Capacity { per_sec: 1, burst: 1 },
            write: Capacity { per_sec: 1, burst: 1 },
            daily_ceiling: 1_000_000,
        });
        let a = uid();
        let b = uid();
        assert_eq!(limiter.acquire(a, BucketKind::Read), Decision::Ok);
        // b's bucket is independent of a's exhausted one.
        assert_eq!(limiter.acquire(b, BucketKind::Read), Decision::Ok);
    }

    #[tokio::test]
    async fn acquire_within_waits_for_bounded_delay() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            read: Capacity { per_sec: 20, burst: 1 },
            write: Capacity { per_sec: 20, burst: 1 },
            daily_ceiling: 1_000_000,
        });
        let user = uid();
        assert_eq!(limiter.acquire(user, BucketKind::Read), Decision::Ok);
        let decision = limiter
            .acquire_within(user, BucketKind::Read, Duration::from_millis(500))
            .await;
        assert_eq!(decision, Decision::Ok);
    }
}
