//! Per-sender sliding-window rate limiting.
//!
//! Each sender keeps the timestamps of its accepted requests. A request is
//! admitted while fewer than `max_requests` of them fall inside the last
//! `window_hours`. Rejected attempts are not recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Source of "now" for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<Windows>,
}

/// Accepted-request timestamps per normalized sender, oldest first.
struct Windows {
    by_sender: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_sweep: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let last_sweep = clock.now();
        Self {
            config,
            window: Duration::hours(i64::from(config.window_hours)),
            clock,
            state: Mutex::new(Windows {
                by_sender: HashMap::new(),
                last_sweep,
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Oldest instant that still counts against a sender's quota.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.clock.now() - self.window
    }

    /// Record a request accepted at `at`, e.g. one replayed from the queue
    /// after a restart. Timestamps outside the window are ignored.
    pub fn seed(&self, sender: &str, at: DateTime<Utc>) {
        let key = normalize(sender);
        if key.is_empty() || at <= self.window_start() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let window = state.by_sender.entry(key).or_default();
        let pos = window.partition_point(|t| *t <= at);
        window.insert(pos, at);
    }

    /// Admit one request from `sender` if it has quota left.
    pub fn is_allowed(&self, sender: &str) -> bool {
        let key = normalize(sender);
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.sweep_if_due(&mut state, now);

        let window = state.by_sender.entry(key).or_default();
        self.purge(window, now);

        if window.len() < self.config.max_requests as usize {
            window.push_back(now);
            debug!(
                sender,
                used = window.len(),
                max = self.config.max_requests,
                "Request admitted"
            );
            true
        } else {
            warn!(
                sender,
                max = self.config.max_requests,
                window_hours = self.config.window_hours,
                "Rate limit exceeded"
            );
            false
        }
    }

    /// Requests `sender` may still make in the current window.
    pub fn get_remaining(&self, sender: &str) -> u32 {
        let key = normalize(sender);
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let used = match state.by_sender.get_mut(&key) {
            Some(window) => {
                self.purge(window, now);
                let used = window.len();
                if used == 0 {
                    state.by_sender.remove(&key);
                }
                used
            }
            None => 0,
        };
        self.config
            .max_requests
            .saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
    }

    /// Drop senders with nothing left in their window, at most once per
    /// window length.
    fn sweep_if_due(&self, state: &mut Windows, now: DateTime<Utc>) {
        if now - state.last_sweep < self.window {
            return;
        }
        let before = state.by_sender.len();
        state.by_sender.retain(|_, window| {
            self.purge(window, now);
            !window.is_empty()
        });
        state.last_sweep = now;
        debug!(
            dropped = before - state.by_sender.len(),
            tracked = state.by_sender.len(),
            "Swept idle rate windows"
        );
    }

    fn purge(&self, window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
    }
}

fn normalize(sender: &str) -> String {
    sender.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Clock that only moves when told to.
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn limiter(max_requests: u32, window_hours: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimitConfig {
                max_requests,
                window_hours,
            },
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn allows_within_limit() {
        let (limiter, _) = limiter(30, 1);
        for _ in 0..30 {
            assert!(limiter.is_allowed("user@example.com"));
        }
    }

    #[test]
    fn blocks_over_limit() {
        let (limiter, _) = limiter(30, 1);
        for _ in 0..30 {
            limiter.is_allowed("user@example.com");
        }
        assert!(!limiter.is_allowed("user@example.com"));
    }

    #[test]
    fn remaining_counts_down() {
        let (limiter, _) = limiter(30, 1);
        assert_eq!(limiter.get_remaining("user@example.com"), 30);
        for _ in 0..5 {
            limiter.is_allowed("user@example.com");
        }
        assert_eq!(limiter.get_remaining("user@example.com"), 25);
    }

    #[test]
    fn remaining_floors_at_zero() {
        let (limiter, _) = limiter(3, 1);
        for _ in 0..10 {
            limiter.is_allowed("user@example.com");
        }
        assert_eq!(limiter.get_remaining("user@example.com"), 0);
    }

    #[test]
    fn window_expiry_restores_quota() {
        let (limiter, clock) = limiter(2, 1);
        assert!(limiter.is_allowed("user@example.com"));
        assert!(limiter.is_allowed("user@example.com"));
        assert!(!limiter.is_allowed("user@example.com"));

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        assert!(limiter.is_allowed("user@example.com"));
        assert_eq!(limiter.get_remaining("user@example.com"), 1);
    }

    #[test]
    fn custom_window_length() {
        let (limiter, clock) = limiter(1, 2);
        assert!(limiter.is_allowed("user@example.com"));

        clock.advance(Duration::minutes(90));
        assert!(!limiter.is_allowed("user@example.com"));

        clock.advance(Duration::minutes(31));
        assert!(limiter.is_allowed("user@example.com"));
    }

    #[test]
    fn senders_are_independent() {
        let (limiter, _) = limiter(1, 1);
        assert!(limiter.is_allowed("alice@example.com"));
        assert!(!limiter.is_allowed("alice@example.com"));
        assert!(limiter.is_allowed("bob@example.com"));
    }

    #[test]
    fn case_variants_share_a_window() {
        let (limiter, _) = limiter(2, 1);
        assert!(limiter.is_allowed("User@Example.com"));
        assert!(limiter.is_allowed("  user@example.com "));
        assert!(!limiter.is_allowed("USER@EXAMPLE.COM"));
    }

    #[test]
    fn rejected_attempts_do_not_extend_the_window() {
        let (limiter, clock) = limiter(1, 1);
        assert!(limiter.is_allowed("user@example.com"));

        clock.advance(Duration::minutes(30));
        assert!(!limiter.is_allowed("user@example.com"));

        clock.advance(Duration::minutes(31));
        assert!(limiter.is_allowed("user@example.com"));
    }

    fn tracked(limiter: &RateLimiter) -> usize {
        limiter.state.lock().unwrap().by_sender.len()
    }

    #[test]
    fn idle_senders_are_swept() {
        let (limiter, clock) = limiter(5, 1);
        limiter.is_allowed("a@example.com");
        limiter.is_allowed("b@example.com");
        assert_eq!(tracked(&limiter), 2);

        clock.advance(Duration::hours(2));
        limiter.is_allowed("c@example.com");
        assert_eq!(tracked(&limiter), 1);
        assert_eq!(limiter.get_remaining("c@example.com"), 4);
    }

    #[test]
    fn one_off_senders_do_not_accumulate() {
        let (limiter, clock) = limiter(5, 1);
        for i in 0..1_000 {
            limiter.is_allowed(&format!("sender{i}@example.com"));
            clock.advance(Duration::minutes(1));
        }
        // Nothing older than two windows survives a sweep.
        assert!(tracked(&limiter) <= 120, "tracked {}", tracked(&limiter));
    }

    #[test]
    fn seeded_requests_count_against_quota() {
        let (limiter, clock) = limiter(2, 1);
        let now = clock.now();
        limiter.seed("User@Example.com", now - Duration::minutes(10));
        limiter.seed("user@example.com", now - Duration::minutes(20));
        // Outside the window.
        limiter.seed("user@example.com", now - Duration::hours(2));

        assert_eq!(limiter.get_remaining("user@example.com"), 0);
        assert!(!limiter.is_allowed("user@example.com"));

        // The older seed expires first.
        clock.advance(Duration::minutes(41));
        assert_eq!(limiter.get_remaining("user@example.com"), 1);
        assert!(limiter.is_allowed("user@example.com"));
    }

    #[test]
    fn window_start_trails_the_clock() {
        let (limiter, clock) = limiter(1, 3);
        assert_eq!(limiter.window_start(), clock.now() - Duration::hours(3));
    }

    #[test]
    fn system_clock_limiter() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        assert_eq!(limiter.config().max_requests, 30);
        assert!(limiter.is_allowed("user@example.com"));
        assert_eq!(limiter.get_remaining("user@example.com"), 29);
    }
}
