//! Sliding-window request throttle.
//!
//! A [`RateLimiter`] enforces several trailing-window rules at once
//! ("no more than 10 calls in 10 seconds, 20 in a minute, 150 in ten
//! minutes") from a single shared log of recent calls. Callers invoke
//! [`RateLimiter::before_call`] immediately before issuing a request; the
//! call returns once issuing it would not break any rule, and the call is
//! recorded at that moment. Nothing is ever dropped, only delayed.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::RateLimitError;

/// Number of recent calls remembered when no capacity is given.
pub const DEFAULT_CALL_LOG_CAPACITY: usize = 200;

/// Longest single sleep between two rule checks.
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_secs(5);

/// A single "at most `max_count` calls per `window_secs` seconds" rule.
///
/// Serialized as a `[max_count, window_secs]` pair so rule lists read
/// naturally in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(usize, u64)", into = "(usize, u64)")]
pub struct RateWindowRule {
    max_count: usize,
    window_secs: u64,
}

impl RateWindowRule {
    /// Create a rule. Both the count and the window must be non-zero.
    pub fn new(max_count: usize, window_secs: u64) -> Result<Self, RateLimitError> {
        if max_count == 0 || window_secs == 0 {
            return Err(RateLimitError::InvalidRule {
                max_count,
                window_secs,
            });
        }
        Ok(Self {
            max_count,
            window_secs,
        })
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl TryFrom<(usize, u64)> for RateWindowRule {
    type Error = RateLimitError;

    fn try_from((max_count, window_secs): (usize, u64)) -> Result<Self, Self::Error> {
        Self::new(max_count, window_secs)
    }
}

impl From<RateWindowRule> for (usize, u64) {
    fn from(rule: RateWindowRule) -> Self {
        (rule.max_count, rule.window_secs)
    }
}

impl fmt::Display for RateWindowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} calls/{}s", self.max_count, self.window_secs)
    }
}

/// One recorded call: when it was released and which endpoint it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTimestamp {
    pub at: Instant,
    pub endpoint: String,
}

/// Multi-window sliding rate limiter.
///
/// The call log is a fixed-capacity ring: once full, the oldest entry is
/// overwritten. Checking and recording happen under one lock, so
/// concurrent callers can never both slip into the last free slot.
pub struct RateLimiter {
    rules: Vec<RateWindowRule>,
    calls: Mutex<VecDeque<CallTimestamp>>,
    capacity: usize,
    backoff: Duration,
}

impl RateLimiter {
    /// Create a limiter with the default call-log capacity and backoff.
    pub fn new(rules: Vec<RateWindowRule>) -> Result<Self, RateLimitError> {
        Self::with_capacity(rules, DEFAULT_CALL_LOG_CAPACITY)
    }

    /// Create a limiter remembering up to `capacity` calls.
    ///
    /// # Errors
    /// Returns [`RateLimitError::CapacityTooSmall`] when a rule needs more
    /// history than the log can hold, since such a rule could never fire,
    /// and [`RateLimitError::EmptyCallLog`] for a capacity of zero.
    pub fn with_capacity(
        rules: Vec<RateWindowRule>,
        capacity: usize,
    ) -> Result<Self, RateLimitError> {
        if capacity == 0 {
            return Err(RateLimitError::EmptyCallLog);
        }
        if let Some(rule) = rules.iter().find(|r| r.max_count > capacity) {
            return Err(RateLimitError::CapacityTooSmall {
                capacity,
                max_count: rule.max_count,
            });
        }
        Ok(Self {
            rules,
            calls: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            backoff: DEFAULT_THROTTLE_BACKOFF,
        })
    }

    /// Cap each individual sleep at `backoff`. Rules are always re-checked
    /// from scratch after waking, since other callers may have gone first.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// The service's published limits: 10 calls/10s, 20/min, 150/10min.
    pub fn default_rules() -> Vec<RateWindowRule> {
        [(10, 10), (20, 60), (150, 600)]
            .into_iter()
            .map(|(count, secs)| RateWindowRule {
                max_count: count,
                window_secs: secs,
            })
            .collect()
    }

    pub fn rules(&self) -> &[RateWindowRule] {
        &self.rules
    }

    /// Wait until a call to `endpoint` would not violate any rule, then
    /// record it.
    pub async fn before_call(&self, endpoint: &str) {
        loop {
            let now = Instant::now();
            let mut calls = self.calls.lock().await;

            let Some((rule, remaining)) = self.longest_violation(&calls, now) else {
                while calls.len() >= self.capacity {
                    calls.pop_front();
                }
                calls.push_back(CallTimestamp {
                    at: now,
                    endpoint: endpoint.to_string(),
                });
                return;
            };
            drop(calls);

            log::info!(
                "Throttling: more than {} requests in {} seconds - {}",
                rule.max_count,
                rule.window_secs,
                endpoint
            );
            sleep(remaining.min(self.backoff)).await;
        }
    }

    /// Snapshot of the recorded calls, oldest first.
    pub async fn recorded_calls(&self) -> Vec<CallTimestamp> {
        self.calls.lock().await.iter().cloned().collect()
    }

    /// Count recorded calls inside each trailing window.
    ///
    /// Counts are bounded by the log capacity, so long windows under heavy
    /// traffic report a lower bound.
    pub async fn usage(&self, windows: &[Duration]) -> Vec<(Duration, usize)> {
        let now = Instant::now();
        let calls = self.calls.lock().await;
        windows
            .iter()
            .map(|&window| {
                let count = calls
                    .iter()
                    .rev()
                    .take_while(|c| now.saturating_duration_since(c.at) < window)
                    .count();
                (window, count)
            })
            .collect()
    }

    /// Find the rule that is violated for the longest remaining time.
    ///
    /// A rule of `c` calls per `w` is violated when the `c`-th most recent
    /// recorded call is younger than `w`: letting another call through
    /// would put `c + 1` calls inside one window.
    fn longest_violation(
        &self,
        calls: &VecDeque<CallTimestamp>,
        now: Instant,
    ) -> Option<(RateWindowRule, Duration)> {
        self.rules
            .iter()
            .filter(|rule| calls.len() >= rule.max_count)
            .filter_map(|rule| {
                let nth = &calls[calls.len() - rule.max_count];
                let elapsed = now.saturating_duration_since(nth.at);
                (elapsed < rule.window()).then(|| (*rule, rule.window() - elapsed))
            })
            .max_by_key(|(_, remaining)| *remaining)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rules", &self.rules)
            .field("capacity", &self.capacity)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time;

    use super::*;

    fn rule(count: usize, secs: u64) -> RateWindowRule {
        RateWindowRule::new(count, secs).unwrap()
    }

    /// Every run of `c + 1` consecutive calls must span at least `w`.
    fn assert_rules_hold(calls: &[CallTimestamp], rules: &[RateWindowRule]) {
        for r in rules {
            for run in calls.windows(r.max_count() + 1) {
                let span = run[run.len() - 1].at - run[0].at;
                assert!(
                    span >= r.window(),
                    "{} violated: {} calls within {:?}",
                    r,
                    run.len(),
                    span
                );
            }
        }
    }

    #[test]
    fn test_rule_rejects_zero_values() {
        assert!(RateWindowRule::new(0, 10).is_err());
        assert!(RateWindowRule::new(10, 0).is_err());
        assert!(RateWindowRule::new(1, 1).is_ok());
    }

    #[test]
    fn test_capacity_must_cover_rules() {
        let err = RateLimiter::with_capacity(vec![rule(50, 10)], 20).unwrap_err();
        assert_eq!(
            err,
            RateLimitError::CapacityTooSmall {
                capacity: 20,
                max_count: 50
            }
        );
    }

    #[test]
    fn test_default_rules() {
        let rules = RateLimiter::default_rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].max_count(), 10);
        assert_eq!(rules[2].window(), Duration::from_secs(600));
        let limiter = RateLimiter::new(rules).unwrap();
        assert_eq!(limiter.rules().len(), 3);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(
            RateLimiter::with_capacity(vec![], 0).unwrap_err(),
            RateLimitError::EmptyCallLog
        );
        assert!(RateLimiter::with_capacity(vec![], 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_call_waits_for_window() {
        let limiter = RateLimiter::new(vec![rule(2, 10)]).unwrap();
        let start = Instant::now();

        limiter.before_call("a").await;
        time::advance(Duration::from_secs(1)).await;
        limiter.before_call("b").await;
        time::advance(Duration::from_secs(1)).await;
        limiter.before_call("c").await;

        let calls = limiter.recorded_calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].at - start, Duration::from_secs(10));
        assert_eq!(calls[2].endpoint, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_under_limit_are_not_delayed() {
        let limiter = RateLimiter::new(vec![rule(5, 10)]).unwrap();
        let start = Instant::now();
        for i in 0..5 {
            limiter.before_call(&format!("call-{i}")).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_respect_every_rule() {
        let rules = vec![rule(3, 5), rule(5, 20), rule(8, 60)];
        let limiter = RateLimiter::new(rules.clone()).unwrap();

        for i in 0..40 {
            limiter.before_call(&format!("call-{i}")).await;
            let calls = limiter.recorded_calls().await;
            assert_rules_hold(&calls, &rules);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_log() {
        let rules = vec![rule(2, 10)];
        let limiter = Arc::new(RateLimiter::new(rules.clone()).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.before_call(&format!("task-{i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let calls = limiter.recorded_calls().await;
        assert_eq!(calls.len(), 6);
        assert_rules_hold(&calls, &rules);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_overwrites_oldest_when_full() {
        let limiter = RateLimiter::with_capacity(vec![rule(2, 1)], 3).unwrap();
        for i in 0..5 {
            limiter.before_call(&format!("call-{i}")).await;
        }
        let endpoints: Vec<_> = limiter
            .recorded_calls()
            .await
            .into_iter()
            .map(|c| c.endpoint)
            .collect();
        assert_eq!(endpoints, ["call-2", "call-3", "call-4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_counts_trailing_windows() {
        let limiter = RateLimiter::new(vec![rule(100, 1)]).unwrap();
        limiter.before_call("old").await;
        time::advance(Duration::from_secs(30)).await;
        limiter.before_call("recent").await;
        limiter.before_call("recent").await;

        let usage = limiter
            .usage(&[Duration::from_secs(10), Duration::from_secs(60)])
            .await;
        assert_eq!(usage[0], (Duration::from_secs(10), 2));
        assert_eq!(usage[1], (Duration::from_secs(60), 3));
    }

    #[test]
    fn test_rule_serde_as_pair() {
        let rule: RateWindowRule = serde_json::from_str("[20, 60]").unwrap();
        assert_eq!(rule.max_count(), 20);
        assert!(serde_json::from_str::<RateWindowRule>("[0, 60]").is_err());
    }
}
