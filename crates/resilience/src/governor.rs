//! Outbound call-rate governor.
//!
//! A rolling-window ledger of call starts (and optional declared sizes) that
//! delays each new call until it fits both the call-count budget and, when
//! configured, the byte-volume budget. One governor is shared by every branch
//! of a job execution; admissions are serialized so all branches see the same
//! ledger.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::budget::RunBudget;
use crate::error::CallError;

/// Throttling limits for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBudget {
    pub max_calls_per_window: u32,
    #[serde(default)]
    pub max_bytes_per_window: Option<u64>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Fraction of the byte budget actually used.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_safety_margin() -> f64 {
    0.9
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            max_calls_per_window: 60,
            max_bytes_per_window: None,
            window_secs: default_window_secs(),
            safety_margin: default_safety_margin(),
        }
    }
}

impl RateBudget {
    pub fn calls_per_window(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls_per_window: max_calls,
            window_secs: window.as_secs(),
            ..Self::default()
        }
    }

    pub fn with_bytes(mut self, max_bytes: u64, safety_margin: f64) -> Self {
        self.max_bytes_per_window = Some(max_bytes);
        self.safety_margin = safety_margin;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Effective byte ceiling after the safety margin.
    pub fn byte_limit(&self) -> Option<u64> {
        self.max_bytes_per_window
            .map(|max| (max as f64 * self.safety_margin).floor() as u64)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_calls_per_window == 0 {
            return Err(CallError::Invalid("max_calls_per_window must be positive".into()));
        }
        if self.window_secs == 0 {
            return Err(CallError::Invalid("window_secs must be positive".into()));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(CallError::Invalid(format!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if self.max_bytes_per_window == Some(0) {
            return Err(CallError::Invalid("max_bytes_per_window must be positive".into()));
        }
        Ok(())
    }
}

/// Returned when admitting a call would mean waiting past the run deadline.
#[derive(Debug, Clone, Error)]
#[error("rate limit wait of {wait:?} would pass the run deadline")]
pub struct RateWaitExceedsDeadline {
    pub wait: Duration,
}

/// Handle to a recorded call, used to fill in its size once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTicket {
    seq: u64,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    started: Instant,
    size: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: VecDeque<Entry>,
    next_seq: u64,
}

impl Ledger {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.started) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, size: u64) -> CallTicket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Entry { seq, started: now, size });
        CallTicket { seq }
    }
}

#[derive(Debug)]
pub struct CallRateGovernor {
    budget: RateBudget,
    ledger: Mutex<Ledger>,
    admission: tokio::sync::Mutex<()>,
}

impl CallRateGovernor {
    pub fn new(budget: RateBudget) -> Result<Self, CallError> {
        budget.validate()?;
        Ok(Self {
            budget,
            ledger: Mutex::new(Ledger::default()),
            admission: tokio::sync::Mutex::new(()),
        })
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Calls currently inside the window.
    pub fn in_window(&self) -> usize {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.evict(Instant::now(), self.budget.window());
        ledger.entries.len()
    }

    /// Wait until a call of `size` bytes may start, then record it.
    pub async fn admit(&self, size: Option<u64>) -> CallTicket {
        let _turn = self.admission.lock().await;
        loop {
            match self.try_record(size) {
                Ok(ticket) => return ticket,
                Err(until) => tokio::time::sleep_until(until).await,
            }
        }
    }

    /// Like [`admit`](Self::admit), but refuses to wait past `deadline`.
    pub async fn admit_within(
        &self,
        size: Option<u64>,
        deadline: &RunBudget,
    ) -> Result<CallTicket, RateWaitExceedsDeadline> {
        let _turn = self.admission.lock().await;
        loop {
            match self.try_record(size) {
                Ok(ticket) => return Ok(ticket),
                Err(until) => {
                    let wait = until.saturating_duration_since(Instant::now());
                    if deadline.would_exceed(wait) {
                        return Err(RateWaitExceedsDeadline { wait });
                    }
                    tokio::time::sleep_until(until).await;
                }
            }
        }
    }

    /// Set the size of a call admitted without one (or with an estimate).
    pub fn record_size(&self, ticket: CallTicket, size: u64) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(entry) = ledger.entries.iter_mut().find(|e| e.seq == ticket.seq) {
            entry.size = size;
        }
    }

    /// Admit, then run `call`.
    pub async fn call<T, Fut>(&self, size: Option<u64>, call: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        self.admit(size).await;
        call.await
    }

    /// Record now, or return the instant at which to check again.
    fn try_record(&self, size: Option<u64>) -> Result<CallTicket, Instant> {
        let window = self.budget.window();
        let now = Instant::now();
        let mut ledger = self.ledger.lock().unwrap();
        ledger.evict(now, window);

        if ledger.entries.len() >= self.budget.max_calls_per_window as usize {
            // Non-empty: max_calls_per_window is validated positive.
            let oldest = ledger.entries.front().map(|e| e.started).unwrap_or(now);
            debug!(
                in_window = ledger.entries.len(),
                max_calls = self.budget.max_calls_per_window,
                "call budget full, waiting"
            );
            return Err(oldest + window);
        }

        if let Some(limit) = self.budget.byte_limit() {
            let total: u64 = ledger.entries.iter().map(|e| e.size).sum();
            if total > limit {
                let excess = total - limit;
                let mut freed = 0u64;
                let mut until = now;
                for entry in &ledger.entries {
                    freed += entry.size;
                    until = entry.started + window;
                    if freed >= excess {
                        break;
                    }
                }
                debug!(
                    bytes_in_window = total,
                    byte_limit = limit,
                    "byte budget full, waiting"
                );
                return Err(until);
            }
        }

        Ok(ledger.record(now, size.unwrap_or(0)))
    }
}

/// Coarse throttling: run `items` in groups of `max_per_window`, each group
/// concurrently, sleeping out the rest of the window between groups.
pub async fn run_in_fixed_batches<I, T, F, Fut>(
    items: Vec<I>,
    max_per_window: usize,
    window: Duration,
    mut f: F,
) -> Vec<T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = T>,
{
    let max_per_window = max_per_window.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let started = Instant::now();
        let batch: Vec<Fut> = items.by_ref().take(max_per_window).map(&mut f).collect();
        results.extend(futures::future::join_all(batch).await);

        if items.peek().is_some() {
            let spent = started.elapsed();
            if spent < window {
                tokio::time::sleep(window - spent).await;
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(budget: RateBudget) -> Arc<CallRateGovernor> {
        Arc::new(CallRateGovernor::new(budget).unwrap())
    }

    fn max_in_any_window(starts: &[Duration], window: Duration) -> usize {
        starts
            .iter()
            .map(|s| starts.iter().filter(|t| **t >= *s && **t < *s + window).count())
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn rejects_invalid_budgets() {
        let empty = RateBudget::calls_per_window(0, Duration::from_secs(60));
        assert!(CallRateGovernor::new(empty).is_err());
        assert!(CallRateGovernor::new(RateBudget::calls_per_window(1, Duration::ZERO)).is_err());
        let budget =
            RateBudget::calls_per_window(5, Duration::from_secs(60)).with_bytes(1_000, 1.5);
        assert!(CallRateGovernor::new(budget).is_err());
    }

    #[test]
    fn budget_fills_in_defaults() {
        let budget: RateBudget = serde_json::from_str(r#"{"max_calls_per_window": 10}"#).unwrap();
        assert_eq!(budget.window(), Duration::from_secs(60));
        assert_eq!(budget.safety_margin, 0.9);
        assert_eq!(budget.byte_limit(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn count_budget_holds_in_every_window() {
        let window = Duration::from_secs(10);
        let gov = governor(RateBudget::calls_per_window(2, window));
        let origin = Instant::now();

        let mut starts = Vec::new();
        for _ in 0..5 {
            gov.admit(None).await;
            starts.push(origin.elapsed());
        }

        assert_eq!(
            starts,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ]
        );
        assert!(max_in_any_window(&starts, window) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_branches_share_one_ledger() {
        let window = Duration::from_secs(60);
        let gov = governor(RateBudget::calls_per_window(3, window));
        let origin = Instant::now();

        let handles: Vec<_> = (0..9)
            .map(|_| {
                let gov = gov.clone();
                tokio::spawn(async move {
                    gov.admit(None).await;
                    origin.elapsed()
                })
            })
            .collect();

        let mut starts = Vec::new();
        for h in handles {
            starts.push(h.await.unwrap());
        }
        starts.sort();
        assert!(max_in_any_window(&starts, window) <= 3);
        assert_eq!(*starts.last().unwrap(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn byte_budget_waits_for_enough_volume_to_expire() {
        let window = Duration::from_secs(60);
        let budget = RateBudget::calls_per_window(100, window).with_bytes(100, 0.9);
        let gov = governor(budget);
        let origin = Instant::now();

        gov.admit(Some(50)).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        gov.admit(Some(50)).await;
        assert_eq!(origin.elapsed(), Duration::from_secs(5));

        // 100 bytes in window > 90: the first 50-byte entry must expire.
        gov.admit(Some(10)).await;
        assert_eq!(origin.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_size_counts_toward_budget() {
        let window = Duration::from_secs(30);
        let budget = RateBudget::calls_per_window(100, window).with_bytes(1_000, 1.0);
        let gov = governor(budget);
        let origin = Instant::now();

        let ticket = gov.admit(None).await;
        gov.record_size(ticket, 2_000);
        gov.admit(None).await;
        assert_eq!(origin.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn admit_within_refuses_to_wait_past_deadline() {
        let gov = governor(RateBudget::calls_per_window(1, Duration::from_secs(60)));
        let deadline = RunBudget::start(Duration::from_secs(30));

        assert!(gov.admit_within(None, &deadline).await.is_ok());
        let err = gov.admit_within(None, &deadline).await.unwrap_err();
        assert_eq!(err.wait, Duration::from_secs(60));
        assert_eq!(gov.in_window(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_batches_sleep_out_the_window() {
        let origin = Instant::now();
        let stamps =
            run_in_fixed_batches((0..5).collect(), 2, Duration::from_secs(10), |i| async move {
                (i, origin.elapsed())
            })
            .await;

        let times: Vec<u64> = stamps.iter().map(|(_, t)| t.as_secs()).collect();
        assert_eq!(times, vec![0, 0, 10, 10, 20]);
        assert_eq!(stamps.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }
}
