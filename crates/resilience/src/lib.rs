//! Resilience primitives shared by every ingestion job: backoff policies,
//! deadline-bounded retry, the outbound call-rate governor and bounded
//! fail-fast fan-out.

pub mod backoff;
pub mod budget;
pub mod error;
pub mod governor;
pub mod parallel;
pub mod retry;

pub use backoff::{
    BackoffPolicy, BackoffSettings, BackoffState, ExponentialBackoff, FixedBackoff,
    MultiplicativeBackoff,
};
pub use budget::RunBudget;
pub use error::{CallError, Retryable, StatusCodePolicy};
pub use governor::{
    run_in_fixed_batches, CallRateGovernor, CallTicket, RateBudget, RateWaitExceedsDeadline,
};
pub use parallel::{run_bounded, ParallelFailure};
pub use retry::{DeadlineBoundedRetry, RetryStop, StopReason};
