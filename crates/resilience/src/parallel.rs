//! Bounded, fail-fast fan-out.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::warn;

/// First error of a fan-out plus how many branches failed in total.
#[derive(Debug, Error)]
#[error("{failure_count} parallel branch(es) failed; first error: {first}")]
pub struct ParallelFailure<E: std::fmt::Display + std::fmt::Debug> {
    pub first: E,
    pub failure_count: usize,
}

/// Run `f` over `items` with at most `max_dop` futures in flight.
///
/// Results come back in input order. After the first failure no new branch
/// is started; branches already running are awaited and their failures
/// counted. Futures run on the caller's task, so `f` may borrow locals.
pub async fn run_bounded<I, T, E, F, Fut>(
    items: Vec<I>,
    max_dop: usize,
    mut f: F,
) -> Result<Vec<T>, ParallelFailure<E>>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + std::fmt::Debug,
{
    let max_dop = max_dop.max(1);
    let total = items.len();
    let mut pending = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut first: Option<E> = None;
    let mut failure_count = 0usize;

    loop {
        while first.is_none() && in_flight.len() < max_dop {
            match pending.next() {
                Some((idx, item)) => {
                    let fut = f(item);
                    in_flight.push(async move { (idx, fut.await) });
                }
                None => break,
            }
        }

        match in_flight.next().await {
            Some((idx, Ok(value))) => results[idx] = Some(value),
            Some((idx, Err(err))) => {
                failure_count += 1;
                warn!(branch = idx, error = %err, "parallel branch failed");
                if first.is_none() {
                    first = Some(err);
                }
            }
            None => break,
        }
    }

    if let Some(first) = first {
        return Err(ParallelFailure { first, failure_count });
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn preserves_order_and_bounds_concurrency() {
        let live = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let out = run_bounded((0..10u64).collect(), 3, |i| {
            let live = &live;
            let peak = &peak;
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (10 - i))).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i * 2)
            }
        })
        .await
        .unwrap();

        assert_eq!(out, (0..10u64).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_starting_branches_after_failure() {
        let started = AtomicUsize::new(0);

        let err = run_bounded((0..10u32).collect(), 2, |i| {
            let started = &started;
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    return Err(format!("branch {i} failed"));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                if i == 1 {
                    Err("branch 1 failed".to_string())
                } else {
                    Ok(i)
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.first, "branch 0 failed");
        // Branch 1 was already in flight, drained, and counted.
        assert_eq!(err.failure_count, 2);
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_input_is_ok() {
        let out = run_bounded(Vec::<u8>::new(), 4, |i| async move { Ok::<_, String>(i) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
