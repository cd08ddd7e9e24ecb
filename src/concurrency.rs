//! Bounded fan-out / fan-in
//!
//! Every "run many independent things" point in the pipeline goes through
//! [`run_bounded`]: one spawned task per unit, a semaphore capping how many run
//! at once, and a join barrier that hands results back in input order.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What became of one unit of work
#[derive(Debug)]
pub enum UnitOutcome<R> {
    Completed(R),
    /// Cancelled before it started or while suspended
    Cancelled,
    /// The unit panicked; carries the panic description
    Panicked(String),
}

impl<R> UnitOutcome<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            UnitOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Run `work` over every item with at most `limit` units in flight.
///
/// The returned vector has one outcome per item, at the item's index, no
/// matter in which order the units finished. Once `cancel` fires, units that
/// have not acquired a slot never start and in-flight units are dropped at
/// their next suspension point.
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    work: F,
) -> Vec<UnitOutcome<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let work = Arc::new(work);

    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let semaphore = semaphore.clone();
            let work = work.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return None;
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = (*work)(item) => Some(result),
                }
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, joined)| match joined {
            Ok(Some(result)) => UnitOutcome::Completed(result),
            Ok(None) => UnitOutcome::Cancelled,
            Err(e) => {
                warn!(unit = index, error = %e, "Unit of work panicked");
                UnitOutcome::Panicked(e.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let cancel = CancellationToken::new();
        let outcomes = run_bounded(vec![30u64, 10, 20, 0], 4, &cancel, |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay
        })
        .await;

        let values: Vec<u64> = outcomes.into_iter().filter_map(UnitOutcome::completed).collect();
        assert_eq!(values, vec![30, 10, 20, 0]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (in_flight_c, peak_c) = (in_flight.clone(), peak.clone());
        run_bounded((0..12).collect::<Vec<_>>(), 3, &cancel, move |_| {
            let in_flight = in_flight_c.clone();
            let peak = peak_c.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let cancel = CancellationToken::new();
        let outcomes = run_bounded(vec![1, 2, 3], 2, &cancel, |n| async move {
            if n == 2 {
                panic!("unit two blew up");
            }
            n * 10
        })
        .await;

        assert!(matches!(outcomes[0], UnitOutcome::Completed(10)));
        assert!(matches!(outcomes[1], UnitOutcome::Panicked(_)));
        assert!(matches!(outcomes[2], UnitOutcome::Completed(30)));
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let started_c = started.clone();

        let outcomes = run_bounded(vec![1, 2], 1, &cancel, move |n| {
            let started = started_c.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                n
            }
        })
        .await;

        assert!(outcomes.iter().all(|o| matches!(o, UnitOutcome::Cancelled)));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_results() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let outcomes = run_bounded(vec![0u64, 500], 2, &cancel, move |delay| {
            let trigger = trigger.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if delay == 0 {
                    trigger.cancel();
                }
                delay
            }
        })
        .await;

        assert!(matches!(outcomes[0], UnitOutcome::Completed(0)));
        assert!(matches!(outcomes[1], UnitOutcome::Cancelled));
    }
}
