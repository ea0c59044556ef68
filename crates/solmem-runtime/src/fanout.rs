//! Bounded per-photo fan-out with failure isolation.
//!
//! Each item runs as its own future, at most `max_concurrency` at a time.
//! A failing item becomes an [`ItemFailure`] in the returned
//! [`BatchOutcome`]; it never cancels or aborts its siblings. Results keep
//! the input order.

use std::fmt::Display;
use std::future::Future;

use futures_util::stream::{self, StreamExt};
use solmem_types::{BatchOutcome, ItemFailure};
use tracing::warn;

/// Run `work` over `items` and partition the results.
///
/// `photo_id` names each item in the failure list.
pub async fn fan_out<I, T, E, K, F, Fut>(
    items: Vec<I>,
    max_concurrency: usize,
    photo_id: K,
    work: F,
) -> BatchOutcome<T>
where
    K: Fn(&I) -> u64,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let results: Vec<(u64, Result<T, E>)> = stream::iter(items.into_iter().map(|item| {
        let id = photo_id(&item);
        let fut = work(item);
        async move { (id, fut.await) }
    }))
    .buffered(max_concurrency.max(1))
    .collect()
    .await;

    let mut outcome = BatchOutcome::default();
    for (id, result) in results {
        match result {
            Ok(value) => outcome.succeeded.push(value),
            Err(e) => {
                warn!(photo_id = id, error = %e, "item failed; excluded from stage output");
                outcome.failed.push(ItemFailure {
                    photo_id: id,
                    error: e.to_string(),
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let outcome = fan_out(vec![1u64, 2, 3, 4, 5], 2, |id| *id, |id| async move {
            if id == 3 {
                Err(format!("photo {id} unreadable"))
            } else {
                Ok(id * 10)
            }
        })
        .await;

        assert_eq!(outcome.succeeded, vec![10, 20, 40, 50]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].photo_id, 3);
        assert_eq!(outcome.failed[0].error, "photo 3 unreadable");
    }

    #[tokio::test]
    async fn empty_input_is_empty_outcome() {
        let outcome: BatchOutcome<u64> =
            fan_out(Vec::<u64>::new(), 4, |id| *id, |id| async move { Ok::<_, String>(id) }).await;
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = fan_out((0..12u64).collect(), 3, |id| *id, |id| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(id)
            }
        })
        .await;

        assert_eq!(outcome.succeeded.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let outcome =
            fan_out(vec![1u64, 2], 0, |id| *id, |id| async move { Ok::<_, String>(id) }).await;
        assert_eq!(outcome.succeeded, vec![1, 2]);
    }
}
