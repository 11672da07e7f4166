//! Bounded-concurrency dispatch of parts.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::TransferError;
use crate::retry::{RetryError, RetryPolicy};
use crate::types::{PartOutcome, TransferSession};
use crate::worker::ChunkWorker;

type Settled = (usize, Result<(PartOutcome, u32), RetryError>);

/// Drives every Pending part of `session` through `worker`, at most
/// `max_concurrency` at a time.
///
/// The first part that fails terminally stops further dispatch; parts
/// already in flight are allowed to settle before the error is returned.
/// When `cancel` fires, in-flight parts return to Pending and the run
/// ends with [`TransferError::Aborted`]. `on_settled` is called with the
/// part index after each Done or Failed bookkeeping update and its future
/// is awaited before the next settled part is handled.
pub async fn run<F, Fut>(
    session: &TransferSession,
    worker: Arc<dyn ChunkWorker>,
    policy: &RetryPolicy,
    max_concurrency: usize,
    cancel: &CancellationToken,
    mut on_settled: F,
) -> Result<(), TransferError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = ()>,
{
    let session_id = session.id();
    let max_concurrency = max_concurrency.max(1);
    let mut in_flight: JoinSet<Settled> = JoinSet::new();
    let mut failure: Option<TransferError> = None;

    loop {
        while failure.is_none() && !cancel.is_cancelled() && in_flight.len() < max_concurrency {
            let Some(part) = session.claim_next_pending() else {
                break;
            };
            debug!(
                session = %session_id,
                part = part.index,
                start = part.range.start,
                end = part.range.end,
                "dispatching part"
            );

            let worker = Arc::clone(&worker);
            let policy = policy.clone();
            let cancel = cancel.clone();
            in_flight.spawn(async move {
                let result = policy
                    .execute(part.index, &cancel, || worker.transfer(&part, &cancel))
                    .await;
                (part.index, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        match joined {
            Ok((index, Ok((outcome, attempts)))) => {
                debug!(
                    session = %session_id,
                    part = index,
                    attempts,
                    bytes = outcome.bytes,
                    "part done"
                );
                session.mark_done(index, outcome, attempts);
                on_settled(index).await;
            }
            Ok((index, Err(RetryError::Aborted))) => {
                debug!(session = %session_id, part = index, "part aborted");
                session.release_part(index);
            }
            Ok((index, Err(err))) => {
                error!(
                    session = %session_id,
                    part = index,
                    attempts = err.attempts(),
                    error = %err.error(),
                    "part failed"
                );
                session.mark_failed(index, err.error(), err.attempts());
                on_settled(index).await;
                if failure.is_none() {
                    failure = Some(err.into());
                }
            }
            Err(join_err) => {
                error!(session = %session_id, error = %join_err, "part task panicked");
                if failure.is_none() {
                    failure = Some(TransferError::Worker(join_err.to_string()));
                }
            }
        }
    }

    session.revert_in_flight();
    if let Some(err) = failure {
        return Err(err);
    }
    if !session.is_complete() {
        return Err(TransferError::Aborted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::TransferConfig;
    use crate::error::ClassifiedError;
    use crate::plan::plan;
    use crate::types::{Direction, Part, PartStatus};
    use crate::worker::PartFuture;

    /// Scripted worker: tracks concurrency and fails selected parts.
    #[derive(Default)]
    struct StubWorker {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<HashMap<usize, u32>>,
        /// Part index -> error returned on every attempt.
        failures: HashMap<usize, ClassifiedError>,
        delay: Duration,
    }

    impl StubWorker {
        fn calls_for(&self, index: usize) -> u32 {
            self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl ChunkWorker for StubWorker {
        fn transfer<'a>(&'a self, part: &'a Part, cancel: &'a CancellationToken) -> PartFuture<'a> {
            Box::pin(async move {
                *self.calls.lock().unwrap().entry(part.index).or_default() += 1;
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);

                // Scripted failures are immediate; successes take `delay`.
                let result = match self.failures.get(&part.index) {
                    Some(err) => Err(err.clone()),
                    None => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(ClassifiedError::Aborted),
                        _ = tokio::time::sleep(self.delay) => Ok(PartOutcome {
                            bytes: part.range.len(),
                            ..Default::default()
                        }),
                    },
                };
                self.active.fetch_sub(1, Ordering::SeqCst);
                result
            })
        }
    }

    fn session(total: u64, part_size: u64) -> TransferSession {
        TransferSession::new(
            "sched".into(),
            Direction::Download,
            "obj".into(),
            total,
            TransferConfig {
                part_size,
                ..Default::default()
            },
            plan(total, part_size, 0).unwrap(),
        )
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1)).with_max_jitter(Duration::ZERO)
    }

    #[tokio::test]
    async fn runs_every_part_once() {
        let session = session(2_500_000, 1_000_000);
        let worker = Arc::new(StubWorker::default());
        let mut settled = Vec::new();

        run(
            &session,
            worker.clone(),
            &fast_policy(3),
            2,
            &CancellationToken::new(),
            |i| {
                settled.push(i);
                std::future::ready(())
            },
        )
        .await
        .unwrap();

        assert!(session.is_complete());
        assert_eq!(worker.total_calls(), 3);
        assert_eq!(session.transferred_bytes(), 2_500_000);
        settled.sort();
        assert_eq!(settled, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrency() {
        for limit in [1usize, 3, 8] {
            let session = session(100, 5);
            let worker = Arc::new(StubWorker {
                delay: Duration::from_millis(10),
                ..Default::default()
            });
            run(
                &session,
                worker.clone(),
                &fast_policy(1),
                limit,
                &CancellationToken::new(),
                |_| std::future::ready(()),
            )
            .await
            .unwrap();
            assert_eq!(worker.peak.load(Ordering::SeqCst), limit, "limit {limit}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_part_fails_after_n_attempts() {
        let session = session(30, 10);
        let worker = Arc::new(StubWorker {
            failures: HashMap::from([(1, ClassifiedError::Retryable("503".into()))]),
            ..Default::default()
        });

        let err = run(
            &session,
            worker.clone(),
            &fast_policy(4),
            1,
            &CancellationToken::new(),
            |_| std::future::ready(()),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            TransferError::RetryExhausted {
                part_index: 1,
                attempts: 4,
                ..
            }
        ));
        assert_eq!(worker.calls_for(1), 4);
        let parts = session.parts();
        assert_eq!(parts[1].status, PartStatus::Failed);
        assert_eq!(parts[1].retry_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_dispatch_but_lets_in_flight_settle() {
        let session = session(100, 10);
        let worker = Arc::new(StubWorker {
            failures: HashMap::from([(0, ClassifiedError::Fatal("denied".into()))]),
            delay: Duration::from_millis(10),
            ..Default::default()
        });

        let err = run(
            &session,
            worker.clone(),
            &fast_policy(3),
            3,
            &CancellationToken::new(),
            |_| std::future::ready(()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::PartFailed { part_index: 0, .. }));
        // Parts 1 and 2 were already running and finished; nothing else started.
        assert_eq!(worker.total_calls(), 3);
        assert_eq!(session.count_with_status(PartStatus::Done), 2);
        assert_eq!(session.count_with_status(PartStatus::Failed), 1);
        assert_eq!(session.count_with_status(PartStatus::Pending), 7);
        assert_eq!(session.count_with_status(PartStatus::InFlight), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_returns_in_flight_parts_to_pending() {
        let session = session(100, 10);
        let worker = Arc::new(StubWorker {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            c.cancel();
        });

        let err = run(&session, worker.clone(), &fast_policy(3), 4, &cancel, |_| {
            std::future::ready(())
        })
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Aborted));
        assert_eq!(worker.total_calls(), 4);
        assert_eq!(session.count_with_status(PartStatus::Pending), 10);
    }

    #[tokio::test]
    async fn skips_parts_already_done() {
        let session = session(30, 10);
        let p0 = session.claim_next_pending().unwrap();
        session.mark_done(
            p0.index,
            PartOutcome {
                bytes: 10,
                ..Default::default()
            },
            1,
        );
        let worker = Arc::new(StubWorker::default());

        run(
            &session,
            worker.clone(),
            &fast_policy(3),
            4,
            &CancellationToken::new(),
            |_| std::future::ready(()),
        )
        .await
        .unwrap();
        assert_eq!(worker.calls_for(0), 0);
        assert_eq!(worker.total_calls(), 2);
    }
}
