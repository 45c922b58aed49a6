//! Bounded, fail-fast transfer pool.
//!
//! Every job is queued up front and the queue is closed, then a fixed number
//! of workers drain it. Each job a worker takes yields exactly one outcome on
//! the result channel, and only the coordinator looks at outcomes. The first
//! failure raises the shared [`CancelFlag`]: queued jobs are then reported as
//! cancelled without being started, and transfers already running stop at
//! their next chunk boundary. Nothing is retried.
//!
//! A worker raises the flag itself as soon as its own transfer fails, so no
//! further job starts while the coordinator catches up.

use std::future::Future;
use std::sync::Arc;

use dray_store::{CancelFlag, StoreError, StoreResult};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{SyncError, SyncResult};
use crate::keyset::KeyEntry;
use crate::types::TransferReport;

enum Outcome {
    Done { bytes: u64 },
    Cancelled,
    Failed { key: String, error: StoreError },
}

pub struct TransferExecutor {
    parallelism: usize,
}

impl TransferExecutor {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Run `transfer` once for every job.
    ///
    /// `transfer` returns the number of bytes moved. On success the report
    /// counts every job; otherwise the error names the first failing key.
    pub async fn run<F, Fut>(&self, jobs: Vec<KeyEntry>, transfer: F) -> SyncResult<TransferReport>
    where
        F: Fn(KeyEntry, CancelFlag) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<u64>> + Send + 'static,
    {
        let total = jobs.len();
        if total == 0 {
            return Ok(TransferReport::default());
        }

        let (job_tx, job_rx) = mpsc::channel(total);
        for job in jobs {
            job_tx
                .send(job)
                .await
                .map_err(|_| SyncError::Worker("job queue closed early".into()))?;
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Outcome>(total);
        let transfer = Arc::new(transfer);
        let cancel = CancelFlag::new();

        let mut workers = JoinSet::new();
        for worker in 0..self.parallelism.min(total) {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let transfer = Arc::clone(&transfer);
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(job) = next else { break };
                    let key = job.key.clone();

                    let outcome = if cancel.is_cancelled() {
                        Outcome::Cancelled
                    } else {
                        match transfer(job, cancel.clone()).await {
                            Ok(bytes) => Outcome::Done { bytes },
                            Err(StoreError::Cancelled) => Outcome::Cancelled,
                            Err(error) => {
                                cancel.cancel();
                                Outcome::Failed { key, error }
                            }
                        }
                    };
                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                debug!(worker, "transfer worker finished");
            });
        }
        drop(result_tx);

        let mut report = TransferReport::default();
        let mut failure: Option<(String, StoreError)> = None;
        let mut received = 0;
        while received < total {
            let Some(outcome) = result_rx.recv().await else {
                break;
            };
            received += 1;
            match outcome {
                Outcome::Done { bytes } => {
                    report.completed += 1;
                    report.bytes += bytes;
                }
                Outcome::Cancelled => report.cancelled += 1,
                Outcome::Failed { key, error } => {
                    if failure.is_none() {
                        error!(key = %key, error = %error, "transfer failed, cancelling remaining work");
                        cancel.cancel();
                        failure = Some((key, error));
                    } else {
                        warn!(key = %key, error = %error, "additional transfer failure");
                    }
                }
            }
        }

        let mut panicked = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("transfer worker panicked: {e}");
                panicked.get_or_insert_with(|| e.to_string());
            }
        }

        if let Some((key, source)) = failure {
            return Err(SyncError::TransferFailed { key, source });
        }
        if let Some(reason) = panicked {
            return Err(SyncError::Worker(reason));
        }
        if received < total {
            return Err(SyncError::Worker(format!(
                "{} of {total} transfers never reported",
                total - received
            )));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn jobs(n: usize) -> Vec<KeyEntry> {
        (0..n)
            .map(|i| KeyEntry::remote(format!("k{i:03}"), format!("k{i:03}"), i as u64))
            .collect()
    }

    #[tokio::test]
    async fn runs_every_job_once() {
        let seen = Arc::new(StdMutex::new(HashMap::<String, usize>::new()));
        let seen2 = Arc::clone(&seen);
        let exec = TransferExecutor::new(4);

        let report = exec
            .run(jobs(50), move |job, _| {
                let seen = Arc::clone(&seen2);
                async move {
                    *seen.lock().unwrap().entry(job.key).or_default() += 1;
                    Ok(job.size)
                }
            })
            .await
            .unwrap();

        assert_eq!(report.completed, 50);
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.bytes, (0..50).sum::<u64>());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn empty_job_list_is_a_no_op() {
        let report = TransferExecutor::new(25)
            .run(Vec::new(), |_, _| async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(report, TransferReport::default());
    }

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        TransferExecutor::new(3)
            .run(jobs(20), move |_, _| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn first_failure_is_reported_once_and_stops_new_work() {
        let started = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&started);

        let err = TransferExecutor::new(1)
            .run(jobs(10), move |job, _| {
                let started = Arc::clone(&s);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if job.key == "k003" {
                        Err(StoreError::NotFound(job.key))
                    } else {
                        Ok(1)
                    }
                }
            })
            .await
            .unwrap_err();

        match err {
            SyncError::TransferFailed { key, source } => {
                assert_eq!(key, "k003");
                assert!(matches!(source, StoreError::NotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        // One worker takes jobs in order, so nothing after the failure starts.
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn in_flight_transfers_see_cancellation() {
        let observed = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&observed);

        let err = TransferExecutor::new(2)
            .run(jobs(2), move |job, cancel| {
                let observed = Arc::clone(&o);
                async move {
                    if job.key == "k000" {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        return Err(StoreError::Request {
                            op: "put",
                            path: job.key,
                            reason: "boom".into(),
                        });
                    }
                    for _ in 0..200 {
                        if cancel.is_cancelled() {
                            observed.fetch_add(1, Ordering::SeqCst);
                            return Err(StoreError::Cancelled);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(1)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::TransferFailed { ref key, .. } if key == "k000"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_failures_yield_one_error() {
        let err = TransferExecutor::new(8)
            .run(jobs(16), |job, _| async move {
                Err::<u64, _>(StoreError::NotFound(job.key))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransferFailed { .. }));
    }
}
