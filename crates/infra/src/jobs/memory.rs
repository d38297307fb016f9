//! In-process fallback backend.
//!
//! Jobs live in per-queue `VecDeque`s for the lifetime of the process and are
//! lost on crash. A single cooperative ticker drains every queue in FIFO order,
//! one job at a time, every [`TICK`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::executor::{self, ConsumerOptions, Disposition, JobHandler};
use super::{BackendKind, Job, QueueBackend, QueueDepth, QueueError};

pub(crate) const TICK: Duration = Duration::from_millis(100);

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Job>>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    failed: HashMap<String, u64>,
}

pub(crate) struct MemoryBackend {
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
    started: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the ticker on first use so construction needs no runtime.
    fn ensure_ticker(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => drain(&state, &cancel).await,
                }
            }
            debug!("in-memory queue ticker stopped");
        });

        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// One pass over every queue that has a consumer.
///
/// Only the jobs present when the pass reaches a queue are considered; jobs
/// enqueued (or re-queued for retry) meanwhile wait for the next tick.
async fn drain(state: &Arc<Mutex<State>>, cancel: &CancellationToken) {
    let consumers: Vec<(String, Arc<dyn JobHandler>, usize)> = {
        let st = state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = st.handlers.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| {
                let pending = st.queues.get(&name).map(VecDeque::len).unwrap_or(0);
                let handler = st.handlers.get(&name)?.clone();
                (pending > 0).then_some((name, handler, pending))
            })
            .collect()
    };

    for (queue, handler, pending) in consumers {
        for _ in 0..pending {
            if cancel.is_cancelled() {
                return;
            }

            let next = {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                st.queues.get_mut(&queue).and_then(VecDeque::pop_front)
            };
            let Some(job) = next else { break };

            if !job.is_ready(Utc::now()) {
                push_back(state, job);
                continue;
            }

            match executor::execute(job, handler.as_ref()).await {
                Disposition::Completed => {}
                Disposition::Retry(job, _delay) => push_back(state, job),
                Disposition::Dropped(job) => {
                    let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                    *st.failed.entry(job.queue).or_default() += 1;
                }
            }
        }
    }
}

fn push_back(state: &Arc<Mutex<State>>, job: Job) {
    let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
    st.queues.entry(job.queue.clone()).or_default().push_back(job);
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn push(&self, job: Job) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        self.ensure_ticker();
        push_back(&self.state, job);
        Ok(())
    }

    async fn start_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        _options: ConsumerOptions,
    ) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        {
            let mut st = self.state();
            if st.handlers.contains_key(queue) {
                return Err(QueueError::ConsumerAlreadyRegistered(queue.to_string()));
            }
            st.handlers.insert(queue.to_string(), handler);
            st.queues.entry(queue.to_string()).or_default();
        }
        self.ensure_ticker();
        info!(queue, backend = "memory", "consumer registered");
        Ok(())
    }

    async fn depths(&self) -> Result<BTreeMap<String, QueueDepth>, QueueError> {
        let now = Utc::now();
        let st = self.state();
        let mut out = BTreeMap::new();
        for (name, jobs) in &st.queues {
            let delayed = jobs.iter().filter(|j| !j.is_ready(now)).count() as u64;
            out.insert(
                name.clone(),
                QueueDepth {
                    waiting: jobs.len() as u64 - delayed,
                    delayed,
                    failed: st.failed.get(name).copied().unwrap_or(0),
                },
            );
        }
        Ok(out)
    }

    async fn is_connected(&self) -> bool {
        false
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobResult, RetryPolicy, handler_fn};
    use std::sync::atomic::AtomicU32;

    fn job(queue: &str, n: i64, policy: RetryPolicy) -> Job {
        Job::new(queue, serde_json::json!({ "n": n }), policy)
    }

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        backend
            .start_consumer(
                "email",
                handler_fn(move |job: Job| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(job.payload["n"].as_i64().unwrap());
                        JobResult::Success
                    }
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        for n in 0..5 {
            backend.push(job("email", n, RetryPolicy::default())).await.unwrap();
        }

        tokio::time::sleep(TICK * 4).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn jobs_wait_for_a_consumer() {
        let backend = MemoryBackend::new();
        backend.push(job("order-processing", 1, RetryPolicy::default())).await.unwrap();
        tokio::time::sleep(TICK * 2).await;

        let depths = backend.depths().await.unwrap();
        assert_eq!(depths["order-processing"].waiting, 1);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn failing_job_is_retried_then_counted_as_failed() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        backend
            .start_consumer(
                "webhook-delivery",
                handler_fn(move |_job| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        JobResult::Failure("boom".into())
                    }
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        backend
            .push(job("webhook-delivery", 1, RetryPolicy::fixed(3, Duration::from_millis(10))))
            .await
            .unwrap();

        tokio::time::sleep(TICK * 8).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let depths = backend.depths().await.unwrap();
        assert_eq!(depths["webhook-delivery"], QueueDepth { waiting: 0, delayed: 0, failed: 1 });
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn second_consumer_for_a_queue_is_rejected() {
        let backend = MemoryBackend::new();
        let noop = || handler_fn(|_job| async { JobResult::Success });

        backend.start_consumer("email", noop(), ConsumerOptions::default()).await.unwrap();
        let err = backend
            .start_consumer("email", noop(), ConsumerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ConsumerAlreadyRegistered(q) if q == "email"));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn push_after_shutdown_fails() {
        let backend = MemoryBackend::new();
        backend.shutdown().await;
        let err = backend.push(job("email", 1, RetryPolicy::default())).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
