//! Redis-backed durable queue (reliable-queue pattern).
//!
//! ## Key layout
//!
//! - `{prefix}queues`: set of every queue name seen (health listing)
//! - `{prefix}{queue}:waiting`: list; producers `LPUSH`, consumers `RPOPLPUSH`
//!   into their own active list, so the right end is the oldest job
//! - `{prefix}{queue}:active:{consumer}`: jobs in flight in one process
//! - `{prefix}{queue}:consumers`: set of consumer ids owning an active list
//! - `{prefix}consumer:{consumer}`: heartbeat with a TTL; while it exists the
//!   consumer's active list is left alone
//! - `{prefix}{queue}:delayed`: sorted set of failed jobs scored by the unix
//!   millisecond at which they may run again
//! - `{prefix}{queue}:failed`: jobs dropped after max attempts, newest first,
//!   capped at [`FAILED_CAP`] entries
//!
//! Several processes may consume the same queue. When a consumer starts it
//! moves the active lists of peers whose heartbeat expired back to
//! `:waiting`, so a crash mid-job re-runs the job.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::executor::{self, ConsumerOptions, Disposition, JobHandler, RateLimiter};
use super::{BackendKind, Job, QueueBackend, QueueDepth, QueueError};

const FAILED_CAP: isize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const PROMOTE_BATCH: isize = 100;
const HEARTBEAT_TTL: Duration = Duration::from_secs(30);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);

fn broker_err(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        QueueError::BrokerUnavailable(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn registry(&self) -> String {
        format!("{}queues", self.prefix)
    }
    fn waiting(&self, queue: &str) -> String {
        format!("{}{queue}:waiting", self.prefix)
    }
    fn active(&self, queue: &str, consumer: &str) -> String {
        format!("{}{queue}:active:{consumer}", self.prefix)
    }
    fn consumers(&self, queue: &str) -> String {
        format!("{}{queue}:consumers", self.prefix)
    }
    fn heartbeat(&self, consumer: &str) -> String {
        format!("{}consumer:{consumer}", self.prefix)
    }
    fn delayed(&self, queue: &str) -> String {
        format!("{}{queue}:delayed", self.prefix)
    }
    fn failed(&self, queue: &str) -> String {
        format!("{}{queue}:failed", self.prefix)
    }
}

/// Score of a retry in `:delayed`.
fn ready_at_millis(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Where a finished job goes once it leaves the active list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settle {
    Ack,
    Retry { ready_at_ms: i64, job: String },
    DeadLetter { job: String },
}

/// One atomic pipeline removing `raw` from `active` and filing the outcome.
fn settle_pipeline(keys: &Keys, queue: &str, active: &str, raw: &str, settle: Settle) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic().cmd("LREM").arg(active).arg(1).arg(raw).ignore();
    match settle {
        Settle::Ack => {}
        Settle::Retry { ready_at_ms, job } => {
            pipe.cmd("ZADD").arg(keys.delayed(queue)).arg(ready_at_ms).arg(job).ignore();
        }
        Settle::DeadLetter { job } => {
            let failed = keys.failed(queue);
            pipe.cmd("LPUSH")
                .arg(&failed)
                .arg(job)
                .ignore()
                .cmd("LTRIM")
                .arg(&failed)
                .arg(0)
                .arg(FAILED_CAP - 1)
                .ignore();
        }
    }
    pipe
}

pub(crate) struct RedisBackend {
    conn: ConnectionManager,
    keys: Keys,
    consumer_id: String,
    poll_interval: Duration,
    cancel: CancellationToken,
    consumers: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBackend {
    /// Open a managed connection, verify it with `PING` and start the
    /// heartbeat for this process's consumer id.
    pub(crate) async fn connect(
        url: &str,
        prefix: &str,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(|e| QueueError::Connection(e.to_string()))?;

        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Connection(format!("timed out connecting to {url}")))?
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let backend = Self {
            conn,
            keys: Keys {
                prefix: prefix.to_string(),
            },
            consumer_id: Uuid::now_v7().to_string(),
            poll_interval,
            cancel: CancellationToken::new(),
            consumers: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        };

        let mut conn = backend.conn.clone();
        beat(&mut conn, &backend.keys, &backend.consumer_id)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        backend.spawn(heartbeat_loop(
            backend.conn.clone(),
            backend.keys.clone(),
            backend.consumer_id.clone(),
            backend.cancel.clone(),
        ));

        debug!(consumer_id = %backend.consumer_id, "redis consumer id assigned");
        Ok(backend)
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    /// Move the active lists of peers without a live heartbeat back to
    /// `:waiting`, then claim a slot in the consumer set.
    async fn recover_orphans(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let peers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.consumers(queue))
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;

        let mut moved = 0u64;
        for peer in peers.iter().filter(|p| **p != self.consumer_id) {
            let alive: u64 = redis::cmd("EXISTS")
                .arg(self.keys.heartbeat(peer))
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;
            if alive > 0 {
                continue;
            }

            moved += drain_list(&mut conn, &self.keys.active(queue, peer), &self.keys.waiting(queue)).await?;
            let _: () = redis::cmd("SREM")
                .arg(self.keys.consumers(queue))
                .arg(peer)
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;
        }

        let _: () = redis::cmd("SADD")
            .arg(self.keys.consumers(queue))
            .arg(&self.consumer_id)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(moved)
    }
}

/// Move every element of `from` onto the consuming end of `to`.
async fn drain_list(conn: &mut ConnectionManager, from: &str, to: &str) -> Result<u64, QueueError> {
    let mut moved = 0u64;
    loop {
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(from)
            .arg(to)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut *conn)
            .await
            .map_err(broker_err)?;
        if raw.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

async fn beat(conn: &mut ConnectionManager, keys: &Keys, consumer_id: &str) -> Result<(), redis::RedisError> {
    redis::cmd("SET")
        .arg(keys.heartbeat(consumer_id))
        .arg(1)
        .arg("PX")
        .arg(HEARTBEAT_TTL.as_millis() as u64)
        .query_async(&mut *conn)
        .await
}

async fn heartbeat_loop(mut conn: ConnectionManager, keys: Keys, consumer_id: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(HEARTBEAT_EVERY) => {}
        }
        if let Err(e) = beat(&mut conn, &keys, &consumer_id).await {
            warn!(consumer_id = %consumer_id, error = %e, "failed to refresh consumer heartbeat");
        }
    }

    // Let peers recover anything still in flight right away.
    let released: Result<(), _> = redis::cmd("DEL")
        .arg(keys.heartbeat(&consumer_id))
        .query_async(&mut conn)
        .await;
    if let Err(e) = released {
        debug!(consumer_id = %consumer_id, error = %e, "failed to release consumer heartbeat");
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn push(&self, job: Job) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let raw = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.registry())
            .arg(&job.queue)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.waiting(&job.queue))
            .arg(raw)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn start_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumerOptions,
    ) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        if !self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string())
        {
            return Err(QueueError::ConsumerAlreadyRegistered(queue.to_string()));
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(self.keys.registry())
            .arg(queue)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;

        let recovered = self.recover_orphans(queue).await?;
        if recovered > 0 {
            warn!(queue, recovered, "re-queued jobs left in flight by a stopped consumer");
        }

        let limiter = options.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit)));

        self.spawn(promote_loop(
            self.conn.clone(),
            self.keys.clone(),
            queue.to_string(),
            self.poll_interval,
            self.cancel.clone(),
        ));

        for slot in 0..options.concurrency.max(1) {
            let worker = Slot {
                conn: self.conn.clone(),
                keys: self.keys.clone(),
                queue: queue.to_string(),
                active: self.keys.active(queue, &self.consumer_id),
                handler: handler.clone(),
                limiter: limiter.clone(),
                poll_interval: self.poll_interval,
                cancel: self.cancel.clone(),
            };
            self.spawn(async move { worker.run(slot).await });
        }

        info!(
            queue,
            backend = "redis",
            consumer_id = %self.consumer_id,
            concurrency = options.concurrency,
            rate_limited = options.rate_limit.is_some(),
            "consumer registered"
        );
        Ok(())
    }

    async fn depths(&self) -> Result<BTreeMap<String, QueueDepth>, QueueError> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.registry())
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;

        let mut out = BTreeMap::new();
        for name in names {
            let (waiting, delayed, failed): (u64, u64, u64) = redis::pipe()
                .cmd("LLEN")
                .arg(self.keys.waiting(&name))
                .cmd("ZCARD")
                .arg(self.keys.delayed(&name))
                .cmd("LLEN")
                .arg(self.keys.failed(&name))
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;
            out.insert(name, QueueDepth { waiting, delayed, failed });
        }
        Ok(out)
    }

    async fn is_connected(&self) -> bool {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<_, String>(&mut conn);
        matches!(tokio::time::timeout(PING_TIMEOUT, ping).await, Ok(Ok(_)))
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Moves due jobs from `:delayed` back onto `:waiting`.
async fn promote_loop(
    mut conn: ConnectionManager,
    keys: Keys,
    queue: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        if let Err(e) = promote_due(&mut conn, &keys, &queue).await {
            warn!(queue = %queue, error = %e, "failed to promote delayed jobs");
        }
    }
}

async fn promote_due(
    conn: &mut ConnectionManager,
    keys: &Keys,
    queue: &str,
) -> Result<(), QueueError> {
    let now = Utc::now().timestamp_millis();
    let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(keys.delayed(queue))
        .arg("-inf")
        .arg(now)
        .arg("LIMIT")
        .arg(0)
        .arg(PROMOTE_BATCH)
        .query_async(&mut *conn)
        .await
        .map_err(broker_err)?;

    for raw in due {
        // ZREM decides the winner when several processes promote concurrently.
        let removed: u64 = redis::cmd("ZREM")
            .arg(keys.delayed(queue))
            .arg(&raw)
            .query_async(&mut *conn)
            .await
            .map_err(broker_err)?;
        if removed == 1 {
            let _: () = redis::cmd("LPUSH")
                .arg(keys.waiting(queue))
                .arg(&raw)
                .query_async(&mut *conn)
                .await
                .map_err(broker_err)?;
        }
    }
    Ok(())
}

/// One concurrency slot of a consumer.
struct Slot {
    conn: ConnectionManager,
    keys: Keys,
    queue: String,
    active: String,
    handler: Arc<dyn JobHandler>,
    limiter: Option<Arc<RateLimiter>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Slot {
    async fn run(mut self, slot: usize) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let next: Result<Option<String>, QueueError> = redis::cmd("RPOPLPUSH")
                .arg(self.keys.waiting(&self.queue))
                .arg(&self.active)
                .query_async(&mut self.conn)
                .await
                .map_err(broker_err);

            match next {
                Ok(Some(raw)) => {
                    if let Some(limiter) = &self.limiter {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                // Left in the active list; recovered once the heartbeat lapses.
                                break;
                            }
                            _ = limiter.acquire() => {}
                        }
                    }
                    if let Err(e) = self.process(raw).await {
                        warn!(queue = %self.queue, slot, error = %e, "failed to settle job");
                    }
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(queue = %self.queue, slot, error = %e, "failed to fetch job");
                    self.idle().await;
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn process(&mut self, raw: String) -> Result<(), QueueError> {
        let settle = match serde_json::from_str::<Job>(&raw) {
            Ok(job) => match executor::execute(job, self.handler.as_ref()).await {
                Disposition::Completed => Settle::Ack,
                Disposition::Retry(job, delay) => Settle::Retry {
                    ready_at_ms: ready_at_millis(Utc::now().timestamp_millis(), delay),
                    job: serde_json::to_string(&job)?,
                },
                Disposition::Dropped(job) => Settle::DeadLetter {
                    job: serde_json::to_string(&job)?,
                },
            },
            Err(e) => {
                error!(queue = %self.queue, error = %e, "undecodable job; moving to failed");
                Settle::DeadLetter { job: raw.clone() }
            }
        };

        let _: () = settle_pipeline(&self.keys, &self.queue, &self.active, &raw, settle)
            .query_async(&mut self.conn)
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}
