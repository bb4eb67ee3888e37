//! Task queues and the worker loop that drains them.
//!
//! [`MockTaskQueue`] runs each task as soon as it is inserted, which keeps
//! single-process pipelines and tests deterministic. [`LeasedTaskQueue`]
//! keeps durable records in an [`IOManager`]; a leased record stays
//! invisible until its deadline passes, so a task whose worker died is
//! handed out again. Delivery is at-least-once and tasks are idempotent.

use crate::config::{QueueConfig, QueueKind, WorkerConfig};
use crate::error::{PipelineError, Result};
use crate::io::{IOManager, StorageProvider};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of records waiting to run or leased
pub const PENDING_PREFIX: &str = "queue/pending/";

/// Prefix of records that failed permanently
pub const FAILED_PREFIX: &str = "queue/failed/";

/// A task handed to a worker
#[derive(Debug, Clone)]
pub struct LeasedTask {
    /// Record key inside the queue store
    pub key: String,
    pub task: Task,
    /// Leases granted so far, this one included
    pub attempts: u32,
    pub deadline: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a task
    async fn insert(&self, task: Task) -> Result<()>;

    /// Submit tasks in order, returning how many were accepted
    async fn insert_all(&self, tasks: Vec<Task>) -> Result<usize> {
        let count = tasks.len();
        for task in tasks {
            self.insert(task).await?;
        }
        Ok(count)
    }

    /// Take the next visible task, hiding it for `visibility_timeout`
    async fn lease(&self, visibility_timeout: Duration) -> Result<Option<LeasedTask>>;

    /// Remove a completed task
    async fn acknowledge(&self, lease: &LeasedTask) -> Result<()>;

    /// Make a leased task visible again right away
    async fn release(&self, lease: &LeasedTask) -> Result<()>;

    /// Record a permanent failure and stop retrying
    async fn fail(&self, lease: &LeasedTask, reason: &str) -> Result<()>;

    /// Number of tasks not yet acknowledged or failed
    async fn pending(&self) -> Result<usize>;
}

/// Executes each task on insert, in submission order, on the caller's task
pub struct MockTaskQueue {
    provider: Arc<dyn StorageProvider>,
    executed: AtomicUsize,
}

impl MockTaskQueue {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            executed: AtomicUsize::new(0),
        }
    }

    /// Tasks run successfully so far
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskQueue for MockTaskQueue {
    async fn insert(&self, task: Task) -> Result<()> {
        task.execute(self.provider.as_ref()).await?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn lease(&self, _visibility_timeout: Duration) -> Result<Option<LeasedTask>> {
        Ok(None)
    }

    async fn acknowledge(&self, _lease: &LeasedTask) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _lease: &LeasedTask) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _lease: &LeasedTask, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Durable form of a queued task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub task: Task,
    pub attempts: u32,
    /// Set while leased; the record is invisible until it passes
    pub lease_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queue persisted as JSON records in an object store
pub struct LeasedTaskQueue {
    io: Arc<dyn IOManager>,
    max_attempts: u32,
    // Keeps keys of one producer in submission order within a microsecond
    sequence: AtomicU64,
    // Serializes lease scans within this process
    lease_lock: tokio::sync::Mutex<()>,
}

impl LeasedTaskQueue {
    pub fn new(io: Arc<dyn IOManager>, max_attempts: u32) -> Self {
        Self {
            io,
            max_attempts: max_attempts.max(1),
            sequence: AtomicU64::new(0),
            lease_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<TaskRecord>> {
        match self.io.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_record(&self, key: &str, record: &TaskRecord) -> Result<()> {
        self.io.put(key, &serde_json::to_vec(record)?).await
    }

    async fn move_to_failed(&self, key: &str, mut record: TaskRecord, reason: &str) -> Result<()> {
        record.lease_deadline = None;
        record.error = Some(reason.to_string());
        let name = key.strip_prefix(PENDING_PREFIX).unwrap_or(key);
        self.write_record(&format!("{}{}", FAILED_PREFIX, name), &record).await?;
        self.io.delete(key).await
    }

    /// Records that failed permanently
    pub async fn failed(&self) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for key in self.io.list(FAILED_PREFIX).await? {
            if let Some(record) = self.read_record(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TaskQueue for LeasedTaskQueue {
    async fn insert(&self, task: Task) -> Result<()> {
        let id = Uuid::new_v4();
        // Time-ordered keys give FIFO leasing
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{}{:020}-{:010}-{}",
            PENDING_PREFIX,
            Utc::now().timestamp_micros(),
            sequence,
            id
        );
        let record = TaskRecord {
            id,
            task,
            attempts: 0,
            lease_deadline: None,
            error: None,
        };
        self.write_record(&key, &record).await?;
        debug!(%id, kind = record.task.kind(), "queued task");
        Ok(())
    }

    async fn lease(&self, visibility_timeout: Duration) -> Result<Option<LeasedTask>> {
        let timeout = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| PipelineError::Configuration(format!("Visibility timeout: {}", e)))?;
        let _guard = self.lease_lock.lock().await;

        for key in self.io.list(PENDING_PREFIX).await? {
            let Some(mut record) = self.read_record(&key).await? else {
                continue;
            };
            let now = Utc::now();
            if record.lease_deadline.is_some_and(|deadline| deadline > now) {
                continue;
            }
            if record.attempts >= self.max_attempts {
                warn!(id = %record.id, attempts = record.attempts, "task exhausted its attempts");
                let reason = format!("Gave up after {} attempts", record.attempts);
                self.move_to_failed(&key, record, &reason).await?;
                continue;
            }

            record.attempts += 1;
            let deadline = now + timeout;
            record.lease_deadline = Some(deadline);
            self.write_record(&key, &record).await?;
            debug!(id = %record.id, attempt = record.attempts, "leased task");
            return Ok(Some(LeasedTask {
                key,
                task: record.task,
                attempts: record.attempts,
                deadline,
            }));
        }
        Ok(None)
    }

    async fn acknowledge(&self, lease: &LeasedTask) -> Result<()> {
        self.io.delete(&lease.key).await
    }

    async fn release(&self, lease: &LeasedTask) -> Result<()> {
        if let Some(mut record) = self.read_record(&lease.key).await? {
            record.lease_deadline = None;
            self.write_record(&lease.key, &record).await?;
        }
        Ok(())
    }

    async fn fail(&self, lease: &LeasedTask, reason: &str) -> Result<()> {
        match self.read_record(&lease.key).await? {
            Some(record) => self.move_to_failed(&lease.key, record, reason).await,
            None => Ok(()),
        }
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.io.list(PENDING_PREFIX).await?.len())
    }
}

/// Build the queue selected by configuration
pub fn create_task_queue(
    config: &QueueConfig,
    provider: Arc<dyn StorageProvider>,
) -> Result<Arc<dyn TaskQueue>> {
    match config.kind {
        QueueKind::Mock => Ok(Arc::new(MockTaskQueue::new(provider))),
        QueueKind::Leased => {
            let url = config.url.as_deref().ok_or_else(|| {
                PipelineError::Configuration("Leased queue needs a url".to_string())
            })?;
            Ok(Arc::new(LeasedTaskQueue::new(provider.open(url)?, config.max_attempts)))
        }
    }
}

/// Counters reported by [`Worker::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

impl WorkerStats {
    pub fn processed(&self) -> usize {
        self.succeeded + self.retried + self.failed
    }
}

/// Leases tasks and executes them until the queue runs dry or the
/// configured task limit is reached
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    provider: Arc<dyn StorageProvider>,
    visibility_timeout: Duration,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        provider: Arc<dyn StorageProvider>,
        visibility_timeout: Duration,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            provider,
            visibility_timeout,
            config,
        }
    }

    /// Process one task; false when nothing was visible
    pub async fn step(&self, stats: &mut WorkerStats) -> Result<bool> {
        let Some(lease) = self.queue.lease(self.visibility_timeout).await? else {
            return Ok(false);
        };

        match lease.task.execute(self.provider.as_ref()).await {
            Ok(()) => {
                self.queue.acknowledge(&lease).await?;
                stats.succeeded += 1;
            }
            Err(e) if e.is_permanent() => {
                warn!(kind = lease.task.kind(), error = %e, "task failed permanently");
                self.queue.fail(&lease, &e.to_string()).await?;
                stats.failed += 1;
            }
            Err(e) => {
                warn!(kind = lease.task.kind(), attempt = lease.attempts, error = %e, "task will be retried");
                self.queue.release(&lease).await?;
                stats.retried += 1;
            }
        }
        Ok(true)
    }

    pub async fn run(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        loop {
            if self
                .config
                .max_tasks
                .is_some_and(|limit| stats.processed() >= limit)
            {
                break;
            }
            if !self.step(&mut stats).await? {
                if self.config.stop_when_empty {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            }
        }
        info!(
            succeeded = stats.succeeded,
            retried = stats.retried,
            failed = stats.failed,
            "worker finished"
        );
        Ok(stats)
    }
}
