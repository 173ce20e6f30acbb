//! Bounded-concurrency batch execution.
//!
//! [`TaskManager`] runs a handler over a list of task parameters with at most
//! `batch_limit` handlers in flight. Tasks are admitted in list order. A
//! failing task never stops its siblings: every outcome is recorded in its
//! own [`TaskRecord`].

use std::fmt;
use std::future::Future;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};

/// Memory kept back for the runtime before sizing the batch.
pub const RUNTIME_HEADROOM: u64 = 128 * 1024 * 1024;

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Parameters and outcome of one task.
#[derive(Debug)]
pub struct TaskRecord<T, R> {
    pub params: T,
    pub state: TaskState,
    pub result: Option<R>,
    pub error: Option<Error>,
}

impl<T, R> TaskRecord<T, R> {
    fn new(params: T) -> Self {
        Self {
            params,
            state: TaskState::Pending,
            result: None,
            error: None,
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.state != TaskState::Pending {
            return Err(Error::msg(
                ErrorKind::ContractViolation,
                format!("cannot start a {} task", self.state),
            ));
        }
        self.state = TaskState::Running;
        Ok(())
    }

    /// Record the handler's outcome. Only a running task can finish, once.
    fn finish(&mut self, outcome: Result<R>) -> Result<()> {
        if self.state != TaskState::Running {
            return Err(Error::msg(
                ErrorKind::ContractViolation,
                format!("task finished while {}", self.state),
            ));
        }
        match outcome {
            Ok(result) => {
                self.state = TaskState::Succeeded;
                self.result = Some(result);
            }
            Err(e) => {
                self.state = TaskState::Failed;
                self.error = Some(e);
            }
        }
        Ok(())
    }

    /// Move a pending task straight to `Cancelled`. Returns whether it moved.
    fn cancel(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Cancelled;
        self.error = Some(Error::msg(ErrorKind::Cancelled, "cancelled before start"));
        true
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Succeeded
    }
}

/// Cancels the batch it was taken from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop admitting tasks. Running tasks finish on their own.
    pub fn cancel(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!("cancelling batch: {}", reason);
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs a list of tasks with bounded concurrency.
pub struct TaskManager<T> {
    batch_limit: usize,
    tasks: Vec<T>,
    token: CancellationToken,
}

impl<T: Clone> TaskManager<T> {
    /// Create a manager. Nothing runs until [`run`](Self::run).
    pub fn new(batch_limit: usize, tasks: Vec<T>) -> Self {
        Self {
            batch_limit: batch_limit.max(1),
            tasks,
            token: CancellationToken::new(),
        }
    }

    /// Share cancellation with an outer token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.token.clone())
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Run every task through `handler`, returning one record per task in
    /// list order.
    ///
    /// Once cancelled, each task that has not started is marked
    /// [`TaskState::Cancelled`] and passed to `on_cancel` exactly once.
    ///
    /// # Errors
    ///
    /// Only a broken task lifecycle produces an error; task failures are
    /// recorded in their records.
    pub async fn run<R, F, Fut, C>(self, handler: F, mut on_cancel: C) -> Result<Vec<TaskRecord<T, R>>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
        C: FnMut(&T),
    {
        let mut records: Vec<TaskRecord<T, R>> =
            self.tasks.into_iter().map(TaskRecord::new).collect();
        let total = records.len();
        let mut next = 0;
        let mut cancelled = false;
        let mut running = FuturesUnordered::new();

        debug!("running {} tasks, {} at a time", total, self.batch_limit);

        loop {
            if !cancelled && self.token.is_cancelled() {
                cancelled = true;
                let mut skipped = 0;
                for record in &mut records[next..] {
                    if record.cancel() {
                        on_cancel(&record.params);
                        skipped += 1;
                    }
                }
                next = total;
                debug!("{} pending tasks cancelled, {} still running", skipped, running.len());
            }

            while !cancelled && running.len() < self.batch_limit && next < total {
                let index = next;
                records[index].start()?;
                let fut = handler(records[index].params.clone());
                running.push(async move { (index, fut.await) });
                next += 1;
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled(), if !cancelled => {}
                Some((index, outcome)) = running.next() => {
                    records[index].finish(outcome)?;
                }
            }
        }

        Ok(records)
    }
}

/// Inputs for sizing a batch from available memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    pub total_bytes: u64,
    /// Working buffer one running task is expected to hold.
    pub per_task_bytes: u64,
    /// Fraction of memory left unused for runtime slack.
    pub reserve_rate: f64,
    pub max_concurrency: usize,
}

impl MemoryBudget {
    /// `floor((total - headroom) * (1 - reserve) / per_task)`, clamped to
    /// `1..=max_concurrency`.
    pub fn batch_limit(&self) -> usize {
        let usable = self.total_bytes.saturating_sub(RUNTIME_HEADROOM) as f64
            * (1.0 - self.reserve_rate.clamp(0.0, 1.0));
        let per_task = self.per_task_bytes.max(1) as f64;
        let limit = (usable / per_task).floor() as usize;
        limit.clamp(1, self.max_concurrency.max(1))
    }
}

/// Total physical memory of this machine, in bytes.
pub fn detect_total_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}
