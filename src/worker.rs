use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ipscell_core::IpsCellError;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Provisioning,
    Archive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Creating,
    Created,
    Archiving,
    Archived,
    Failed,
}

impl TaskStatus {
    /// A terminal task no longer occupies its sandbox's worker.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Created | TaskStatus::Archived | TaskStatus::Failed
        )
    }
}

#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: String,
}

/// Shared, observable state of a long-running task. The task mutates it as
/// it runs; state derivation reads snapshots.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Mutex<TaskSnapshot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TaskHandle {
    pub fn new(kind: TaskKind, status: TaskStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskSnapshot {
                kind,
                status,
                progress: "Waiting".to_string(),
            })),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        lock(&self.inner).clone()
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        lock(&self.inner).progress = progress.into();
    }

    pub fn set_status(&self, status: TaskStatus) {
        lock(&self.inner).status = status;
    }
}

/// A long-running task owned by one sandbox's worker.
#[async_trait]
pub trait LongTask: Send {
    fn handle(&self) -> TaskHandle;
    async fn run(self: Box<Self>);
}

/// Per-sandbox single-slot task queue.
///
/// One spawned loop drains a capacity-1 mailbox, so tasks for a sandbox
/// execute strictly serially. `enqueue` rejects while the slot is full or
/// the current task has not reached a terminal status; the rejection is the
/// authoritative "busy" answer.
pub struct TaskWorker {
    tx: mpsc::Sender<Box<dyn LongTask>>,
    current: Arc<Mutex<Option<TaskHandle>>>,
}

impl TaskWorker {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<Box<dyn LongTask>>(1);
        let current: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let slot = current.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                *lock(&slot) = Some(task.handle());
                task.run().await;
            }
        });
        Self { tx, current }
    }

    pub fn enqueue(&self, task: Box<dyn LongTask>) -> Result<(), IpsCellError> {
        if let Some(current) = self.current_task() {
            if !current.status.is_terminal() {
                return Err(IpsCellError::WorkerBusy);
            }
        }
        self.tx.try_send(task).map_err(|_| IpsCellError::WorkerBusy)
    }

    /// Most recent task accepted by the worker, including finished ones;
    /// state derivation inspects its kind and status.
    pub fn current_task(&self) -> Option<TaskSnapshot> {
        lock(&self.current).as_ref().map(TaskHandle::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SleepTask {
        handle: TaskHandle,
        delay: Duration,
        done_status: TaskStatus,
    }

    impl SleepTask {
        fn new(delay: Duration) -> Self {
            Self {
                handle: TaskHandle::new(TaskKind::Provisioning, TaskStatus::Creating),
                delay,
                done_status: TaskStatus::Created,
            }
        }
    }

    #[async_trait]
    impl LongTask for SleepTask {
        fn handle(&self) -> TaskHandle {
            self.handle.clone()
        }

        async fn run(self: Box<Self>) {
            tokio::time::sleep(self.delay).await;
            self.handle.set_progress("done");
            self.handle.set_status(self.done_status);
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_runs_enqueued_task() {
        let worker = TaskWorker::spawn();
        worker
            .enqueue(Box::new(SleepTask::new(Duration::from_millis(1))))
            .unwrap();
        wait_for(|| {
            worker
                .current_task()
                .map(|task| task.status == TaskStatus::Created)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(worker.current_task().unwrap().progress, "done");
    }

    #[tokio::test]
    async fn test_rejects_while_task_is_running() {
        let worker = TaskWorker::spawn();
        worker
            .enqueue(Box::new(SleepTask::new(Duration::from_millis(200))))
            .unwrap();
        wait_for(|| worker.current_task().is_some()).await;
        let err = worker
            .enqueue(Box::new(SleepTask::new(Duration::from_millis(1))))
            .unwrap_err();
        assert!(matches!(err, IpsCellError::WorkerBusy));
    }

    #[tokio::test]
    async fn test_accepts_again_after_terminal_status() {
        let worker = TaskWorker::spawn();
        worker
            .enqueue(Box::new(SleepTask::new(Duration::from_millis(1))))
            .unwrap();
        wait_for(|| {
            worker
                .current_task()
                .map(|task| task.status.is_terminal())
                .unwrap_or(false)
        })
        .await;
        worker
            .enqueue(Box::new(SleepTask::new(Duration::from_millis(1))))
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_task_initially() {
        let worker = TaskWorker::spawn();
        assert!(worker.current_task().is_none());
    }
}
