//! Worker supervision
//!
//! [`WorkerSupervisor`] owns the map of active workers. `spawn`, `cancel`,
//! `reap` and `sweep` are the only ways the map changes. How a worker runs is
//! decided by a [`WorkerLauncher`]: the production launcher starts one OS
//! process per task, tests and `serve --in-process` run tasks on the tokio
//! runtime behind the same handle interface.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::worker::TaskRunner;
use crate::error::{Error, Result};

/// Liveness of a worker as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Running,
    Exited { success: bool },
}

/// Handle to one running task
#[async_trait]
pub trait WorkerHandle: Send {
    /// Non-blocking check whether the worker has exited
    fn try_exit(&mut self) -> Result<WorkerExit>;

    /// Force the worker to stop. Resolves only once the worker can no
    /// longer touch the stores.
    async fn kill(&mut self) -> Result<()>;
}

/// Starts workers bound to a task id
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, task_id: Uuid) -> Result<Box<dyn WorkerHandle>>;

    fn name(&self) -> &str;
}

/// Something the monitor has to route through the restart path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker exited; on success its outcome is already queued
    Exited { task_id: Uuid, success: bool },
    /// The worker ran past the task timeout and was killed
    TimedOut { task_id: Uuid },
}

struct ActiveWorker {
    handle: Box<dyn WorkerHandle>,
    started: Instant,
}

/// Owner of the active-worker map
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    workers: Mutex<HashMap<Uuid, ActiveWorker>>,
    cap: usize,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, cap: usize) -> Self {
        Self {
            launcher,
            workers: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.cap
    }

    pub fn is_active(&self, task_id: Uuid) -> bool {
        self.workers.lock().contains_key(&task_id)
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.workers.lock().keys().copied().collect()
    }

    /// Launch a worker for a task
    pub fn spawn(&self, task_id: Uuid) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&task_id) {
            return Err(Error::Worker(format!("Task {} already has a worker", task_id)));
        }
        if workers.len() >= self.cap {
            return Err(Error::Worker(format!("Worker cap of {} reached", self.cap)));
        }
        let handle = self.launcher.launch(task_id)?;
        workers.insert(
            task_id,
            ActiveWorker {
                handle,
                started: Instant::now(),
            },
        );
        tracing::info!("[{}] Worker started via {} ({} active)", task_id, self.launcher.name(), workers.len());
        Ok(())
    }

    /// Kill and forget the worker of a task, waiting until it has stopped.
    /// Returns whether one was active.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let Some(mut worker) = self.workers.lock().remove(&task_id) else {
            return false;
        };
        match worker.handle.kill().await {
            Ok(()) => tracing::info!("[{}] Worker killed", task_id),
            Err(e) => tracing::warn!("[{}] Failed to kill worker: {}", task_id, e),
        }
        true
    }

    /// Forget the worker of a task that reported its outcome
    pub fn reap(&self, task_id: Uuid) -> bool {
        self.workers.lock().remove(&task_id).is_some()
    }

    /// Walk the active workers; exited ones are removed, workers past
    /// `timeout` are killed (and waited for) and removed
    pub async fn sweep(&self, timeout: Duration) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        let mut overdue = Vec::new();
        {
            let mut workers = self.workers.lock();
            let ids: Vec<Uuid> = workers.keys().copied().collect();
            for task_id in ids {
                let Some(worker) = workers.get_mut(&task_id) else {
                    continue;
                };
                match worker.handle.try_exit() {
                    Ok(WorkerExit::Running) if worker.started.elapsed() <= timeout => {}
                    Ok(WorkerExit::Running) => {
                        if let Some(worker) = workers.remove(&task_id) {
                            overdue.push((task_id, worker));
                        }
                    }
                    Ok(WorkerExit::Exited { success }) => {
                        workers.remove(&task_id);
                        events.push(WorkerEvent::Exited { task_id, success });
                    }
                    Err(e) => {
                        tracing::warn!("[{}] Lost track of worker: {}", task_id, e);
                        workers.remove(&task_id);
                        events.push(WorkerEvent::Exited { task_id, success: false });
                    }
                }
            }
        }

        for (task_id, mut worker) in overdue {
            tracing::warn!("[{}] Worker exceeded {:?}, killing it", task_id, timeout);
            if let Err(e) = worker.handle.kill().await {
                tracing::warn!("[{}] Failed to kill worker: {}", task_id, e);
            }
            events.push(WorkerEvent::TimedOut { task_id });
        }
        events
    }

    /// Kill every active worker
    pub async fn shutdown(&self) {
        for task_id in self.active_ids() {
            self.cancel(task_id).await;
        }
    }
}

/// Runs each task as `<program> worker --task <id>`
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessLauncher {
    /// `program` defaults to the current executable
    pub fn new(program: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let program = match program {
            Some(p) => p,
            None => std::env::current_exe()
                .map_err(|e| Error::Worker(format!("Cannot locate worker executable: {}", e)))?,
        };
        Ok(Self { program, config_path })
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn try_exit(&mut self) -> Result<WorkerExit> {
        match self.child.try_wait()? {
            Some(status) => Ok(WorkerExit::Exited {
                success: status.success(),
            }),
            None => Ok(WorkerExit::Running),
        }
    }

    async fn kill(&mut self) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        // SIGKILL, then reap
        self.child.kill().await?;
        Ok(())
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, task_id: Uuid) -> Result<Box<dyn WorkerHandle>> {
        let mut command = tokio::process::Command::new(&self.program);
        command.arg("worker").arg("--task").arg(task_id.to_string());
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        let child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Worker(format!("Failed to spawn {}: {}", self.program.display(), e)))?;
        Ok(Box::new(ProcessHandle { child }))
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// Runs each task on the current tokio runtime
pub struct InProcessLauncher {
    runner: Arc<TaskRunner>,
}

impl InProcessLauncher {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }
}

struct TaskHandle {
    join: tokio::task::JoinHandle<Result<()>>,
    exit: Option<WorkerExit>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn try_exit(&mut self) -> Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if !self.join.is_finished() {
            return Ok(WorkerExit::Running);
        }
        let success = match (&mut self.join).now_or_never() {
            Some(Ok(Ok(()))) => true,
            Some(Ok(Err(_))) | Some(Err(_)) => false,
            None => return Ok(WorkerExit::Running),
        };
        let exit = WorkerExit::Exited { success };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.join.abort();
        // Abort lands at the task's next await; wait for it so nothing the
        // task does afterwards can race the rollback
        let success = matches!((&mut self.join).await, Ok(Ok(())));
        self.exit = Some(WorkerExit::Exited { success });
        Ok(())
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, task_id: Uuid) -> Result<Box<dyn WorkerHandle>> {
        let runner = Arc::clone(&self.runner);
        let join = tokio::spawn(async move { runner.run(task_id).await });
        Ok(Box::new(TaskHandle { join, exit: None }))
    }

    fn name(&self) -> &str {
        "in-process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Handle whose exit is flipped by the test
    struct ManualHandle {
        done: Arc<AtomicBool>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WorkerHandle for ManualHandle {
        fn try_exit(&mut self) -> Result<WorkerExit> {
            if self.done.load(Ordering::SeqCst) {
                Ok(WorkerExit::Exited { success: true })
            } else {
                Ok(WorkerExit::Running)
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct ManualLauncher {
        done: Arc<AtomicBool>,
        killed: Arc<AtomicBool>,
    }

    impl WorkerLauncher for ManualLauncher {
        fn launch(&self, _task_id: Uuid) -> Result<Box<dyn WorkerHandle>> {
            Ok(Box::new(ManualHandle {
                done: Arc::clone(&self.done),
                killed: Arc::clone(&self.killed),
            }))
        }

        fn name(&self) -> &str {
            "manual"
        }
    }

    #[test]
    fn test_spawn_respects_cap() {
        let supervisor = WorkerSupervisor::new(Arc::new(ManualLauncher::default()), 1);
        let first = Uuid::new_v4();
        supervisor.spawn(first).unwrap();
        assert!(!supervisor.has_capacity());
        assert!(supervisor.spawn(Uuid::new_v4()).is_err());
        assert!(supervisor.spawn(first).is_err());
        assert!(supervisor.reap(first));
        assert!(supervisor.has_capacity());
    }

    #[tokio::test]
    async fn test_cancel_kills_and_removes() {
        let launcher = Arc::new(ManualLauncher::default());
        let killed = Arc::clone(&launcher.killed);
        let supervisor = WorkerSupervisor::new(launcher, 2);
        let task = Uuid::new_v4();
        supervisor.spawn(task).unwrap();

        assert!(supervisor.cancel(task).await);
        assert!(killed.load(Ordering::SeqCst));
        assert!(!supervisor.is_active(task));
        assert!(!supervisor.cancel(task).await);
    }

    #[tokio::test]
    async fn test_sweep_reports_exits_and_timeouts() {
        let launcher = Arc::new(ManualLauncher::default());
        let done = Arc::clone(&launcher.done);
        let supervisor = WorkerSupervisor::new(launcher, 2);
        let task = Uuid::new_v4();
        supervisor.spawn(task).unwrap();

        assert!(supervisor.sweep(Duration::from_secs(60)).await.is_empty());
        assert_eq!(supervisor.sweep(Duration::ZERO).await, vec![WorkerEvent::TimedOut { task_id: task }]);
        assert_eq!(supervisor.active_count(), 0);

        supervisor.spawn(task).unwrap();
        done.store(true, Ordering::SeqCst);
        assert_eq!(
            supervisor.sweep(Duration::from_secs(60)).await,
            vec![WorkerEvent::Exited { task_id: task, success: true }]
        );
        assert!(!supervisor.is_active(task));
    }

    #[tokio::test]
    async fn test_in_process_kill_waits_for_the_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let join = tokio::spawn(async move {
            // Runs until aborted; the guard records when the future is dropped
            struct Guard(Arc<AtomicBool>);
            impl Drop for Guard {
                fn drop(&mut self) {
                    self.0.store(true, Ordering::SeqCst);
                }
            }
            let _guard = Guard(flag);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), Error>(())
        });
        let mut handle = TaskHandle { join, exit: None };
        tokio::task::yield_now().await;

        handle.kill().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(handle.try_exit().unwrap(), WorkerExit::Exited { success: false });
        // Killing again is a no-op
        handle.kill().await.unwrap();
    }
}
