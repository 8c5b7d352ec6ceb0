//! Task scheduler
//!
//! Two loops share one [`WorkerSupervisor`]:
//! - the poll loop drains the outcome queues and starts pending tasks while
//!   the worker cap allows it
//! - the monitor loop sweeps the active workers and restarts tasks whose
//!   worker died or ran past the task timeout
//!
//! Every lifecycle transition after a worker exits goes through
//! [`Scheduler::restart_or_clear`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::context::TaskContext;
use super::supervisor::{WorkerEvent, WorkerLauncher, WorkerSupervisor};
use crate::error::Result;
use crate::types::{DocumentStatus, QueueName, Task, TaskAction, TaskStatus, TaskType};

const MIN_INTERVAL: Duration = Duration::from_millis(100);

pub struct Scheduler {
    ctx: Arc<TaskContext>,
    supervisor: WorkerSupervisor,
}

impl Scheduler {
    pub fn new(ctx: Arc<TaskContext>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let cap = ctx.config.scheduler.worker_cap();
        Self::with_cap(ctx, launcher, cap)
    }

    pub fn with_cap(ctx: Arc<TaskContext>, launcher: Arc<dyn WorkerLauncher>, cap: usize) -> Self {
        Self {
            supervisor: WorkerSupervisor::new(launcher, cap),
            ctx,
        }
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    /// Run the poll and monitor loops until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let resumed = self.resume_interrupted().await?;
        if resumed > 0 {
            tracing::info!("Resumed {} interrupted tasks", resumed);
        }

        let config = &self.ctx.config.scheduler;
        let mut poll = tokio::time::interval(config.poll_interval().max(MIN_INTERVAL));
        let mut monitor = tokio::time::interval(config.monitor_interval().max(MIN_INTERVAL));
        tracing::info!(
            "Scheduler started (cap {}, poll {:?}, monitor {:?})",
            self.supervisor.cap(),
            config.poll_interval(),
            config.monitor_interval()
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!("Poll loop error: {}", e);
                    }
                }
                _ = monitor.tick() => {
                    if let Err(e) = self.monitor_once().await {
                        tracing::error!("Monitor loop error: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopping, killing {} workers", self.supervisor.active_count());
        self.supervisor.shutdown().await;
        Ok(())
    }

    /// Push tasks left running by a previous scheduler back to `pending`
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let mut resumed = 0;
        for task in self.ctx.db.tasks_with_status(TaskStatus::Running)? {
            if self.supervisor.is_active(task.id) {
                continue;
            }
            self.ctx.rollback_task(&task, false).await?;
            self.ctx.queue.remove_everywhere(task.id)?;
            self.ctx.db.set_task_status(task.id, TaskStatus::Pending)?;
            self.ctx.queue.enqueue(QueueName::Pending, task.id)?;
            tracing::info!("[{}] Interrupted task requeued", task.id);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// One pass of the poll loop; returns the number of workers started
    pub async fn poll_once(&self) -> Result<usize> {
        let queue = &self.ctx.queue;

        while let Some(task_id) = queue.dequeue_head(QueueName::Success)? {
            self.supervisor.reap(task_id);
            tracing::debug!("[{}] Worker reaped", task_id);
        }
        while let Some(task_id) = queue.dequeue_head(QueueName::Restart)? {
            self.supervisor.reap(task_id);
            self.route(task_id, TaskAction::Restart).await;
        }
        while let Some(task_id) = queue.dequeue_head(QueueName::SilentError)? {
            self.supervisor.reap(task_id);
            self.route(task_id, TaskAction::Fail).await;
        }

        self.reconcile_cleared().await?;

        let mut started = 0;
        while let Some(task_id) = queue.dequeue_head(QueueName::Pending)? {
            if !self.supervisor.has_capacity() {
                queue.requeue_tail(QueueName::Pending, task_id)?;
                break;
            }
            match self.ctx.db.get_task(task_id)? {
                Some(task) if task.status == TaskStatus::Pending => {
                    if self.start(&task).await? {
                        started += 1;
                    }
                }
                Some(task) => {
                    tracing::debug!("[{}] Skipping queued task in status {}", task_id, task.status.as_str());
                }
                None => tracing::warn!("[{}] Queued task no longer exists", task_id),
            }
        }
        Ok(started)
    }

    /// One pass of the monitor loop
    pub async fn monitor_once(&self) -> Result<()> {
        let timeout = self.ctx.config.scheduler.task_timeout();
        for event in self.supervisor.sweep(timeout).await {
            match event {
                // Outcome already queued; the poll loop routes it
                WorkerEvent::Exited { success: true, .. } => {}
                WorkerEvent::Exited { task_id, success: false } => {
                    tracing::warn!("[{}] Worker died", task_id);
                    self.route(task_id, TaskAction::Restart).await;
                }
                WorkerEvent::TimedOut { task_id } => {
                    tracing::warn!("[{}] Worker timed out", task_id);
                    self.route(task_id, TaskAction::Restart).await;
                }
            }
        }
        Ok(())
    }

    /// Kill and roll back, then either requeue the task for another attempt
    /// or move it to its terminal status. Returns the resulting status.
    ///
    /// `Restart` and `Fail` leave terminal tasks untouched. `Cancel` leaves a
    /// finished task alone; `Delete` marks it deleted without rolling back.
    pub async fn restart_or_clear(&self, task_id: Uuid, action: TaskAction) -> Result<TaskStatus> {
        let task = self.ctx.db.require_task(task_id)?;
        // The worker is gone before anything is rolled back
        self.supervisor.cancel(task_id).await;

        if task.status.is_terminal() {
            return match action {
                TaskAction::Delete => {
                    self.ctx.queue.remove_everywhere(task_id)?;
                    self.ctx.db.set_task_status(task_id, TaskStatus::Deleted)?;
                    Ok(TaskStatus::Deleted)
                }
                _ => Ok(task.status),
            };
        }

        let max_retries = self.ctx.config.scheduler.max_retries;
        let stages = task.task_type.stage_count();
        if action == TaskAction::Restart && task.retry < max_retries {
            let retry = task.retry + 1;
            self.ctx.rollback_task(&task, false).await?;
            self.ctx.queue.remove_everywhere(task_id)?;
            self.ctx.db.set_task_retry(task_id, retry)?;
            self.ctx.report(task_id, format!("restart: attempt {} of {}", retry, max_retries), 0, stages);
            self.ctx.queue.enqueue(QueueName::Pending, task_id)?;
            tracing::info!("[{}] Requeued for retry {}", task_id, retry);
            return Ok(TaskStatus::Pending);
        }

        let status = match action {
            TaskAction::Cancel => TaskStatus::Canceled,
            TaskAction::Delete => TaskStatus::Deleted,
            TaskAction::Restart | TaskAction::Fail => TaskStatus::Failed,
        };
        self.ctx.queue.remove_everywhere(task_id)?;
        self.ctx.rollback_task(&task, true).await?;
        self.ctx.db.set_task_status(task_id, status)?;
        self.ctx.report(task_id, status.as_str(), 0, stages);
        tracing::info!("[{}] Task {} after {} retries", task_id, status.as_str(), task.retry);
        Ok(status)
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        self.restart_or_clear(task_id, TaskAction::Cancel).await
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        self.restart_or_clear(task_id, TaskAction::Delete).await
    }

    /// Mark a task and its document running, then hand it to a worker.
    /// Returns false when the launch failed and the task was routed back.
    async fn start(&self, task: &Task) -> Result<bool> {
        self.ctx.db.set_task_status(task.id, TaskStatus::Running)?;
        if matches!(task.task_type, TaskType::ParseDocument | TaskType::ParseTemporaryDocument) {
            self.ctx.db.set_document_status(task.operation_id, DocumentStatus::Running)?;
        }
        match self.supervisor.spawn(task.id) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("[{}] Failed to start worker: {}", task.id, e);
                self.route(task.id, TaskAction::Restart).await;
                Ok(false)
            }
        }
    }

    /// Kill workers whose task was cleared by another process (the CLI
    /// applies operator actions directly to the store)
    async fn reconcile_cleared(&self) -> Result<()> {
        for task_id in self.supervisor.active_ids() {
            let Some(task) = self.ctx.db.get_task(task_id)? else {
                self.supervisor.cancel(task_id).await;
                continue;
            };
            if matches!(task.status, TaskStatus::Canceled | TaskStatus::Deleted) {
                self.supervisor.cancel(task_id).await;
                self.ctx.rollback_task(&task, true).await?;
                tracing::info!("[{}] Stopped worker of {} task", task_id, task.status.as_str());
            }
        }
        Ok(())
    }

    /// Apply a lifecycle action without letting its failure escape
    async fn route(&self, task_id: Uuid, action: TaskAction) {
        if let Err(e) = self.restart_or_clear(task_id, action).await {
            tracing::error!("[{}] Failed to apply {:?}: {}", task_id, action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::supervisor::{InProcessLauncher, WorkerExit, WorkerHandle};
    use crate::processing::TaskRunner;
    use crate::storage::{seed_document, text_chunk, MetadataDb};
    use crate::testing::{context, SlowEmbedder};
    use crate::types::{Document, KnowledgeBase, ParserMethod};
    use async_trait::async_trait;

    fn scheduler(ctx: &Arc<TaskContext>, cap: usize) -> Scheduler {
        let launcher = Arc::new(InProcessLauncher::new(Arc::new(TaskRunner::new(Arc::clone(ctx)))));
        Scheduler::with_cap(Arc::clone(ctx), launcher, cap)
    }

    async fn submit(ctx: &TaskContext, body: &[u8]) -> (Document, Task) {
        let kb = KnowledgeBase::new("kb", "stub", crate::testing::STUB_DIMENSIONS);
        ctx.db.insert_knowledge_base(&kb).unwrap();
        let blob_id = ctx.blobs.put_new(body).await.unwrap();
        let doc = Document::new(Some(kb.id), "notes.txt", ParserMethod::General, 64, blob_id, "h".into());
        ctx.db.insert_document(&doc).unwrap();
        let task = Task::new(doc.id, TaskType::ParseDocument);
        ctx.db.insert_task(&task).unwrap();
        ctx.queue.enqueue(QueueName::Pending, task.id).unwrap();
        (doc, task)
    }

    async fn wait_until_idle(scheduler: &Scheduler) {
        for _ in 0..200 {
            scheduler.monitor_once().await.unwrap();
            scheduler.poll_once().await.unwrap();
            if scheduler.supervisor().active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers did not finish");
    }

    #[tokio::test]
    async fn test_pending_task_runs_to_success() {
        let (ctx, _dir) = context();
        let (doc, task) = submit(&ctx, b"Scheduling parse jobs.\n\nWorkers report back.").await;
        let scheduler = scheduler(&ctx, 2);

        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        assert!(scheduler.supervisor().is_active(task.id));
        wait_until_idle(&scheduler).await;

        assert_eq!(ctx.db.require_task(task.id).unwrap().status, TaskStatus::Success);
        let doc = ctx.db.require_document(doc.id).unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(ctx.db.count_chunks(doc.id).unwrap() > 0);
        assert_eq!(ctx.queue.len(QueueName::Success).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cap_requeues_to_tail() {
        let (ctx, _dir) = context();
        let (_, first) = submit(&ctx, b"first").await;
        let (_, second) = submit(&ctx, b"second").await;
        let scheduler = scheduler(&ctx, 1);

        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        assert!(scheduler.supervisor().is_active(first.id));
        assert_eq!(ctx.queue.dequeue_head(QueueName::Pending).unwrap(), Some(second.id));
    }

    #[tokio::test]
    async fn test_killed_worker_is_restarted_with_rollback() {
        let (ctx, _dir) = context();
        let (doc, task) = submit(&ctx, b"Partial output.").await;
        // Chunks left behind by the interrupted attempt
        let partial = vec![text_chunk(doc.id, 0, "half written"), text_chunk(doc.id, 1, "chunks")];
        ctx.db.insert_chunk_graph(&partial, &[]).unwrap();
        ctx.db.set_task_status(task.id, TaskStatus::Running).unwrap();
        ctx.db.set_document_status(doc.id, DocumentStatus::Running).unwrap();
        let scheduler = scheduler(&ctx, 1);

        let status = scheduler.restart_or_clear(task.id, TaskAction::Restart).await.unwrap();
        assert_eq!(status, TaskStatus::Pending);
        let task = ctx.db.require_task(task.id).unwrap();
        assert_eq!(task.retry, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.db.require_document(doc.id).unwrap().status, DocumentStatus::Pending);
        // Requeued once even though it was already queued as pending
        assert_eq!(ctx.queue.len(QueueName::Pending).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (ctx, _dir) = context();
        let (_, task) = submit(&ctx, b"x").await;
        let scheduler = scheduler(&ctx, 1);

        for attempt in 1..=3 {
            let status = scheduler.restart_or_clear(task.id, TaskAction::Restart).await.unwrap();
            assert_eq!(status, TaskStatus::Pending);
            assert_eq!(ctx.db.require_task(task.id).unwrap().retry, attempt);
        }
        let status = scheduler.restart_or_clear(task.id, TaskAction::Restart).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(ctx.queue.len(QueueName::Pending).unwrap(), 0);

        // A terminal task ignores further restarts
        let status = scheduler.restart_or_clear(task.id, TaskAction::Restart).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);
        let reports = ctx.db.status_reports(task.id).unwrap();
        assert_eq!(reports.last().unwrap().message, "failed");
    }

    #[tokio::test]
    async fn test_cancel_kills_active_worker() {
        let (mut ctx, _dir) = context();
        Arc::get_mut(&mut ctx).unwrap().embedder = Arc::new(SlowEmbedder(Duration::from_secs(30)));
        let (doc, task) = submit(&ctx, b"A document that takes a long time to embed.").await;
        let scheduler = scheduler(&ctx, 1);

        scheduler.poll_once().await.unwrap();
        assert!(scheduler.supervisor().is_active(task.id));

        let status = scheduler.cancel_task(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::Canceled);
        assert!(!scheduler.supervisor().is_active(task.id));
        assert_eq!(scheduler.supervisor().active_count(), 0);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.queue.len(QueueName::Pending).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_file_fails_without_retry() {
        let (ctx, _dir) = context();
        let kb = KnowledgeBase::new("kb", "stub", crate::testing::STUB_DIMENSIONS);
        ctx.db.insert_knowledge_base(&kb).unwrap();
        let blob_id = ctx.blobs.put_new(b"\x00\x01").await.unwrap();
        let doc = Document::new(Some(kb.id), "archive.rar", ParserMethod::General, 64, blob_id, "h".into());
        ctx.db.insert_document(&doc).unwrap();
        let task = Task::new(doc.id, TaskType::ParseDocument);
        ctx.db.insert_task(&task).unwrap();
        ctx.queue.enqueue(QueueName::Pending, task.id).unwrap();
        let scheduler = scheduler(&ctx, 1);

        scheduler.poll_once().await.unwrap();
        wait_until_idle(&scheduler).await;
        let task = ctx.db.require_task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry, 0);
    }

    #[tokio::test]
    async fn test_resume_interrupted_requeues_running() {
        let (ctx, _dir) = context();
        let kb = KnowledgeBase::new("kb", "stub", crate::testing::STUB_DIMENSIONS);
        ctx.db.insert_knowledge_base(&kb).unwrap();
        let (doc, _) = seed_document(&ctx.db, Some(kb.id), "a.txt", &["left over"]);
        let task = Task::new(doc.id, TaskType::ParseDocument);
        ctx.db.insert_task(&task).unwrap();
        ctx.db.set_task_status(task.id, TaskStatus::Running).unwrap();
        let scheduler = scheduler(&ctx, 1);

        assert_eq!(scheduler.resume_interrupted().await.unwrap(), 1);
        assert_eq!(ctx.db.require_task(task.id).unwrap().status, TaskStatus::Pending);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.queue.dequeue_head(QueueName::Pending).unwrap(), Some(task.id));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (ctx, _dir) = context();
        let scheduler = scheduler(&ctx, 1);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_monitor_restarts_timed_out_worker() {
        let (mut ctx, _dir) = context();
        {
            let ctx = Arc::get_mut(&mut ctx).unwrap();
            ctx.embedder = Arc::new(SlowEmbedder(Duration::from_secs(30)));
            ctx.config.scheduler.task_timeout_secs = 0;
        }
        let (doc, task) = submit(&ctx, b"A document whose worker never finishes.").await;
        let scheduler = scheduler(&ctx, 1);

        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        assert_eq!(ctx.db.require_document(doc.id).unwrap().status, DocumentStatus::Running);
        ctx.db
            .insert_chunk_graph(&[text_chunk(doc.id, 0, "written before the kill")], &[])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.monitor_once().await.unwrap();
        assert!(!scheduler.supervisor().is_active(task.id));
        let task = ctx.db.require_task(task.id).unwrap();
        assert_eq!(task.retry, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.queue.dequeue_head(QueueName::Pending).unwrap(), Some(task.id));
        let reports = ctx.db.status_reports(task.id).unwrap();
        assert_eq!(reports.last().unwrap().message, "restart: attempt 1 of 3");
    }

    /// Worker that has already died without reporting an outcome
    struct DeadHandle;

    #[async_trait]
    impl WorkerHandle for DeadHandle {
        fn try_exit(&mut self) -> Result<WorkerExit> {
            Ok(WorkerExit::Exited { success: false })
        }

        async fn kill(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct DeadLauncher;

    impl WorkerLauncher for DeadLauncher {
        fn launch(&self, _task_id: Uuid) -> Result<Box<dyn WorkerHandle>> {
            Ok(Box::new(DeadHandle))
        }

        fn name(&self) -> &str {
            "dead"
        }
    }

    #[tokio::test]
    async fn test_monitor_restarts_crashed_worker() {
        let (ctx, _dir) = context();
        let (doc, task) = submit(&ctx, b"Crash scenario.").await;
        let scheduler = Scheduler::with_cap(Arc::clone(&ctx), Arc::new(DeadLauncher), 1);

        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        ctx.db.insert_chunk_graph(&[text_chunk(doc.id, 0, "partial")], &[]).unwrap();

        scheduler.monitor_once().await.unwrap();
        let task = ctx.db.require_task(task.id).unwrap();
        assert_eq!(task.retry, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.db.require_document(doc.id).unwrap().status, DocumentStatus::Pending);
        assert_eq!(ctx.queue.dequeue_head(QueueName::Pending).unwrap(), Some(task.id));
    }

    /// Worker that is mid-write when the kill arrives: its last chunk lands
    /// before it stops
    struct LateWriteHandle {
        db: Arc<MetadataDb>,
        document_id: Uuid,
    }

    #[async_trait]
    impl WorkerHandle for LateWriteHandle {
        fn try_exit(&mut self) -> Result<WorkerExit> {
            Ok(WorkerExit::Running)
        }

        async fn kill(&mut self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.db
                .insert_chunk_graph(&[text_chunk(self.document_id, 0, "late write")], &[])
        }
    }

    struct LateWriteLauncher {
        db: Arc<MetadataDb>,
        document_id: Uuid,
    }

    impl WorkerLauncher for LateWriteLauncher {
        fn launch(&self, _task_id: Uuid) -> Result<Box<dyn WorkerHandle>> {
            Ok(Box::new(LateWriteHandle {
                db: Arc::clone(&self.db),
                document_id: self.document_id,
            }))
        }

        fn name(&self) -> &str {
            "late-write"
        }
    }

    #[tokio::test]
    async fn test_cancel_rolls_back_after_worker_stops() {
        let (ctx, _dir) = context();
        let (doc, task) = submit(&ctx, b"Cancelled mid-write.").await;
        let launcher = Arc::new(LateWriteLauncher {
            db: Arc::clone(&ctx.db),
            document_id: doc.id,
        });
        let scheduler = Scheduler::with_cap(Arc::clone(&ctx), launcher, 1);
        scheduler.poll_once().await.unwrap();

        assert_eq!(scheduler.cancel_task(task.id).await.unwrap(), TaskStatus::Canceled);
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert_eq!(ctx.db.require_document(doc.id).unwrap().status, DocumentStatus::Pending);
    }
}
