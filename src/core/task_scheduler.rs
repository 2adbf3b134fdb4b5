//! 任务调度：每次流水线运行一个后台任务
//!
//! 后台运行受 Semaphore 限制并发；前台调用（确认、选图等检查点操作）直接 await，不经过调度器。
//! 新请求与检查点续跑各有一组许可，大量新请求排队时已确认的检查点仍能继续。

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 路由 + 起草
    Start,
    /// 从检查点继续（画师 / 导演）
    Resume,
}

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 任务调度器
#[derive(Clone)]
pub struct TaskScheduler {
    /// 新请求的并发限制
    start_permits: Arc<Semaphore>,
    /// 检查点续跑的并发限制
    resume_permits: Arc<Semaphore>,
    /// 已提交未结束的任务数
    active: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskScheduler {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            start_permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            resume_permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn permits(&self, kind: TaskKind) -> &Arc<Semaphore> {
        match kind {
            TaskKind::Start => &self.start_permits,
            TaskKind::Resume => &self.resume_permits,
        }
    }

    /// 在后台运行一个流水线任务；超出该类任务的并发上限时排队等待许可
    pub fn spawn<F, T>(&self, kind: TaskKind, fut: F) -> (TaskId, JoinHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId::new();
        let semaphore = self.permits(kind).clone();
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            // 信号量不会被关闭；万一关闭也照常运行
            let _permit = semaphore.acquire_owned().await.ok();
            tracing::debug!(task = ?id, kind = ?kind, "pipeline task started");
            fut.await
        });
        (id, handle)
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn available_permits(&self, kind: TaskKind) -> usize {
        self.permits(kind).available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_returns_output() {
        let scheduler = TaskScheduler::new(2);
        let (_, handle) = scheduler.spawn(TaskKind::Start, async { 21 * 2 });
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let scheduler = TaskScheduler::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let running = running.clone();
            let peak = peak.clone();
            let (_, h) = scheduler.spawn(TaskKind::Resume, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
            handles.push(h);
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_not_blocked_by_queued_starts() {
        let scheduler = TaskScheduler::new(1);
        let (_, stuck) = scheduler.spawn(TaskKind::Start, std::future::pending::<()>());
        let (_, queued) = scheduler.spawn(TaskKind::Start, async {});
        tokio::task::yield_now().await;
        assert_eq!(scheduler.available_permits(TaskKind::Start), 0);
        assert_eq!(scheduler.available_permits(TaskKind::Resume), 1);

        let (_, resumed) = scheduler.spawn(TaskKind::Resume, async { "resumed" });
        let out = tokio::time::timeout(Duration::from_secs(1), resumed)
            .await
            .expect("resume waited behind start tasks")
            .unwrap();
        assert_eq!(out, "resumed");
        assert!(!queued.is_finished());

        stuck.abort();
        queued.await.unwrap();
        assert_eq!(scheduler.active_tasks(), 0);
    }
}
