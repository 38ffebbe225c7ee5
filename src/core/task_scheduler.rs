//! 任务调度：工具并发池
//!
//! 同一轮内的多个工具调用并行执行，用 Semaphore 限制并发；结果按提交顺序返回。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 默认工具并发上限
pub const DEFAULT_TOOL_WORKERS: usize = 8;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 为一批待执行调用建池：许可数 = min(上限, 待执行数)
    pub fn for_batch(max_workers: usize, pending: usize) -> Self {
        Self::new(max_workers.min(pending))
    }

    /// 获取工具执行许可；信号量从不关闭，None 仅在关闭后出现
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        self.tool_semaphore.clone().acquire_owned().await.ok()
    }

    /// 受限并发执行一批 future，按输入顺序返回结果
    pub async fn run_all<I, F, T>(&self, futures: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        join_all(futures.into_iter().map(|fut| async move {
            let _permit = self.acquire_tool().await;
            fut.await
        }))
        .await
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_WORKERS)
    }
}
