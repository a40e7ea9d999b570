//! # buffer：按函数划分的调用输入缓冲
//!
//! ## 核心意图（Why）
//! - 触发层产生的调用上下文应当立刻入队，而不必等待函数加载完成；
//! - 加载应答到达后再把缓冲"接线"到消费任务，由消费任务依序交给调度器。
//!
//! ## 行为契约（What）
//! - 每个函数 ID 恰有一个缓冲，容量由配置决定（`None` 表示无界）；
//! - [`InvocationBufferManager::link`] 对同一函数只生效一次；
//! - 消费任务逐个 `await` 调度器，保持同一函数内的提交顺序；
//! - [`InvocationBufferManager::shutdown`] 之后，所有尚未交付的上下文都以给定错误完成，
//!   不会出现"调用方永远等不到结果"的情况。

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancellation::Cancellation;
use crate::error::{Result, WorkerError};
use crate::invocation::InvocationContext;

enum BufferSender {
    Bounded(mpsc::Sender<InvocationContext>),
    Unbounded(mpsc::UnboundedSender<InvocationContext>),
}

enum BufferReceiver {
    Bounded(mpsc::Receiver<InvocationContext>),
    Unbounded(mpsc::UnboundedReceiver<InvocationContext>),
}

impl BufferReceiver {
    async fn recv(&mut self) -> Option<InvocationContext> {
        match self {
            BufferReceiver::Bounded(rx) => rx.recv().await,
            BufferReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            BufferReceiver::Bounded(rx) => rx.close(),
            BufferReceiver::Unbounded(rx) => rx.close(),
        }
    }

    fn try_recv(&mut self) -> Option<InvocationContext> {
        match self {
            BufferReceiver::Bounded(rx) => rx.try_recv().ok(),
            BufferReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// 关闭并以 `error` 完成所有残留上下文，返回数量。
    fn fail_remaining(&mut self, error: &WorkerError) -> usize {
        self.close();
        let mut failed = 0;
        while let Some(context) = self.try_recv() {
            context.fail(error.clone());
            failed += 1;
        }
        failed
    }
}

/// 单个函数的输入缓冲。
pub struct FunctionInputBuffer {
    function_id: String,
    tx: BufferSender,
    rx: Mutex<Option<BufferReceiver>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl FunctionInputBuffer {
    fn new(function_id: String, capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (BufferSender::Bounded(tx), BufferReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (BufferSender::Unbounded(tx), BufferReceiver::Unbounded(rx))
            }
        };
        Self {
            function_id,
            tx,
            rx: Mutex::new(Some(rx)),
            consumer: Mutex::new(None),
        }
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// 是否已接到消费任务。
    pub fn is_linked(&self) -> bool {
        self.rx.lock().is_none()
    }

    /// 入队；有界缓冲满时等待容量。
    async fn post(&self, context: InvocationContext) -> std::result::Result<(), InvocationContext> {
        match &self.tx {
            BufferSender::Bounded(tx) => tx.send(context).await.map_err(|err| err.0),
            BufferSender::Unbounded(tx) => tx.send(context).map_err(|err| err.0),
        }
    }
}

/// 调用缓冲管理器。
pub struct InvocationBufferManager {
    worker_id: Arc<str>,
    capacity: Option<usize>,
    buffers: DashMap<String, Arc<FunctionInputBuffer>>,
    shutdown: Cancellation,
    shutdown_error: Arc<Mutex<Option<WorkerError>>>,
}

impl InvocationBufferManager {
    pub fn new(worker_id: impl Into<Arc<str>>, capacity: Option<usize>) -> Self {
        Self {
            worker_id: worker_id.into(),
            capacity,
            buffers: DashMap::new(),
            shutdown: Cancellation::new(),
            shutdown_error: Arc::new(Mutex::new(None)),
        }
    }

    /// 为给定函数创建缓冲；已存在的缓冲保持不变。返回新建数量。
    pub fn setup<I, S>(&self, function_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut created = 0;
        for function_id in function_ids {
            let function_id = function_id.into();
            self.buffers.entry(function_id.clone()).or_insert_with(|| {
                created += 1;
                Arc::new(FunctionInputBuffer::new(function_id, self.capacity))
            });
        }
        debug!(worker_id = %self.worker_id, created, total = self.buffers.len(), "function input buffers ready");
        created
    }

    pub fn contains(&self, function_id: &str) -> bool {
        self.buffers.contains_key(function_id)
    }

    pub fn is_linked(&self, function_id: &str) -> bool {
        self.buffers
            .get(function_id)
            .is_some_and(|buffer| buffer.is_linked())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// 把上下文投递到其函数缓冲。
    ///
    /// 缓冲不存在或已关闭时，上下文以错误完成并同时返回该错误。
    pub async fn push(&self, context: InvocationContext) -> Result<()> {
        let buffer = self
            .buffers
            .get(&context.function_id)
            .map(|entry| Arc::clone(entry.value()));
        let Some(buffer) = buffer else {
            let error = WorkerError::Internal {
                detail: format!(
                    "no input buffer registered for function `{}`",
                    context.function_id
                ),
            };
            context.fail(error.clone());
            return Err(error);
        };
        if self.shutdown.is_cancelled() {
            let error = self.shutdown_cause();
            context.fail(error.clone());
            return Err(error);
        }
        if let Err(context) = buffer.post(context).await {
            let error = self.shutdown_cause();
            context.fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// 把函数缓冲接到消费任务；仅首次调用生效。
    pub fn link<F, Fut>(&self, function_id: &str, consumer: F) -> bool
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(buffer) = self
            .buffers
            .get(function_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            warn!(worker_id = %self.worker_id, function_id, "cannot link unknown function buffer");
            return false;
        };
        let Some(mut rx) = buffer.rx.lock().take() else {
            return false;
        };
        let shutdown = self.shutdown.clone();
        let shutdown_error = Arc::clone(&self.shutdown_error);
        let worker_id = Arc::clone(&self.worker_id);
        let function_id = function_id.to_owned();
        let task_function_id = function_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(context) => consumer(context).await,
                        None => return,
                    },
                }
            }
            let error = shutdown_error
                .lock()
                .clone()
                .unwrap_or_else(|| WorkerError::Disposed {
                    worker_id: worker_id.to_string(),
                });
            let failed = rx.fail_remaining(&error);
            if failed > 0 {
                debug!(worker_id = %worker_id, function_id = %task_function_id, failed, "failed buffered invocations on shutdown");
            }
        });
        *buffer.consumer.lock() = Some(handle);
        debug!(worker_id = %self.worker_id, %function_id, "function input buffer linked");
        true
    }

    /// 停止所有消费任务，并以 `error` 完成尚未交付的上下文。
    pub fn shutdown(&self, error: WorkerError) {
        {
            let mut slot = self.shutdown_error.lock();
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
        self.shutdown.cancel();
        for entry in self.buffers.iter() {
            if let Some(mut rx) = entry.value().rx.lock().take() {
                rx.fail_remaining(&error);
            }
        }
    }

    /// 等待所有消费任务退出。
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .buffers
            .iter()
            .filter_map(|entry| entry.value().consumer.lock().take())
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn shutdown_cause(&self) -> WorkerError {
        self.shutdown_error
            .lock()
            .clone()
            .unwrap_or_else(|| WorkerError::Disposed {
                worker_id: self.worker_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(function_id: &str, id: &str) -> (InvocationContext, crate::invocation::InvocationResultFuture) {
        let (context, future) = InvocationContext::new(function_id, function_id);
        (context.with_invocation_id(id), future)
    }

    #[tokio::test]
    async fn contexts_wait_until_buffer_is_linked() {
        let manager = InvocationBufferManager::new("w-1", None);
        assert_eq!(manager.setup(["f-1"]), 1);
        assert_eq!(manager.setup(["f-1"]), 0);

        let (first, _f1) = context("f-1", "a");
        let (second, _f2) = context("f-1", "b");
        manager.push(first).await.expect("push");
        manager.push(second).await.expect("push");

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        assert!(manager.link("f-1", move |ctx: InvocationContext| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(ctx.invocation_id.clone());
            }
        }));
        assert!(manager.is_linked("f-1"));
        assert!(!manager.link("f-1", |_ctx: InvocationContext| async {}));

        assert_eq!(seen_rx.recv().await.as_deref(), Some("a"));
        assert_eq!(seen_rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unknown_function_fails_the_context() {
        let manager = InvocationBufferManager::new("w-1", Some(4));
        let (ctx, future) = context("missing", "a");
        assert!(manager.push(ctx).await.is_err());
        assert!(future.wait().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_fails_unlinked_and_linked_backlogs() {
        let manager = InvocationBufferManager::new("w-1", Some(8));
        manager.setup(["idle", "busy"]);
        let (idle, idle_future) = context("idle", "a");
        manager.push(idle).await.expect("push");

        let gate = Arc::new(tokio::sync::Notify::new());
        let consumer_gate = Arc::clone(&gate);
        manager.link("busy", move |_ctx: InvocationContext| {
            let gate = Arc::clone(&consumer_gate);
            async move { gate.notified().await }
        });
        let (blocking, _blocking_future) = context("busy", "b");
        let (queued, queued_future) = context("busy", "c");
        manager.push(blocking).await.expect("push");
        manager.push(queued).await.expect("push");
        tokio::task::yield_now().await;

        let cause = WorkerError::ChannelFatal {
            worker_id: "w-1".into(),
            detail: "process exited".into(),
        };
        manager.shutdown(cause.clone());
        gate.notify_one();

        assert_eq!(idle_future.wait().await, Err(cause.clone()));
        let queued = tokio::time::timeout(Duration::from_secs(1), queued_future.wait())
            .await
            .expect("queued context must resolve");
        assert_eq!(queued, Err(cause.clone()));

        let (late, late_future) = context("busy", "d");
        assert_eq!(manager.push(late).await, Err(cause.clone()));
        assert_eq!(late_future.wait().await, Err(cause));
        manager.join().await;
    }
}
