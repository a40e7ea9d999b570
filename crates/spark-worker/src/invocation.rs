//! # invocation：调用上下文与结果 Future
//!
//! ## 核心意图（Why）
//! - 触发层为每次函数执行构造一个 [`InvocationContext`]，并持有与之配对的 [`InvocationResultFuture`]；
//! - 结果源只能被完成一次：响应、缓存失败、取消、批量失败与调用超时之间以先到者为准。
//!
//! ## 行为契约（What）
//! - [`ResultSource::try_complete`] 返回 `true` 表示本次调用赢得完成权；
//! - 结果 Future 可克隆，`drain` 与调用方可以同时等待同一结果；
//! - 取消以 [`WorkerError::Cancelled`] 表达，其分类为 `Cancelled`，调用方应视为非失败。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::cancellation::Cancellation;
use crate::error::{Result, WorkerError};
use crate::message::{RpcLog, TypedData};

/// 调用级日志接收器，承接 Worker 发出的用户日志。
pub trait InvocationLogSink: Send + Sync + 'static {
    fn log(&self, invocation_id: &str, log: &RpcLog);
}

/// 成功调用的输出。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationResult {
    /// 按绑定名称索引的输出值，共享内存负载已被解析为进程内值。
    pub outputs: BTreeMap<String, TypedData>,
    pub return_value: Option<TypedData>,
}

type Slot = Option<Result<InvocationResult>>;

/// 一次性结果源。
#[derive(Clone, Debug)]
pub struct ResultSource {
    tx: Arc<watch::Sender<Slot>>,
}

impl ResultSource {
    /// 创建结果源及其等待端。
    pub fn channel() -> (Self, InvocationResultFuture) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, InvocationResultFuture { rx })
    }

    /// 尝试写入结果；已完成时返回 `false` 且不覆盖旧值。
    pub fn try_complete(&self, result: Result<InvocationResult>) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// 派生一个新的等待端。
    pub fn subscribe(&self) -> InvocationResultFuture {
        InvocationResultFuture {
            rx: self.tx.subscribe(),
        }
    }
}

/// 调用结果的等待端。
#[derive(Clone, Debug)]
pub struct InvocationResultFuture {
    rx: watch::Receiver<Slot>,
}

impl InvocationResultFuture {
    /// 等待调用完成。
    ///
    /// 若结果源在未完成时被整体丢弃（例如通道释放时缓冲中的上下文被回收），返回内部错误。
    pub async fn wait(mut self) -> Result<InvocationResult> {
        let settled: Slot = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(Self::abandoned()))
    }

    /// 非阻塞读取当前结果。
    pub fn try_result(&self) -> Option<Result<InvocationResult>> {
        self.rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.rx.borrow().is_some()
    }

    fn abandoned() -> WorkerError {
        WorkerError::Internal {
            detail: "invocation result source dropped before completion".to_owned(),
        }
    }
}

/// 触发层产生的调用上下文。
pub struct InvocationContext {
    pub invocation_id: String,
    pub function_id: String,
    pub function_name: String,
    /// 按声明顺序排列的输入绑定。
    pub inputs: Vec<(String, TypedData)>,
    pub trigger_metadata: BTreeMap<String, TypedData>,
    pub trace_attributes: BTreeMap<String, String>,
    pub cancellation: Cancellation,
    pub log_sink: Option<Arc<dyn InvocationLogSink>>,
    result: ResultSource,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("function_id", &self.function_id)
            .field("function_name", &self.function_name)
            .field("inputs", &self.inputs.len())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    /// 创建调用上下文，调用 ID 默认使用随机 UUID。
    pub fn new(
        function_id: impl Into<String>,
        function_name: impl Into<String>,
    ) -> (Self, InvocationResultFuture) {
        let (result, future) = ResultSource::channel();
        let context = Self {
            invocation_id: Uuid::new_v4().to_string(),
            function_id: function_id.into(),
            function_name: function_name.into(),
            inputs: Vec::new(),
            trigger_metadata: BTreeMap::new(),
            trace_attributes: BTreeMap::new(),
            cancellation: Cancellation::new(),
            log_sink: None,
            result,
        };
        (context, future)
    }

    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = invocation_id.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: TypedData) -> Self {
        self.inputs.push((name.into(), value));
        self
    }

    pub fn with_trigger_metadata(mut self, key: impl Into<String>, value: TypedData) -> Self {
        self.trigger_metadata.insert(key.into(), value);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn InvocationLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn result_source(&self) -> &ResultSource {
        &self.result
    }

    /// 以错误完成；返回是否赢得完成权。
    pub fn fail(&self, error: WorkerError) -> bool {
        self.result.try_complete(Err(error))
    }

    /// 以取消完成。
    pub fn cancel_result(&self) -> bool {
        self.result.try_complete(Err(WorkerError::Cancelled {
            invocation_id: self.invocation_id.clone(),
        }))
    }
}

/// 在途调用记录：请求发出时创建，恰好移除一次。
#[derive(Debug)]
pub struct ExecutingInvocation {
    pub context: InvocationContext,
    pub started_at: Instant,
    watchers: Vec<AbortHandle>,
}

impl ExecutingInvocation {
    pub fn new(context: InvocationContext) -> Self {
        Self {
            context,
            started_at: Instant::now(),
            watchers: Vec::new(),
        }
    }

    /// 挂接随调用结束而终止的后台任务（取消转发、调用超时）。
    pub fn attach_watcher(&mut self, handle: AbortHandle) {
        self.watchers.push(handle);
    }

    pub fn invocation_id(&self) -> &str {
        &self.context.invocation_id
    }

    pub fn function_id(&self) -> &str {
        &self.context.function_id
    }

    pub fn result_source(&self) -> &ResultSource {
        self.context.result_source()
    }
}

impl Drop for ExecutingInvocation {
    fn drop(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[tokio::test]
    async fn result_source_completes_once() {
        let (context, future) = InvocationContext::new("f-1", "Foo");
        let observer = future.clone();
        let first = InvocationResult {
            return_value: Some(TypedData::Int(1)),
            ..InvocationResult::default()
        };
        assert!(context.result_source().try_complete(Ok(first.clone())));
        assert!(!context.fail(WorkerError::TransportClosed));
        assert!(!context.cancel_result());

        assert_eq!(future.wait().await, Ok(first.clone()));
        assert_eq!(observer.try_result(), Some(Ok(first)));
    }

    #[tokio::test]
    async fn cancellation_is_reported_with_cancelled_category() {
        let (context, future) = InvocationContext::new("f-1", "Foo");
        let context = context.with_invocation_id("inv-1");
        assert!(context.cancel_result());
        let err = future.wait().await.expect_err("cancelled");
        assert_eq!(err.category(), ErrorCategory::Cancelled);
        assert_eq!(
            err,
            WorkerError::Cancelled {
                invocation_id: "inv-1".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_context_resolves_waiters() {
        let (context, future) = InvocationContext::new("f-1", "Foo");
        drop(context);
        let err = future.wait().await.expect_err("abandoned");
        assert_eq!(err.code(), "spark.worker.internal");
    }

    #[tokio::test]
    async fn executing_record_aborts_watchers_on_drop() {
        let (context, _future) = InvocationContext::new("f-1", "Foo");
        let mut record = ExecutingInvocation::new(context);
        let watcher = tokio::spawn(std::future::pending::<()>());
        record.attach_watcher(watcher.abort_handle());
        drop(record);
        let joined = watcher.await;
        assert!(joined.is_err_and(|err| err.is_cancelled()));
    }

    #[test]
    fn builder_fills_context_fields() {
        let (context, _future) = InvocationContext::new("f-1", "Foo");
        let context = context
            .with_input("req", TypedData::String("hi".into()))
            .with_trigger_metadata("sys", TypedData::Json("{}".into()));
        assert_eq!(context.inputs.len(), 1);
        assert!(context.trigger_metadata.contains_key("sys"));
        assert!(Uuid::parse_str(&context.invocation_id).is_ok());
    }
}
