//! # dispatcher：调用调度与响应解析
//!
//! ## 核心意图（Why）
//! - 把缓冲中取出的 [`InvocationContext`] 转换为 `InvocationRequest` 发往 Worker，
//!   并按调用 ID 追踪在途调用，直到响应、失败或取消恰好完成一次；
//! - 缓存函数级失败（加载失败、元数据索引失败），后续调用直接短路，不再访问 Worker。
//!
//! ## 行为契约（What）
//! - `send_invocation_request` 依次执行：缓存失败短路 → 已取消短路 → 构造请求并登记在途表 →
//!   挂接取消转发（Worker 支持时）→ 发送；
//! - `on_invocation_response` 从在途表移除调用，成功时解析输出（含共享内存负载），
//!   失败时保留远端消息与堆栈；随后释放宿主为该调用分配的区域，并请求 Worker 释放其输出区域；
//! - 调用级失败只影响该调用自身的结果 Future；
//! - 在途表中同一调用 ID 任意时刻至多出现一次。
//!
//! ## 注意事项（Trade-offs）
//! - 取消是协作式的：仅在 Worker 通告 `HandlesInvocationCancelMessage` 时发送取消消息，
//!   否则等待 Worker 自行完成；
//! - 调用协议超时默认关闭，配置后超时调用以 [`WorkerError::PendingTimeout`] 失败。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, trace, warn};

use crate::capability::{CapabilitySet, names};
use crate::config::SharedMemoryOptions;
use crate::error::{Result, WorkerError};
use crate::invocation::{ExecutingInvocation, InvocationContext, InvocationResult, InvocationResultFuture};
use crate::message::{
    BindingData, CloseSharedMemoryResourcesRequest, InvocationCancel, InvocationRequest,
    InvocationResponse, LogLevel, Message, ParameterBinding, RpcException, RpcLog, Status,
};
use crate::shared_memory::SharedMemoryManager;
use crate::transport::OutboundWriter;

/// 调用未经响应离开在途表时的回调。
pub type RetiredHook = Box<dyn Fn(&str) + Send + Sync>;

/// 调用调度器。
pub struct InvocationDispatcher {
    worker_id: Arc<str>,
    writer: OutboundWriter,
    capabilities: Arc<CapabilitySet>,
    shared_memory: Option<Arc<SharedMemoryManager>>,
    shared_memory_options: SharedMemoryOptions,
    invocation_timeout: Option<Duration>,
    executing: DashMap<String, ExecutingInvocation>,
    load_errors: DashMap<String, WorkerError>,
    metadata_errors: DashMap<String, WorkerError>,
    cancel_capability: OnceLock<bool>,
    retired: OnceLock<RetiredHook>,
    this: Weak<InvocationDispatcher>,
}

impl std::fmt::Debug for InvocationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationDispatcher")
            .field("worker_id", &self.worker_id)
            .field("executing", &self.executing.len())
            .field("load_errors", &self.load_errors.len())
            .field("metadata_errors", &self.metadata_errors.len())
            .finish_non_exhaustive()
    }
}

impl InvocationDispatcher {
    pub fn new(
        worker_id: impl Into<Arc<str>>,
        writer: OutboundWriter,
        capabilities: Arc<CapabilitySet>,
        shared_memory: Option<Arc<SharedMemoryManager>>,
        shared_memory_options: SharedMemoryOptions,
        invocation_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let worker_id = worker_id.into();
        Arc::new_cyclic(|this| Self {
            worker_id,
            writer,
            capabilities,
            shared_memory,
            shared_memory_options,
            invocation_timeout,
            executing: DashMap::new(),
            load_errors: DashMap::new(),
            metadata_errors: DashMap::new(),
            cancel_capability: OnceLock::new(),
            retired: OnceLock::new(),
            this: this.clone(),
        })
    }

    /// 注册退出钩子：调用因超时、发送失败或批量失败离开在途表时触发，响应路径不触发。
    ///
    /// 只接受首次注册，返回是否注册成功。
    pub fn on_retired<F>(&self, hook: F) -> bool
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.retired.set(Box::new(hook)).is_ok()
    }

    fn retire(&self, invocation_id: &str) {
        if let Some(hook) = self.retired.get() {
            hook(invocation_id);
        }
    }

    /// 缓存函数加载失败。
    pub fn record_load_error(&self, function_id: &str, error: WorkerError) {
        self.load_errors.insert(function_id.to_owned(), error);
    }

    /// 缓存元数据索引失败。
    pub fn record_metadata_error(&self, function_id: &str, error: WorkerError) {
        self.metadata_errors.insert(function_id.to_owned(), error);
    }

    pub fn clear_metadata_errors(&self) {
        self.metadata_errors.clear();
    }

    /// 函数的缓存失败；加载失败优先于元数据失败。
    pub fn cached_failure(&self, function_id: &str) -> Option<WorkerError> {
        self.load_errors
            .get(function_id)
            .map(|entry| entry.value().clone())
            .or_else(|| {
                self.metadata_errors
                    .get(function_id)
                    .map(|entry| entry.value().clone())
            })
    }

    pub fn is_executing(&self, invocation_id: &str) -> bool {
        self.executing.contains_key(invocation_id)
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn executing_ids(&self) -> Vec<String> {
        self.executing.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 取消能力在首次判定时锁定。
    pub fn cancel_capability_enabled(&self) -> bool {
        *self.cancel_capability.get_or_init(|| {
            self.capabilities
                .is_enabled(names::HANDLES_INVOCATION_CANCEL_MESSAGE)
        })
    }

    /// 共享内存传输是否可用：宿主开关 + Worker 能力 + 管理器存在。
    pub fn shared_memory_enabled(&self) -> bool {
        self.shared_memory.is_some()
            && self.shared_memory_options.enabled
            && self
                .capabilities
                .is_enabled(names::SHARED_MEMORY_DATA_TRANSFER)
    }

    /// 把调用上下文发送给 Worker。
    pub async fn send_invocation_request(&self, context: InvocationContext) {
        let invocation_id = context.invocation_id.clone();

        if let Some(cached) = self.cached_failure(&context.function_id) {
            debug!(
                worker_id = %self.worker_id,
                %invocation_id,
                function = %context.function_name,
                code = cached.code(),
                "function has a cached failure; invocation not sent"
            );
            context.fail(cached);
            return;
        }

        if context.cancellation.is_cancelled() {
            warn!(
                worker_id = %self.worker_id,
                %invocation_id,
                "cancellation has been requested; invocation request will not be sent"
            );
            context.cancel_result();
            return;
        }

        // 重复 ID 必须在写入共享内存之前拒绝，区域按调用 ID 归属。
        let request = match self.executing.entry(invocation_id.clone()) {
            Entry::Occupied(_) => {
                let duplicate = WorkerError::Internal {
                    detail: format!("invocation `{invocation_id}` is already executing"),
                };
                context.fail(duplicate);
                return;
            }
            Entry::Vacant(slot) => {
                let request = self.build_request(&context);
                let mut record = ExecutingInvocation::new(context);
                if self.cancel_capability_enabled() {
                    record.attach_watcher(self.spawn_cancel_forwarder(&record.context));
                }
                if let Some(timeout) = self.invocation_timeout {
                    record.attach_watcher(self.spawn_invocation_timer(&invocation_id, timeout));
                }
                slot.insert(record);
                request
            }
        };

        trace!(worker_id = %self.worker_id, %invocation_id, "sending invocation request");
        if let Err(err) = self.writer.send(Message::InvocationRequest(request)).await {
            self.release_host_regions(&invocation_id);
            if let Some((_, record)) = self.executing.remove(&invocation_id) {
                self.retire(&invocation_id);
                record.context.fail(err);
            }
        }
    }

    fn build_request(&self, context: &InvocationContext) -> InvocationRequest {
        let shared_memory = self
            .shared_memory
            .as_ref()
            .filter(|_| self.shared_memory_enabled());
        let input_data = context
            .inputs
            .iter()
            .map(|(name, value)| {
                let eligible = shared_memory.filter(|_| {
                    SharedMemoryManager::is_supported(value)
                        && value.transferable_len().is_some_and(|len| {
                            self.shared_memory_options.is_eligible_size(len as u64)
                        })
                });
                if let Some(manager) = eligible {
                    match manager.put_for_invocation(&context.invocation_id, value) {
                        Ok(reference) => return ParameterBinding::shared_memory(name, reference),
                        Err(err) => debug!(
                            invocation_id = %context.invocation_id,
                            binding = %name,
                            error = %err,
                            "shared memory transfer failed; sending inline"
                        ),
                    }
                }
                ParameterBinding::inline(name, value.clone())
            })
            .collect();
        InvocationRequest {
            invocation_id: context.invocation_id.clone(),
            function_id: context.function_id.clone(),
            input_data,
            trigger_metadata: context.trigger_metadata.clone(),
            trace_attributes: context.trace_attributes.clone(),
        }
    }

    fn spawn_cancel_forwarder(&self, context: &InvocationContext) -> tokio::task::AbortHandle {
        let cancellation = context.cancellation.clone();
        let writer = self.writer.clone();
        let invocation_id = context.invocation_id.clone();
        tokio::spawn(async move {
            cancellation.cancelled().await;
            debug!(%invocation_id, "forwarding invocation cancel to worker");
            writer.send_and_forget(Message::InvocationCancel(InvocationCancel { invocation_id }));
        })
        .abort_handle()
    }

    fn spawn_invocation_timer(&self, invocation_id: &str, timeout: Duration) -> tokio::task::AbortHandle {
        let this = self.this.clone();
        let invocation_id = invocation_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.expire(&invocation_id, timeout);
            }
        })
        .abort_handle()
    }

    /// 调用超时：移出在途表、失败结果，并在支持时通知 Worker 取消。
    fn expire(&self, invocation_id: &str, timeout: Duration) {
        let Some((_, record)) = self.executing.remove(invocation_id) else {
            return;
        };
        warn!(worker_id = %self.worker_id, invocation_id, ?timeout, "invocation timed out");
        self.retire(invocation_id);
        if self.cancel_capability_enabled() {
            self.writer
                .send_and_forget(Message::InvocationCancel(InvocationCancel {
                    invocation_id: invocation_id.to_owned(),
                }));
        }
        self.release_host_regions(invocation_id);
        record
            .context
            .fail(WorkerError::pending_timeout(format!("InvocationRequest {invocation_id}"), timeout));
    }

    /// 处理调用响应。
    pub async fn on_invocation_response(&self, response: InvocationResponse) {
        let invocation_id = response.invocation_id.clone();
        let Some((_, record)) = self.executing.remove(&invocation_id) else {
            debug!(worker_id = %self.worker_id, %invocation_id, "response for an invocation that is not executing");
            return;
        };
        trace!(
            worker_id = %self.worker_id,
            %invocation_id,
            elapsed = ?record.started_at.elapsed(),
            "invocation response received"
        );

        match response.result.status {
            Status::Success => {
                let outcome = self.decode_outputs(&response);
                record.context.result_source().try_complete(outcome);
            }
            Status::Cancelled => {
                record.context.cancel_result();
            }
            Status::Failure => {
                let exception = response
                    .result
                    .exception
                    .clone()
                    .unwrap_or_else(|| RpcException::new(WorkerError::describe_remote(None)));
                if exception.is_user_exception
                    && self.capabilities.is_enabled(names::ENABLE_USER_CODE_EXCEPTION)
                {
                    info!(%invocation_id, function = %record.context.function_name, "user code exception: {}", exception.message);
                }
                record.context.fail(WorkerError::Invocation {
                    invocation_id: invocation_id.clone(),
                    exception,
                });
            }
        }

        self.release_host_regions(&invocation_id);
        let output_maps: Vec<String> = response
            .output_data
            .iter()
            .filter_map(|binding| binding.shared_memory_name().map(str::to_owned))
            .collect();
        if !output_maps.is_empty() {
            debug!(%invocation_id, regions = output_maps.len(), "asking worker to close shared memory outputs");
            self.writer
                .send_and_forget(Message::CloseSharedMemoryResourcesRequest(
                    CloseSharedMemoryResourcesRequest {
                        map_names: output_maps,
                    },
                ));
        }
    }

    fn decode_outputs(&self, response: &InvocationResponse) -> Result<InvocationResult> {
        let mut outputs = BTreeMap::new();
        for binding in &response.output_data {
            let value = match &binding.data {
                BindingData::Inline(value) => value.clone(),
                BindingData::SharedMemory(reference) => match &self.shared_memory {
                    Some(manager) => manager.resolve_output(reference)?,
                    None => {
                        return Err(WorkerError::shared_memory(
                            &reference.name,
                            "worker returned shared memory output but transfer is disabled",
                        ));
                    }
                },
            };
            outputs.insert(binding.name.clone(), value);
        }
        Ok(InvocationResult {
            outputs,
            return_value: response.return_value.clone(),
        })
    }

    fn release_host_regions(&self, invocation_id: &str) {
        if let Some(manager) = &self.shared_memory
            && !manager.try_free_for_invocation(invocation_id)
        {
            warn!(invocation_id, "cannot free all shared memory resources for invocation");
        }
    }

    /// 把用户日志转交给调用的日志接收器；调用不在执行中时返回 `false`。
    pub fn relay_user_log(&self, log: &RpcLog) -> bool {
        let Some(invocation_id) = log.invocation_id.as_deref() else {
            return false;
        };
        let Some(record) = self.executing.get(invocation_id) else {
            return false;
        };
        let context = &record.context;
        match &context.log_sink {
            Some(sink) => sink.log(invocation_id, log),
            None => emit_user_log(invocation_id, &context.function_name, log),
        }
        true
    }

    /// 以同一错误失败全部在途调用；返回是否有调用被失败。
    pub fn try_fail_executions(&self, error: &WorkerError) -> bool {
        let ids = self.executing_ids();
        let mut failed = 0usize;
        for invocation_id in ids {
            if let Some((_, record)) = self.executing.remove(&invocation_id) {
                self.release_host_regions(&invocation_id);
                self.retire(&invocation_id);
                if record.context.fail(error.clone()) {
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            error!(worker_id = %self.worker_id, failed, code = error.code(), "failed in-flight invocations");
        }
        failed > 0
    }

    /// 等待当前登记的全部在途调用完成。
    pub async fn drain(&self) {
        let pending: Vec<InvocationResultFuture> = self
            .executing
            .iter()
            .map(|entry| entry.value().result_source().subscribe())
            .collect();
        debug!(worker_id = %self.worker_id, pending = pending.len(), "draining invocations");
        for future in pending {
            let _ = future.wait().await;
        }
    }
}

fn emit_user_log(invocation_id: &str, function: &str, log: &RpcLog) {
    let message = log.message.as_str();
    match log.level {
        LogLevel::Trace => trace!(target: "spark_worker::user", invocation_id, function, "{message}"),
        LogLevel::Debug => debug!(target: "spark_worker::user", invocation_id, function, "{message}"),
        LogLevel::Information => info!(target: "spark_worker::user", invocation_id, function, "{message}"),
        LogLevel::Warning => warn!(target: "spark_worker::user", invocation_id, function, "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            error!(target: "spark_worker::user", invocation_id, function, "{message}")
        }
        LogLevel::None => {}
    }
}
