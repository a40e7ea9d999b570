//! # channel：单个语言 Worker 的 RPC 通道
//!
//! ## 核心意图（Why）
//! - 把传输、能力表、挂起应答注册表、调用缓冲、调度器与排序单元组合在一起，
//!   对宿主暴露一个 Worker 的完整生命周期：启动握手、函数索引与加载、调用、环境重载、状态探测与释放；
//! - 握手与管理类失败向就绪 Future 与 [`ChannelObserver`] 传播，调用级失败只影响单次调用。
//!
//! ## 行为契约（What）
//! - 单一读循环按接收顺序做路由决策，随后把消息提交到受信号量约束的处理池；
//! - `StartStream` 挂起项在读循环启动之前注册，Worker 的第一条消息不会错过；
//! - 状态位只增不减，[`WorkerChannel::shutdown`] 幂等；
//! - 读循环结束（流关闭或出错）后通道通知观察者注销自身，不再有新的分发。
//!
//! ## 注意事项（Trade-offs）
//! - 挂起项回调在处理池内同步执行，发送一律走 `send_and_forget`，回调不会阻塞；
//! - 元数据请求在一个索引周期内至多发送一次，所有调用方共享同一结果；环境重载开启新周期。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::buffer::InvocationBufferManager;
use crate::capability::{CapabilitySet, CapabilityUpdateStrategy, names};
use crate::config::WorkerChannelOptions;
use crate::dispatcher::InvocationDispatcher;
use crate::error::{Result, WorkerError};
use crate::events::ChannelObserver;
use crate::function::{FunctionDescriptor, FunctionLoadOptions, RawFunctionMetadata};
use crate::invocation::InvocationContext;
use crate::message::{
    FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, FunctionLoadResponse,
    FunctionMetadataResponse, FunctionsMetadataRequest, LogLevel, Message, MessageKind, RpcLog,
    RpcLogCategory, WorkerInitRequest, WorkerInitResponse, WorkerMetadata, WorkerStatusRequest,
    WorkerTerminate, WorkerWarmupRequest, WorkerWarmupResponse,
};
use crate::pending::{FaultCallback, MessageCallback, PendingRegistry};
use crate::process::WorkerProcess;
use crate::sequencer::{InboundHandler, InvocationSequencer, Route};
use crate::shared_memory::{InMemoryDataCache, SharedMemoryManager};
use crate::state::{ChannelState, StateFlags};
use crate::status::{LatencyHistory, WorkerStatus};
use crate::transport::{ChannelTransport, InboundReader, OutboundWriter};

/// 环境重载时补齐的 Worker 目录变量名。
pub const WORKER_DIRECTORY_SETTING: &str = "FUNCTIONS_WORKER_DIRECTORY";
/// 环境重载时补齐的应用目录变量名。
pub const APPLICATION_DIRECTORY_SETTING: &str = "FUNCTIONS_APPLICATION_DIRECTORY";

type MetadataSlot = Option<Result<Vec<RawFunctionMetadata>>>;

/// 一个元数据索引周期：发送标志 + 共享结果。
struct MetadataCycle {
    sent: bool,
    result: Arc<watch::Sender<MetadataSlot>>,
}

impl MetadataCycle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            sent: false,
            result: Arc::new(tx),
        }
    }
}

fn complete_once<T>(slot: &watch::Sender<Option<T>>, value: T) -> bool {
    slot.send_if_modified(move |current| {
        if current.is_some() {
            return false;
        }
        *current = Some(value);
        true
    })
}

struct ChannelInner {
    worker_id: Arc<str>,
    options: WorkerChannelOptions,
    state: ChannelState,
    capabilities: Arc<CapabilitySet>,
    pending: PendingRegistry,
    writer: OutboundWriter,
    reader: Mutex<Option<InboundReader>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    process: Arc<dyn WorkerProcess>,
    observer: Arc<dyn ChannelObserver>,
    dispatcher: Arc<InvocationDispatcher>,
    buffers: InvocationBufferManager,
    sequencer: Arc<InvocationSequencer>,
    shared_memory: Option<Arc<SharedMemoryManager>>,
    processing: Arc<Semaphore>,
    functions: RwLock<Vec<FunctionDescriptor>>,
    readiness: watch::Sender<Option<Result<()>>>,
    metadata: Mutex<MetadataCycle>,
    status_requests: DashMap<String, oneshot::Sender<()>>,
    latency: LatencyHistory,
    worker_metadata: RwLock<Option<WorkerMetadata>>,
}

/// 单个语言 Worker 的 RPC 通道。
///
/// # 教案式说明
/// - **意图 (Why)**：宿主的其余部分只通过该类型与 Worker 交互，无需了解消息关联与排序细节；
/// - **契约 (What)**：
///   - [`start_worker_process`](Self::start_worker_process) 完成握手后返回，失败时返回握手错误；
///   - [`is_channel_ready_for_invocations`](Self::is_channel_ready_for_invocations) 要求握手与缓冲均已完成且未释放；
///   - [`submit_invocation`](Self::submit_invocation) 可在函数加载完成前调用，上下文会在缓冲中等待；
/// - **风险 (Trade-offs)**：通道可被克隆共享，内部状态以 `Arc` 持有；读循环持有一份引用，
///   流关闭或调用 [`shutdown`](Self::shutdown) 后释放。
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("worker_id", &self.inner.worker_id)
            .field("runtime", &self.inner.options.runtime)
            .field("state", &self.inner.state.load())
            .finish_non_exhaustive()
    }
}

impl WorkerChannel {
    /// 构造通道；配置非法时返回 [`WorkerError::Configuration`]。
    pub fn new(
        worker_id: impl Into<Arc<str>>,
        options: WorkerChannelOptions,
        transport: ChannelTransport,
        process: Arc<dyn WorkerProcess>,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<Self> {
        options.validate()?;
        let worker_id = worker_id.into();
        let ChannelTransport { writer, reader } = transport;
        let capabilities = Arc::new(CapabilitySet::new());

        let shared_memory = options.shared_memory.enabled.then(|| {
            let manager = SharedMemoryManager::new(options.shared_memory.directory.clone());
            let manager = if options.function_data_cache_enabled {
                manager.with_cache(Arc::new(InMemoryDataCache::with_capacity(
                    options.function_data_cache_max_bytes,
                )))
            } else {
                manager
            };
            Arc::new(manager)
        });

        let dispatcher = InvocationDispatcher::new(
            Arc::clone(&worker_id),
            writer.clone(),
            Arc::clone(&capabilities),
            shared_memory.clone(),
            options.shared_memory.clone(),
            options.invocation_timeout(),
        );
        let sequencer = Arc::new(InvocationSequencer::new());
        let units = Arc::clone(&sequencer);
        dispatcher.on_retired(move |invocation_id| {
            units.discard(invocation_id);
        });
        let (readiness, _rx) = watch::channel(None);

        let inner = ChannelInner {
            buffers: InvocationBufferManager::new(
                Arc::clone(&worker_id),
                options.function_buffer_capacity,
            ),
            processing: Arc::new(Semaphore::new(options.processing_concurrency)),
            latency: LatencyHistory::new(options.status_history_size),
            worker_id,
            state: ChannelState::new(),
            capabilities,
            pending: PendingRegistry::new(),
            writer,
            reader: Mutex::new(Some(reader)),
            reader_task: Mutex::new(None),
            process,
            observer,
            dispatcher,
            sequencer,
            shared_memory,
            functions: RwLock::new(Vec::new()),
            readiness,
            metadata: Mutex::new(MetadataCycle::new()),
            status_requests: DashMap::new(),
            worker_metadata: RwLock::new(None),
            options,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn options(&self) -> &WorkerChannelOptions {
        &self.inner.options
    }

    pub fn state(&self) -> StateFlags {
        self.inner.state.load()
    }

    /// 当前能力表快照。
    pub fn capabilities(&self) -> BTreeMap<String, String> {
        self.inner.capabilities.snapshot()
    }

    /// Worker 最近一次自报的运行时信息。
    pub fn worker_metadata(&self) -> Option<WorkerMetadata> {
        self.inner.worker_metadata.read().clone()
    }

    /// 启动 Worker 进程并等待握手完成。
    pub async fn start_worker_process(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state.is_disposing_or_disposed() {
            return Err(inner.disposed());
        }
        let start_stream = inner.pending.register_one(
            MessageKind::StartStream,
            Some(inner.options.process_startup_timeout()),
            inner.on_message(|inner, message| inner.send_worker_init_request(message)),
            inner.on_fault(|inner, err| {
                let err = inner.handshake_error("StartStream", err);
                error!(worker_id = %inner.worker_id, error = %err, "starting worker process failed");
                inner.publish_worker_error(err);
            }),
        );
        ChannelInner::spawn_reader(inner)?;

        debug!(worker_id = %inner.worker_id, runtime = %inner.options.runtime, "initiating worker process start up");
        if let Err(err) = inner.process.start().await {
            let err = WorkerError::HandshakeFailed {
                worker_id: inner.worker_id.to_string(),
                detail: err.to_string(),
            };
            error!(worker_id = %inner.worker_id, error = %err, "worker process failed to start");
            start_stream.dismiss();
            if let Some(task) = inner.reader_task.lock().take() {
                task.abort();
            }
            inner.publish_worker_error(err.clone());
            return Err(err);
        }
        inner.state.set(StateFlags::INITIALIZING);
        inner.wait_ready().await
    }

    /// 向 Worker 请求函数元数据；一个索引周期内只发送一次请求。
    pub async fn get_function_metadata(&self) -> Result<Vec<RawFunctionMetadata>> {
        let inner = &self.inner;
        let result = {
            let mut cycle = inner.metadata.lock();
            debug!(worker_id = %inner.worker_id, sent = cycle.sent, "fetching worker function metadata");
            if !cycle.sent {
                let slot = Arc::clone(&cycle.result);
                let fault_slot = Arc::clone(&cycle.result);
                inner.pending.register_one(
                    MessageKind::FunctionMetadataResponse,
                    Some(inner.options.metadata_timeout()),
                    inner.on_message(move |inner, message| {
                        let response = match message {
                            Message::FunctionMetadataResponse(response) => response,
                            other => return Err(unexpected(MessageKind::FunctionMetadataResponse, &other)),
                        };
                        let functions = inner.process_function_metadata_response(response);
                        complete_once(&*slot, Ok(functions));
                        Ok(())
                    }),
                    inner.on_fault(move |inner, err| {
                        error!(worker_id = %inner.worker_id, error = %err, "requesting metadata from worker failed");
                        inner.publish_management_error(&err);
                        complete_once(&*fault_slot, Err(err));
                    }),
                );
                debug!(worker_id = %inner.worker_id, runtime = %inner.options.runtime, "sending functions metadata request");
                inner
                    .writer
                    .send_and_forget(Message::FunctionsMetadataRequest(FunctionsMetadataRequest {
                        function_app_directory: inner.options.function_app_directory.clone(),
                    }));
                cycle.sent = true;
            }
            cycle.result.subscribe()
        };
        wait_slot(result).await
    }

    /// 为函数建立输入缓冲，并置位 `InvocationBuffersInitialized`。
    pub fn setup_function_invocation_buffers(&self, functions: Vec<FunctionDescriptor>) {
        let inner = &self.inner;
        for function in &functions {
            debug!(
                worker_id = %inner.worker_id,
                function = %function.name,
                function_id = %function.function_id,
                "setting up function invocation buffer"
            );
        }
        inner
            .buffers
            .setup(functions.iter().map(|function| function.function_id.clone()));
        *inner.functions.write() = functions;
        inner.state.set(StateFlags::INVOCATION_BUFFERS_INITIALIZED);
    }

    /// 发送函数加载请求，返回请求的函数数量。
    ///
    /// 禁用函数排在最后；Worker 支持批量应答时发送单个集合请求。
    pub fn send_function_load_requests(&self, options: FunctionLoadOptions) -> usize {
        let inner = &self.inner;
        let mut functions = inner.functions.read().clone();
        if functions.is_empty() {
            return 0;
        }
        functions.sort_by_key(|function| function.is_disabled);
        let timeout = inner.options.function_load_timeout(options.function_timeout);
        let count = functions.len();

        let on_fault = inner.on_fault(|inner, err| {
            error!(worker_id = %inner.worker_id, error = %err, "loading function failed");
            inner.publish_management_error(&err);
        });
        if inner
            .capabilities
            .is_enabled(names::SUPPORTS_LOAD_RESPONSE_COLLECTION)
        {
            inner.pending.register_one(
                MessageKind::FunctionLoadResponseCollection,
                timeout,
                inner.on_message(|inner, message| {
                    let responses = match message {
                        Message::FunctionLoadResponseCollection(responses) => responses,
                        other => return Err(unexpected(MessageKind::FunctionLoadResponseCollection, &other)),
                    };
                    debug!(worker_id = %inner.worker_id, count = responses.len(), "received function load response collection");
                    for response in responses {
                        inner.load_response(response);
                    }
                    Ok(())
                }),
                on_fault,
            );
            let requests = functions
                .iter()
                .map(|function| function.to_load_request(options.managed_dependency_enabled))
                .collect();
            debug!(worker_id = %inner.worker_id, count, "sending function load request collection");
            inner
                .writer
                .send_and_forget(Message::FunctionLoadRequestCollection(requests));
        } else {
            inner.pending.register(
                MessageKind::FunctionLoadResponse,
                count,
                timeout,
                inner.on_message(|inner, message| {
                    let response = match message {
                        Message::FunctionLoadResponse(response) => response,
                        other => return Err(unexpected(MessageKind::FunctionLoadResponse, &other)),
                    };
                    inner.load_response(response);
                    Ok(())
                }),
                on_fault,
            );
            for function in &functions {
                debug!(
                    worker_id = %inner.worker_id,
                    function = %function.name,
                    function_id = %function.function_id,
                    "sending function load request"
                );
                inner
                    .writer
                    .send_and_forget(Message::FunctionLoadRequest(
                        function.to_load_request(options.managed_dependency_enabled),
                    ));
            }
        }
        count
    }

    /// 以当前进程环境发送环境重载请求。
    pub async fn send_function_environment_reload_request(&self) -> Result<bool> {
        self.reload_environment(std::env::vars().collect()).await
    }

    /// 以给定环境变量发送环境重载请求。
    ///
    /// 成功返回 `true`，Worker 报告失败返回 `false`，超时或通道释放返回错误。
    pub async fn reload_environment(&self, environment: BTreeMap<String, String>) -> Result<bool> {
        let inner = &self.inner;
        *inner.metadata.lock() = MetadataCycle::new();
        inner.dispatcher.clear_metadata_errors();

        let (tx, rx) = oneshot::channel::<Result<bool>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let fault_tx = Arc::clone(&tx);
        debug!(worker_id = %inner.worker_id, pid = ?inner.process.id(), "sending function environment reload request");
        inner.pending.register_one(
            MessageKind::FunctionEnvironmentReloadResponse,
            Some(inner.options.environment_reload_timeout()),
            inner.on_message(move |inner, message| {
                let response = match message {
                    Message::FunctionEnvironmentReloadResponse(response) => response,
                    other => return Err(unexpected(MessageKind::FunctionEnvironmentReloadResponse, &other)),
                };
                let outcome = inner.environment_reload_response(response);
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(outcome));
                }
                Ok(())
            }),
            inner.on_fault(move |inner, err| {
                error!(worker_id = %inner.worker_id, error = %err, "reloading environment variables failed");
                if let Some(tx) = fault_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            }),
        );
        let request = inner.environment_reload_request(environment);
        inner.writer.send(Message::FunctionEnvironmentReloadRequest(request)).await?;
        rx.await.map_err(|_| inner.disposed())?
    }

    /// 若 Worker 支持，发送预热请求；返回是否已发送。
    pub fn send_worker_warmup_request(&self) -> bool {
        let inner = &self.inner;
        if !inner.capabilities.is_enabled(names::HANDLES_WORKER_WARMUP_MESSAGE) {
            debug!(worker_id = %inner.worker_id, "worker warmup capability not enabled");
            return false;
        }
        debug!(worker_id = %inner.worker_id, pid = ?inner.process.id(), "sending worker warmup request");
        inner.pending.register_one(
            MessageKind::WorkerWarmupResponse,
            Some(inner.options.warmup_timeout()),
            inner.on_message(|inner, message| {
                let WorkerWarmupResponse { result } = match message {
                    Message::WorkerWarmupResponse(response) => response,
                    other => return Err(unexpected(MessageKind::WorkerWarmupResponse, &other)),
                };
                if result.is_failure() {
                    error!(
                        worker_id = %inner.worker_id,
                        error = %WorkerError::describe_remote(result.exception.as_ref()),
                        "worker warmup failed"
                    );
                } else {
                    debug!(worker_id = %inner.worker_id, "worker warmup completed");
                }
                Ok(())
            }),
            inner.on_fault(|inner, err| {
                error!(worker_id = %inner.worker_id, error = %err, "worker warmup failed");
            }),
        );
        inner
            .writer
            .send_and_forget(Message::WorkerWarmupRequest(WorkerWarmupRequest {
                worker_directory: inner.options.worker_directory.clone(),
            }));
        true
    }

    pub fn is_channel_ready_for_invocations(&self) -> bool {
        self.inner.state.is_ready_for_invocations()
    }

    /// 把调用上下文投递到其函数缓冲。
    ///
    /// 已缓存失败的函数立即以缓存错误完成，不进入缓冲。
    pub async fn submit_invocation(&self, context: InvocationContext) -> Result<()> {
        let inner = &self.inner;
        if inner.state.is_disposing_or_disposed() {
            let err = inner.disposed();
            context.fail(err.clone());
            return Err(err);
        }
        if let Some(cached) = inner.dispatcher.cached_failure(&context.function_id) {
            debug!(
                worker_id = %inner.worker_id,
                invocation_id = %context.invocation_id,
                function = %context.function_name,
                "function has a cached failure; invocation resolved without buffering"
            );
            context.fail(cached);
            return Ok(());
        }
        inner.buffers.push(context).await
    }

    /// 等待当前全部在途调用完成。
    pub async fn drain_invocations(&self) {
        self.inner.dispatcher.drain().await;
    }

    pub fn is_executing_invocation(&self, invocation_id: &str) -> bool {
        self.inner.dispatcher.is_executing(invocation_id)
    }

    /// 以 `error` 失败全部在途调用并通知观察者；返回是否有调用被失败。
    pub fn try_fail_executions(&self, error: WorkerError) -> bool {
        let inner = &self.inner;
        let failed = inner.dispatcher.try_fail_executions(&error);
        inner.sequencer.clear();
        debug!(worker_id = %inner.worker_id, failed, "worker encountered a fatal error");
        inner.publish_management_error(&error);
        failed
    }

    /// 查询 Worker 状态；Worker 不支持状态探测时不产生往返。
    pub async fn get_worker_status(&self) -> Result<WorkerStatus> {
        let inner = &self.inner;
        if inner.capabilities.is_enabled(names::WORKER_STATUS) {
            let request_id = Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            inner.status_requests.insert(request_id.clone(), tx);
            let started = Instant::now();
            if let Err(err) = inner
                .writer
                .send(Message::WorkerStatusRequest(WorkerStatusRequest {
                    request_id: request_id.clone(),
                }))
                .await
            {
                inner.status_requests.remove(&request_id);
                return Err(err);
            }
            rx.await.map_err(|_| inner.disposed())?;
            let elapsed = started.elapsed();
            inner.latency.record(elapsed);
            debug!(worker_id = %inner.worker_id, elapsed_ms = elapsed.as_millis() as u64, "worker status request completed");
        }
        Ok(WorkerStatus {
            is_ready: inner.state.is_ready_for_invocations(),
            latency_history: inner.latency.snapshot(),
        })
    }

    /// 释放通道：优雅终止 Worker、取消未完成的 Future 并释放传输与进程句柄。幂等。
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.state.set(StateFlags::DISPOSING) {
            return;
        }
        inner.stop_worker_process().await;

        let disposed = inner.disposed();
        complete_once(&inner.readiness, Err(disposed.clone()));
        inner.pending.fail_all(&disposed);
        inner.buffers.shutdown(disposed.clone());
        inner.dispatcher.try_fail_executions(&disposed);
        inner.sequencer.clear();
        inner.status_requests.clear();
        complete_once(&*inner.metadata.lock().result, Err(disposed));
        if let Some(task) = inner.reader_task.lock().take() {
            task.abort();
        }
        if let Some(manager) = &inner.shared_memory {
            manager.dispose();
        }
        inner.state.set(StateFlags::DISPOSED);
        info!(worker_id = %inner.worker_id, "worker channel disposed");
    }
}

async fn wait_slot<T: Clone>(mut rx: watch::Receiver<Option<Result<T>>>) -> Result<T> {
    let settled = match rx.wait_for(Option::is_some).await {
        Ok(slot) => (*slot).clone(),
        Err(_) => None,
    };
    settled.unwrap_or_else(|| {
        Err(WorkerError::Internal {
            detail: "worker channel result dropped before completion".to_owned(),
        })
    })
}

fn unexpected(expected: MessageKind, actual: &Message) -> WorkerError {
    WorkerError::Internal {
        detail: format!("expected `{expected}` but received `{}`", actual.kind()),
    }
}

impl ChannelInner {
    fn disposed(&self) -> WorkerError {
        WorkerError::Disposed {
            worker_id: self.worker_id.to_string(),
        }
    }

    fn on_message<F>(self: &Arc<Self>, callback: F) -> MessageCallback
    where
        F: Fn(&Arc<ChannelInner>, Message) -> Result<()> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        Arc::new(move |message| match weak.upgrade() {
            Some(inner) => callback(&inner, message),
            None => Ok(()),
        })
    }

    fn on_fault<F>(self: &Arc<Self>, callback: F) -> FaultCallback
    where
        F: Fn(&Arc<ChannelInner>, WorkerError) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                callback(&inner, err);
            }
        })
    }

    fn handshake_error(&self, stage: &'static str, err: WorkerError) -> WorkerError {
        match err {
            WorkerError::PendingTimeout { timeout, .. } => WorkerError::HandshakeTimeout {
                worker_id: self.worker_id.to_string(),
                stage,
                timeout,
            },
            other => other,
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        wait_slot(self.readiness.subscribe()).await
    }

    /// 握手失败：完成就绪 Future，并在非释放状态下通知观察者。
    fn publish_worker_error(&self, err: WorkerError) {
        complete_once(&self.readiness, Err(err.clone()));
        self.publish_management_error(&err);
    }

    fn publish_management_error(&self, err: &WorkerError) {
        if self.state.is_disposing_or_disposed() {
            return;
        }
        self.observer.on_worker_error(&self.worker_id, err);
    }

    fn spawn_reader(self: &Arc<Self>) -> Result<()> {
        let Some(reader) = self.reader.lock().take() else {
            return Err(WorkerError::Internal {
                detail: "worker channel reader loop already started".to_owned(),
            });
        };
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_reader(reader).await });
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, mut reader: InboundReader) {
        debug!(worker_id = %self.worker_id, "processing reader loop");
        let handler: Arc<dyn InboundHandler> = self.clone();
        while let Some(message) = reader.recv().await {
            let kind = message.kind();
            if kind != MessageKind::RpcLog {
                trace!(worker_id = %self.worker_id, %kind, "received inbound message");
            }
            let route = self
                .sequencer
                .route(message, &handler, |id| self.dispatcher.is_executing(id));
            let Route::Direct(message) = route else {
                continue;
            };
            let Ok(permit) = Arc::clone(&self.processing).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler.handle(message).await;
                drop(permit);
            });
        }
        debug!(worker_id = %self.worker_id, "inbound stream closed; unregistering channel");
        self.observer.on_channel_closed(&self.worker_id);
    }

    fn send_worker_init_request(self: &Arc<Self>, message: Message) -> Result<()> {
        if !matches!(message, Message::StartStream(_)) {
            return Err(unexpected(MessageKind::StartStream, &message));
        }
        debug!(worker_id = %self.worker_id, "worker process started; received StartStream");
        self.pending.register_one(
            MessageKind::WorkerInitResponse,
            Some(self.options.initialization_timeout()),
            self.on_message(|inner, message| {
                let response = match message {
                    Message::WorkerInitResponse(response) => response,
                    other => return Err(unexpected(MessageKind::WorkerInitResponse, &other)),
                };
                inner.worker_init_response(response);
                Ok(())
            }),
            self.on_fault(|inner, err| {
                let err = inner.handshake_error("WorkerInitResponse", err);
                error!(worker_id = %inner.worker_id, error = %err, "initializing worker process failed");
                inner.publish_worker_error(err);
            }),
        );
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            names::MULTI_STREAM.to_owned(),
            self.options.multi_stream_hint.to_string(),
        );
        if self.options.function_data_cache_enabled {
            capabilities.insert(names::FUNCTION_DATA_CACHE.to_owned(), "true".to_owned());
        }
        self.writer
            .send_and_forget(Message::WorkerInitRequest(WorkerInitRequest {
                host_version: self.options.host_version.clone(),
                worker_directory: self.options.worker_directory.clone(),
                function_app_directory: self.options.function_app_directory.clone(),
                capabilities,
            }));
        Ok(())
    }

    fn worker_init_response(&self, response: WorkerInitResponse) {
        debug!(worker_id = %self.worker_id, capabilities = ?response.capabilities, "received WorkerInitResponse");
        self.store_worker_metadata(response.worker_metadata);
        if response.result.is_failure() {
            let err = WorkerError::HandshakeFailed {
                worker_id: self.worker_id.to_string(),
                detail: WorkerError::describe_remote(response.result.exception.as_ref()),
            };
            error!(worker_id = %self.worker_id, error = %err, "initializing worker process failed");
            self.publish_worker_error(err);
            return;
        }
        self.state.set(StateFlags::INITIALIZED);
        self.apply_capabilities(response.capabilities, CapabilityUpdateStrategy::Merge);
        complete_once(&self.readiness, Ok(()));
        info!(worker_id = %self.worker_id, runtime = %self.options.runtime, "worker initialized");
    }

    fn store_worker_metadata(&self, metadata: Option<WorkerMetadata>) {
        if let Some(metadata) = metadata {
            debug!(
                worker_id = %self.worker_id,
                runtime = %metadata.runtime_name,
                runtime_version = %metadata.runtime_version,
                worker_version = %metadata.worker_version,
                "worker metadata"
            );
            *self.worker_metadata.write() = Some(metadata);
        }
    }

    fn apply_capabilities(
        &self,
        capabilities: BTreeMap<String, String>,
        strategy: CapabilityUpdateStrategy,
    ) {
        self.capabilities.update(capabilities, strategy);
        let cancel = self.dispatcher.cancel_capability_enabled();
        let shared_memory = self.dispatcher.shared_memory_enabled();
        debug!(
            worker_id = %self.worker_id,
            ?strategy,
            cancel,
            shared_memory,
            "applied worker capabilities"
        );
    }

    fn process_function_metadata_response(
        &self,
        response: FunctionMetadataResponse,
    ) -> Vec<RawFunctionMetadata> {
        debug!(worker_id = %self.worker_id, "received worker function metadata response");
        if response.result.is_failure() {
            error!(
                worker_id = %self.worker_id,
                error = %WorkerError::describe_remote(response.result.exception.as_ref()),
                "worker failed to index functions"
            );
        }
        if response.use_default_metadata_indexing {
            return vec![RawFunctionMetadata {
                metadata: None,
                use_default_metadata_indexing: true,
            }];
        }
        response
            .function_metadata_results
            .into_iter()
            .flatten()
            .map(|result| {
                if let Some(status) = result.status.as_ref().filter(|status| status.is_failure()) {
                    error!(worker_id = %self.worker_id, function_id = %result.function_id, "worker failed to index function");
                    self.dispatcher.record_metadata_error(
                        &result.function_id,
                        WorkerError::MetadataFailed {
                            function_id: result.function_id.clone(),
                            detail: WorkerError::describe_remote(status.exception.as_ref()),
                        },
                    );
                }
                RawFunctionMetadata {
                    metadata: Some(result),
                    use_default_metadata_indexing: false,
                }
            })
            .collect()
    }

    fn load_response(&self, response: FunctionLoadResponse) {
        let function_id = response.function_id.clone();
        let function_name = self
            .functions
            .read()
            .iter()
            .find(|function| function.function_id.eq_ignore_ascii_case(&function_id))
            .map(|function| function.name.clone())
            .unwrap_or_default();
        debug!(worker_id = %self.worker_id, function = %function_name, %function_id, "received function load response");
        if response.result.is_failure() {
            let detail = WorkerError::describe_remote(response.result.exception.as_ref());
            error!(worker_id = %self.worker_id, function = %function_name, %function_id, error = %detail, "worker failed to load function");
            self.dispatcher.record_load_error(
                &function_id,
                WorkerError::FunctionLoadFailed {
                    function_id: function_id.clone(),
                    detail,
                },
            );
        }
        if response.is_dependency_downloaded {
            debug!(worker_id = %self.worker_id, runtime = %self.options.runtime, "managed dependency downloaded by worker");
        }
        if !self.buffers.contains(&function_id) {
            warn!(worker_id = %self.worker_id, %function_id, "load response for an unknown function");
            return;
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        self.buffers.link(&function_id, move |context| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.send_invocation_request(context).await }
        });
    }

    fn environment_reload_request(
        &self,
        mut environment: BTreeMap<String, String>,
    ) -> FunctionEnvironmentReloadRequest {
        environment.extend(
            self.options
                .hosting_config
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        environment.retain(|_, value| !value.is_empty());
        environment
            .entry(WORKER_DIRECTORY_SETTING.to_owned())
            .or_insert_with(|| self.options.worker_directory.clone());
        environment
            .entry(APPLICATION_DIRECTORY_SETTING.to_owned())
            .or_insert_with(|| self.options.function_app_directory.clone());
        FunctionEnvironmentReloadRequest {
            environment_variables: environment,
            function_app_directory: self.options.function_app_directory.clone(),
        }
    }

    fn environment_reload_response(&self, response: FunctionEnvironmentReloadResponse) -> bool {
        debug!(worker_id = %self.worker_id, pid = ?self.process.id(), "received function environment reload response");
        self.store_worker_metadata(response.worker_metadata);
        self.apply_capabilities(response.capabilities, response.capabilities_update_strategy);
        if response.result.is_failure() {
            if let Some(exception) = &response.result.exception {
                warn!(worker_id = %self.worker_id, error = %exception, "worker failed to reload environment");
            }
            return false;
        }
        true
    }

    async fn stop_worker_process(&self) {
        if self
            .capabilities
            .is_enabled(names::HANDLES_WORKER_TERMINATE_MESSAGE)
        {
            let grace_period = self.options.terminate_grace_period();
            debug!(worker_id = %self.worker_id, ?grace_period, "sending WorkerTerminate");
            self.writer
                .send_and_forget(Message::WorkerTerminate(WorkerTerminate { grace_period }));
            if self.process.wait_for_exit(grace_period).await {
                return;
            }
            warn!(worker_id = %self.worker_id, "worker did not exit within the grace period");
        }
        if let Err(err) = self.process.kill().await {
            warn!(worker_id = %self.worker_id, error = %err, "failed to kill worker process");
        }
    }

    fn system_log(&self, log: &RpcLog) {
        let message = log.message.as_str();
        let worker_id = &*self.worker_id;
        match log.level {
            LogLevel::Warning => warn!(worker_id, "{message}"),
            LogLevel::Error | LogLevel::Critical => match &log.exception {
                Some(exception) => error!(worker_id, error = %exception, "{message}"),
                None => error!(worker_id, "{message}"),
            },
            _ => info!(worker_id, "{message}"),
        }
    }
}

#[async_trait]
impl InboundHandler for ChannelInner {
    async fn handle(&self, message: Message) {
        match message {
            Message::RpcLog(log) if log.category == RpcLogCategory::System => self.system_log(&log),
            Message::RpcLog(log) => {
                if !self.dispatcher.relay_user_log(&log) {
                    debug!(
                        worker_id = %self.worker_id,
                        invocation_id = ?log.invocation_id,
                        "ignoring log for an invocation that is not executing"
                    );
                }
            }
            Message::WorkerStatusResponse(response) => {
                if let Some((_, tx)) = self.status_requests.remove(&response.request_id) {
                    let _ = tx.send(());
                }
            }
            Message::InvocationResponse(response) => {
                self.dispatcher.on_invocation_response(response).await;
            }
            other => {
                let kind = other.kind();
                if !self.pending.dispatch(other) {
                    debug!(worker_id = %self.worker_id, %kind, "no registered callback for inbound message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::NoopObserver;
    use crate::transport::duplex;

    struct IdleProcess;

    #[async_trait]
    impl WorkerProcess for IdleProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn wait_for_exit(&self, _timeout: Duration) -> bool {
            true
        }

        async fn kill(&self) -> Result<()> {
            Ok(())
        }
    }

    fn channel(options: WorkerChannelOptions) -> WorkerChannel {
        let (transport, _worker) = duplex("w-1", 8);
        WorkerChannel::new(
            "w-1",
            options,
            transport,
            Arc::new(IdleProcess),
            Arc::new(NoopObserver),
        )
        .expect("valid options")
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn system_logs_are_reemitted_through_tracing() {
        let channel = channel(WorkerChannelOptions::default());
        channel
            .inner
            .handle(Message::RpcLog(RpcLog {
                category: RpcLogCategory::System,
                level: LogLevel::Warning,
                message: "language worker restarting".into(),
                ..RpcLog::default()
            }))
            .await;
        assert!(logs_contain("language worker restarting"));
    }

    #[tokio::test]
    async fn reload_request_fills_directory_defaults() {
        let mut hosting_config = BTreeMap::new();
        hosting_config.insert(WORKER_DIRECTORY_SETTING.to_owned(), "/override".to_owned());
        let channel = channel(WorkerChannelOptions {
            worker_directory: "/workers/node".into(),
            function_app_directory: "/app".into(),
            hosting_config,
            ..WorkerChannelOptions::default()
        });
        let request = channel.inner.environment_reload_request(BTreeMap::new());
        assert_eq!(
            request.environment_variables.get(WORKER_DIRECTORY_SETTING).map(String::as_str),
            Some("/override")
        );
        assert_eq!(
            request
                .environment_variables
                .get(APPLICATION_DIRECTORY_SETTING)
                .map(String::as_str),
            Some("/app")
        );
        assert_eq!(request.function_app_directory, "/app");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_invocation_tears_down_its_sequencing_unit() {
        let (transport, mut worker) = duplex("w-1", 8);
        let channel = WorkerChannel::new(
            "w-1",
            WorkerChannelOptions {
                invocation_timeout_ms: Some(50),
                ..WorkerChannelOptions::default()
            },
            transport,
            Arc::new(IdleProcess),
            Arc::new(NoopObserver),
        )
        .expect("valid options");
        let inner = &channel.inner;

        let (context, result) = InvocationContext::new("f-1", "Foo");
        inner
            .dispatcher
            .send_invocation_request(context.with_invocation_id("inv-1"))
            .await;
        assert!(matches!(worker.recv().await, Some(Message::InvocationRequest(_))));

        let handler: Arc<dyn InboundHandler> = inner.clone();
        let log = Message::RpcLog(RpcLog {
            invocation_id: Some("inv-1".into()),
            message: "still working".into(),
            ..RpcLog::default()
        });
        let route = inner
            .sequencer
            .route(log, &handler, |id| inner.dispatcher.is_executing(id));
        assert!(matches!(route, Route::Sequenced));
        assert!(inner.sequencer.contains("inv-1"));

        let err = result.wait().await.expect_err("invocation times out");
        assert_eq!(err.code(), "spark.worker.pending.timeout");
        assert!(!channel.is_executing_invocation("inv-1"));
        assert!(inner.sequencer.is_empty());
    }

    #[tokio::test]
    async fn load_without_functions_sends_nothing() {
        let channel = channel(WorkerChannelOptions::default());
        assert_eq!(
            channel.send_function_load_requests(FunctionLoadOptions::default()),
            0
        );
        assert_eq!(channel.state(), StateFlags::DEFAULT);
    }
}
