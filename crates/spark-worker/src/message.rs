//! # message：Host ↔ Worker 逻辑消息模型
//!
//! ## 核心意图（Why）
//! - 以封闭的 [`Message`] 枚举描述通道上流动的全部消息种类，调度逻辑对其穷举匹配；
//! - 不绑定任何具体序列化格式，宿主侧的编解码层负责与线上帧互转。
//!
//! ## 关联规则（What）
//! 每种消息恰好受一条关联规则约束，见 [`MessageKind::correlation`]：
//! - 按调用 ID 关联：`InvocationResponse`、`RpcLog`（用户类别）；
//! - 按 FIFO 挂起项关联：握手、元数据、加载、环境重载、预热等缺少自带请求 ID 的应答；
//! - 按请求 ID 关联：`WorkerStatusResponse`；
//! - 其余为单向消息。

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::capability::CapabilityUpdateStrategy;

/// 消息种类标签，同时作为挂起项注册表的队列键。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MessageKind {
    StartStream,
    WorkerInitRequest,
    WorkerInitResponse,
    FunctionsMetadataRequest,
    FunctionMetadataResponse,
    FunctionLoadRequest,
    FunctionLoadRequestCollection,
    FunctionLoadResponse,
    FunctionLoadResponseCollection,
    InvocationRequest,
    InvocationResponse,
    InvocationCancel,
    RpcLog,
    WorkerStatusRequest,
    WorkerStatusResponse,
    FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse,
    CloseSharedMemoryResourcesRequest,
    WorkerWarmupRequest,
    WorkerWarmupResponse,
    WorkerTerminate,
}

/// 入站消息的关联方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Correlation {
    /// 通过消息自带的调用 ID 定位在途调用。
    InvocationId,
    /// 通过消息自带的请求 ID 定位状态探测。
    RequestId,
    /// 弹出同种类最早注册且尚未完成的挂起项。
    PendingFifo,
    /// 单向消息，不需要关联。
    FireAndForget,
}

impl MessageKind {
    /// 返回该种类消息适用的关联规则。
    pub fn correlation(self) -> Correlation {
        match self {
            MessageKind::InvocationResponse | MessageKind::RpcLog => Correlation::InvocationId,
            MessageKind::WorkerStatusResponse => Correlation::RequestId,
            MessageKind::StartStream
            | MessageKind::WorkerInitResponse
            | MessageKind::FunctionMetadataResponse
            | MessageKind::FunctionLoadResponse
            | MessageKind::FunctionLoadResponseCollection
            | MessageKind::FunctionEnvironmentReloadResponse
            | MessageKind::WorkerWarmupResponse => Correlation::PendingFifo,
            MessageKind::WorkerInitRequest
            | MessageKind::FunctionsMetadataRequest
            | MessageKind::FunctionLoadRequest
            | MessageKind::FunctionLoadRequestCollection
            | MessageKind::InvocationRequest
            | MessageKind::InvocationCancel
            | MessageKind::WorkerStatusRequest
            | MessageKind::FunctionEnvironmentReloadRequest
            | MessageKind::CloseSharedMemoryResourcesRequest
            | MessageKind::WorkerWarmupRequest
            | MessageKind::WorkerTerminate => Correlation::FireAndForget,
        }
    }

    /// 人类可读名称，用于日志与超时错误。
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::StartStream => "StartStream",
            MessageKind::WorkerInitRequest => "WorkerInitRequest",
            MessageKind::WorkerInitResponse => "WorkerInitResponse",
            MessageKind::FunctionsMetadataRequest => "FunctionsMetadataRequest",
            MessageKind::FunctionMetadataResponse => "FunctionMetadataResponse",
            MessageKind::FunctionLoadRequest => "FunctionLoadRequest",
            MessageKind::FunctionLoadRequestCollection => "FunctionLoadRequestCollection",
            MessageKind::FunctionLoadResponse => "FunctionLoadResponse",
            MessageKind::FunctionLoadResponseCollection => "FunctionLoadResponseCollection",
            MessageKind::InvocationRequest => "InvocationRequest",
            MessageKind::InvocationResponse => "InvocationResponse",
            MessageKind::InvocationCancel => "InvocationCancel",
            MessageKind::RpcLog => "RpcLog",
            MessageKind::WorkerStatusRequest => "WorkerStatusRequest",
            MessageKind::WorkerStatusResponse => "WorkerStatusResponse",
            MessageKind::FunctionEnvironmentReloadRequest => "FunctionEnvironmentReloadRequest",
            MessageKind::FunctionEnvironmentReloadResponse => "FunctionEnvironmentReloadResponse",
            MessageKind::CloseSharedMemoryResourcesRequest => "CloseSharedMemoryResourcesRequest",
            MessageKind::WorkerWarmupRequest => "WorkerWarmupRequest",
            MessageKind::WorkerWarmupResponse => "WorkerWarmupResponse",
            MessageKind::WorkerTerminate => "WorkerTerminate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通道上的逻辑消息。
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    StartStream(StartStream),
    WorkerInitRequest(WorkerInitRequest),
    WorkerInitResponse(WorkerInitResponse),
    FunctionsMetadataRequest(FunctionsMetadataRequest),
    FunctionMetadataResponse(FunctionMetadataResponse),
    FunctionLoadRequest(FunctionLoadRequest),
    FunctionLoadRequestCollection(Vec<FunctionLoadRequest>),
    FunctionLoadResponse(FunctionLoadResponse),
    FunctionLoadResponseCollection(Vec<FunctionLoadResponse>),
    InvocationRequest(InvocationRequest),
    InvocationResponse(InvocationResponse),
    InvocationCancel(InvocationCancel),
    RpcLog(RpcLog),
    WorkerStatusRequest(WorkerStatusRequest),
    WorkerStatusResponse(WorkerStatusResponse),
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),
    CloseSharedMemoryResourcesRequest(CloseSharedMemoryResourcesRequest),
    WorkerWarmupRequest(WorkerWarmupRequest),
    WorkerWarmupResponse(WorkerWarmupResponse),
    WorkerTerminate(WorkerTerminate),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::StartStream(_) => MessageKind::StartStream,
            Message::WorkerInitRequest(_) => MessageKind::WorkerInitRequest,
            Message::WorkerInitResponse(_) => MessageKind::WorkerInitResponse,
            Message::FunctionsMetadataRequest(_) => MessageKind::FunctionsMetadataRequest,
            Message::FunctionMetadataResponse(_) => MessageKind::FunctionMetadataResponse,
            Message::FunctionLoadRequest(_) => MessageKind::FunctionLoadRequest,
            Message::FunctionLoadRequestCollection(_) => MessageKind::FunctionLoadRequestCollection,
            Message::FunctionLoadResponse(_) => MessageKind::FunctionLoadResponse,
            Message::FunctionLoadResponseCollection(_) => {
                MessageKind::FunctionLoadResponseCollection
            }
            Message::InvocationRequest(_) => MessageKind::InvocationRequest,
            Message::InvocationResponse(_) => MessageKind::InvocationResponse,
            Message::InvocationCancel(_) => MessageKind::InvocationCancel,
            Message::RpcLog(_) => MessageKind::RpcLog,
            Message::WorkerStatusRequest(_) => MessageKind::WorkerStatusRequest,
            Message::WorkerStatusResponse(_) => MessageKind::WorkerStatusResponse,
            Message::FunctionEnvironmentReloadRequest(_) => {
                MessageKind::FunctionEnvironmentReloadRequest
            }
            Message::FunctionEnvironmentReloadResponse(_) => {
                MessageKind::FunctionEnvironmentReloadResponse
            }
            Message::CloseSharedMemoryResourcesRequest(_) => {
                MessageKind::CloseSharedMemoryResourcesRequest
            }
            Message::WorkerWarmupRequest(_) => MessageKind::WorkerWarmupRequest,
            Message::WorkerWarmupResponse(_) => MessageKind::WorkerWarmupResponse,
            Message::WorkerTerminate(_) => MessageKind::WorkerTerminate,
        }
    }

    /// 消息携带的调用 ID（若有）。
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Message::InvocationRequest(request) => Some(&request.invocation_id),
            Message::InvocationResponse(response) => Some(&response.invocation_id),
            Message::InvocationCancel(cancel) => Some(&cancel.invocation_id),
            Message::RpcLog(log) => log.invocation_id.as_deref(),
            _ => None,
        }
    }
}

/// Worker 远端异常描述。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RpcException {
    pub message: String,
    pub stack_trace: Option<String>,
    pub source: Option<String>,
    pub is_user_exception: bool,
}

impl RpcException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

impl fmt::Display for RpcException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{source}: ")?;
        }
        f.write_str(&self.message)?;
        if let Some(stack) = &self.stack_trace {
            write!(f, "\n{stack}")?;
        }
        Ok(())
    }
}

/// 应答结果状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Success,
    Failure,
    Cancelled,
}

/// Worker 返回的结果与可选异常。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusResult {
    pub status: Status,
    pub exception: Option<RpcException>,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exception: None,
        }
    }

    pub fn failure(exception: RpcException) -> Self {
        Self {
            status: Status::Failure,
            exception: Some(exception),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            exception: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == Status::Failure
    }
}

impl Default for StatusResult {
    fn default() -> Self {
        Self::success()
    }
}

/// 绑定值的类型化表示。
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TypedData {
    #[default]
    Empty,
    String(String),
    Json(String),
    Bytes(Bytes),
    Int(i64),
    Double(f64),
}

impl TypedData {
    /// 可参与共享内存传输的负载字节数；标量与空值返回 `None`。
    pub fn transferable_len(&self) -> Option<usize> {
        match self {
            TypedData::Bytes(bytes) => Some(bytes.len()),
            TypedData::String(text) => Some(text.len()),
            _ => None,
        }
    }
}

/// 共享内存区域中内容的类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SharedMemoryDataType {
    Bytes,
    String,
}

/// 指向共享内存区域的引用，替代内联负载。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedMemoryReference {
    pub name: String,
    pub offset: u64,
    pub count: u64,
    pub data_type: SharedMemoryDataType,
}

/// 绑定值：要么内联，要么位于共享内存区域。
#[derive(Clone, Debug, PartialEq)]
pub enum BindingData {
    Inline(TypedData),
    SharedMemory(SharedMemoryReference),
}

/// 具名参数绑定。
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub data: BindingData,
}

impl ParameterBinding {
    pub fn inline(name: impl Into<String>, data: TypedData) -> Self {
        Self {
            name: name.into(),
            data: BindingData::Inline(data),
        }
    }

    pub fn shared_memory(name: impl Into<String>, reference: SharedMemoryReference) -> Self {
        Self {
            name: name.into(),
            data: BindingData::SharedMemory(reference),
        }
    }

    pub fn shared_memory_name(&self) -> Option<&str> {
        match &self.data {
            BindingData::SharedMemory(reference) => Some(&reference.name),
            BindingData::Inline(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingDirection {
    In,
    Out,
    InOut,
}

/// 加载请求中的绑定声明。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindingInfo {
    pub binding_type: String,
    pub direction: BindingDirection,
}

/// 加载请求携带的函数元数据。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RpcFunctionMetadata {
    pub name: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    pub is_proxy: bool,
    pub bindings: BTreeMap<String, BindingInfo>,
    pub properties: BTreeMap<String, String>,
}

/// Worker 自报的运行时信息。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerMetadata {
    pub runtime_name: String,
    pub runtime_version: String,
    pub worker_version: String,
    pub worker_bitness: String,
    pub custom_properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartStream {
    pub worker_id: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerInitRequest {
    pub host_version: String,
    pub worker_directory: String,
    pub function_app_directory: String,
    pub capabilities: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerInitResponse {
    pub result: StatusResult,
    pub capabilities: BTreeMap<String, String>,
    pub worker_metadata: Option<WorkerMetadata>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionsMetadataRequest {
    pub function_app_directory: String,
}

/// 函数重试策略。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryStrategy {
    FixedDelay {
        delay: Option<Duration>,
    },
    ExponentialBackoff {
        minimum: Option<Duration>,
        maximum: Option<Duration>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryOptions {
    pub max_retry_count: i32,
    pub strategy: RetryStrategy,
}

/// Worker 索引得到的单个函数描述。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionMetadataResult {
    pub function_id: String,
    pub name: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    pub language: String,
    pub raw_bindings: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub retry_options: Option<RetryOptions>,
    pub status: Option<StatusResult>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionMetadataResponse {
    pub result: StatusResult,
    pub use_default_metadata_indexing: bool,
    /// 索引结果；Worker 可能发送空槽位，处理时跳过。
    pub function_metadata_results: Vec<Option<FunctionMetadataResult>>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: RpcFunctionMetadata,
    pub managed_dependency_enabled: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
    pub is_dependency_downloaded: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    pub input_data: Vec<ParameterBinding>,
    pub trigger_metadata: BTreeMap<String, TypedData>,
    pub trace_attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub output_data: Vec<ParameterBinding>,
    pub return_value: Option<TypedData>,
    pub result: StatusResult,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InvocationCancel {
    pub invocation_id: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RpcLogCategory {
    #[default]
    User,
    System,
    CustomMetric,
}

#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
    None,
}

/// Worker 发出的日志。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RpcLog {
    pub invocation_id: Option<String>,
    pub category: RpcLogCategory,
    pub level: LogLevel,
    pub message: String,
    pub exception: Option<RpcException>,
    pub event_id: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerStatusRequest {
    pub request_id: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerStatusResponse {
    pub request_id: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionEnvironmentReloadRequest {
    pub environment_variables: BTreeMap<String, String>,
    pub function_app_directory: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionEnvironmentReloadResponse {
    pub result: StatusResult,
    pub capabilities: BTreeMap<String, String>,
    pub capabilities_update_strategy: CapabilityUpdateStrategy,
    pub worker_metadata: Option<WorkerMetadata>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CloseSharedMemoryResourcesRequest {
    pub map_names: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerWarmupRequest {
    pub worker_directory: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerWarmupResponse {
    pub result: StatusResult,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerTerminate {
    pub grace_period: Duration,
}
