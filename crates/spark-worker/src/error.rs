//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义 Worker 通道对外暴露的错误语义：握手失败、函数加载失败、调用失败、通道致命错误与取消；
//! - 每个变体都携带稳定错误码（`spark.worker.*`）与 [`ErrorCategory`]，便于宿主侧按类别决定
//!   "仅失败单次调用" 还是 "替换整个 Worker"。
//!
//! ## 设计要求（What）
//! - 错误类型必须 `Clone`：同一个缓存的加载失败会被重放给该函数的每一次调用；
//! - 调用级错误只影响对应调用的结果 Future，不会改变通道就绪状态；
//! - 握手/管理类错误会同时传播到就绪 Future 与 [`ChannelObserver`](crate::events::ChannelObserver)。

use std::time::Duration;

use thiserror::Error;

use crate::message::RpcException;

/// 本 crate 统一使用的 `Result` 别名。
pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

/// 错误分类，对齐 `spark-core` 的 `ErrorCategory` 语义但收敛到 Worker 通道关心的维度。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// 调用方主动取消，不属于失败。
    Cancelled,
    /// 内建超时（进程启动、握手、加载、环境重载、元数据查询或显式配置的调用超时）。
    Timeout,
    /// Worker 明确报告的失败，通常附带远端异常信息。
    Remote,
    /// 通道级致命错误，所有在途调用都会失败，宿主应替换 Worker。
    Fatal,
    /// 配置非法。
    Configuration,
    /// 协议层面的异常（未知消息、重复注册、资源缺失等）。
    Protocol,
}

/// Worker 通道错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把进程外 Worker 的各类失败收拢为一个可克隆、可比较的枚举，
///   使缓存失败、批量失败 (`TryFailExecutions`) 与单次失败共享同一表示；
/// - **契约 (What)**：
///   - 所有变体满足 `Send + Sync + 'static`；
///   - [`WorkerError::code`] 返回稳定错误码，[`WorkerError::category`] 返回分类；
///   - `Invocation` 变体保留远端消息与堆栈，调用方可直接展示。
/// - **风险 (Trade-offs)**：上下文以 `String` 保存，失败路径上会有少量堆分配。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum WorkerError {
    /// 进程启动或初始协商在限定时间内未完成。
    #[error("worker `{worker_id}` did not complete `{stage}` within {timeout:?}")]
    HandshakeTimeout {
        worker_id: String,
        stage: &'static str,
        timeout: Duration,
    },

    /// Worker 在握手阶段明确报告失败，或进程启动本身失败。
    #[error("worker `{worker_id}` failed during handshake: {detail}")]
    HandshakeFailed { worker_id: String, detail: String },

    /// 函数加载失败；按函数 ID 缓存，并重放给该函数后续的所有调用。
    #[error("function `{function_id}` failed to load: {detail}")]
    FunctionLoadFailed { function_id: String, detail: String },

    /// Worker 索引函数元数据失败；语义与加载失败相同。
    #[error("worker failed to index function `{function_id}`: {detail}")]
    MetadataFailed { function_id: String, detail: String },

    /// 单次调用失败，仅影响该调用自身的结果 Future。
    #[error("invocation `{invocation_id}` failed: {exception}")]
    Invocation {
        invocation_id: String,
        exception: RpcException,
    },

    /// 进程崩溃或传输断裂。
    #[error("worker channel `{worker_id}` failed: {detail}")]
    ChannelFatal { worker_id: String, detail: String },

    /// 调用被取消。
    #[error("invocation `{invocation_id}` was cancelled")]
    Cancelled { invocation_id: String },

    /// 管理类交换或显式配置的调用超时。
    #[error("`{operation}` timed out after {timeout:?}")]
    PendingTimeout { operation: String, timeout: Duration },

    /// 出站或入站消息流已关闭。
    #[error("worker channel transport is closed")]
    TransportClosed,

    /// 共享内存区域读写失败。
    #[error("shared memory region `{name}`: {detail}")]
    SharedMemory { name: String, detail: String },

    /// 外部进程启动器报告的失败。
    #[error("worker process failure: {detail}")]
    Process { detail: String },

    /// 配置不合法。
    #[error("invalid worker channel configuration: {detail}")]
    Configuration { detail: String },

    /// 通道已被释放。
    #[error("worker channel `{worker_id}` has been disposed")]
    Disposed { worker_id: String },

    /// 暂未细分的内部异常。
    #[error("internal worker channel failure: {detail}")]
    Internal { detail: String },
}

impl WorkerError {
    /// 稳定错误码，供日志与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::HandshakeTimeout { .. } => "spark.worker.handshake.timeout",
            WorkerError::HandshakeFailed { .. } => "spark.worker.handshake.failed",
            WorkerError::FunctionLoadFailed { .. } => "spark.worker.function.load_failed",
            WorkerError::MetadataFailed { .. } => "spark.worker.function.metadata_failed",
            WorkerError::Invocation { .. } => "spark.worker.invocation.failed",
            WorkerError::ChannelFatal { .. } => "spark.worker.channel.fatal",
            WorkerError::Cancelled { .. } => "spark.worker.invocation.cancelled",
            WorkerError::PendingTimeout { .. } => "spark.worker.pending.timeout",
            WorkerError::TransportClosed => "spark.worker.transport.closed",
            WorkerError::SharedMemory { .. } => "spark.worker.shared_memory.failed",
            WorkerError::Process { .. } => "spark.worker.process.failed",
            WorkerError::Configuration { .. } => "spark.worker.config.invalid",
            WorkerError::Disposed { .. } => "spark.worker.channel.disposed",
            WorkerError::Internal { .. } => "spark.worker.internal",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkerError::Cancelled { .. } => ErrorCategory::Cancelled,
            WorkerError::HandshakeTimeout { .. } | WorkerError::PendingTimeout { .. } => {
                ErrorCategory::Timeout
            }
            WorkerError::FunctionLoadFailed { .. }
            | WorkerError::MetadataFailed { .. }
            | WorkerError::Invocation { .. } => ErrorCategory::Remote,
            WorkerError::HandshakeFailed { .. }
            | WorkerError::ChannelFatal { .. }
            | WorkerError::TransportClosed
            | WorkerError::Process { .. }
            | WorkerError::Disposed { .. } => ErrorCategory::Fatal,
            WorkerError::Configuration { .. } => ErrorCategory::Configuration,
            WorkerError::SharedMemory { .. } | WorkerError::Internal { .. } => {
                ErrorCategory::Protocol
            }
        }
    }

    /// 是否为取消语义。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled { .. })
    }

    pub(crate) fn pending_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        WorkerError::PendingTimeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub(crate) fn configuration(detail: impl Into<String>) -> Self {
        WorkerError::Configuration {
            detail: detail.into(),
        }
    }

    pub(crate) fn shared_memory(name: &str, detail: impl Into<String>) -> Self {
        WorkerError::SharedMemory {
            name: name.to_owned(),
            detail: detail.into(),
        }
    }

    /// 将远端异常描述转换为可读字符串，缺失时给出固定文案。
    pub(crate) fn describe_remote(exception: Option<&RpcException>) -> String {
        match exception {
            Some(exception) => exception.to_string(),
            None => "worker did not report an exception".to_owned(),
        }
    }
}
