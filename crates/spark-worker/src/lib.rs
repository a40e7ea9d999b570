#![allow(clippy::result_large_err)]
#![doc = "spark-worker: 函数宿主与进程外语言 Worker 之间的 RPC 通道。"]
#![doc = ""]
#![doc = "== 模块地图 =="]
#![doc = "1. 消息与能力：`message` 定义逻辑消息，`capability` 维护 Worker 协商能力表。"]
#![doc = "2. 关联与排序：`pending` 按种类 FIFO 关联无 ID 应答，`sequencer` 保证同一调用的日志先于其结果。"]
#![doc = "3. 调用：`invocation` 描述调用上下文，`buffer` 在函数加载前缓存调用，`dispatcher` 负责发送、超时、取消与结果解码。"]
#![doc = "4. 数据面：`shared_memory` 以内存映射文件传输大负载。"]
#![doc = "5. 组合：`channel::WorkerChannel` 串起握手、加载、调用、环境重载、状态探测与释放。"]

pub mod buffer;
pub mod cancellation;
pub mod capability;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod function;
pub mod invocation;
pub mod message;
pub mod pending;
pub mod process;
pub mod sequencer;
pub mod shared_memory;
pub mod state;
pub mod status;
pub mod transport;

pub use cancellation::Cancellation;
pub use capability::{CapabilitySet, CapabilityUpdateStrategy};
pub use channel::{APPLICATION_DIRECTORY_SETTING, WORKER_DIRECTORY_SETTING, WorkerChannel};
pub use config::{SharedMemoryOptions, WorkerChannelOptions};
pub use error::{ErrorCategory, Result, WorkerError};
pub use events::{ChannelObserver, NoopObserver};
pub use function::{FunctionDescriptor, FunctionLoadOptions, RawFunctionMetadata};
pub use invocation::{
    InvocationContext, InvocationLogSink, InvocationResult, InvocationResultFuture,
};
pub use message::{Message, MessageKind, RpcException, StatusResult, TypedData};
pub use process::WorkerProcess;
pub use shared_memory::{FunctionDataCache, InMemoryDataCache, SharedMemoryManager};
pub use state::StateFlags;
pub use status::WorkerStatus;
pub use transport::{ChannelTransport, WorkerEndpoint, duplex};
