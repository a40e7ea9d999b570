//! 外部进程启动器接口。
//!
//! 通道不负责创建进程与采集标准输出，只通过 [`WorkerProcess`] 驱动其生命周期：
//! 启动、等待退出、强制终止。

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// 语言 Worker 进程句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：把平台相关的进程管理留在宿主外层，通道只关心"已启动 / 已退出"；
/// - **契约 (What)**：
///   - `start` 返回时进程已就绪，可以开始建立消息流；失败以 [`WorkerError::Process`](crate::error::WorkerError::Process) 表达；
///   - `wait_for_exit` 在给定时长内等待进程自行退出，返回是否已退出；
///   - `kill` 必须幂等，对已退出的进程调用不得报错。
#[async_trait]
pub trait WorkerProcess: Send + Sync + 'static {
    /// 操作系统进程号；尚未启动时为 `None`。
    fn id(&self) -> Option<u32>;

    async fn start(&self) -> Result<()>;

    async fn wait_for_exit(&self, timeout: Duration) -> bool;

    async fn kill(&self) -> Result<()>;
}
