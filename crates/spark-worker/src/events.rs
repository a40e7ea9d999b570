//! 通道生命周期事件。
//!
//! 拥有通道的 Worker 管理器通过 [`ChannelObserver`] 获知握手失败、致命错误与通道关闭，
//! 并据此替换 Worker。

use crate::error::WorkerError;

/// 通道事件观察者；方法默认空实现。
pub trait ChannelObserver: Send + Sync + 'static {
    /// 握手或管理类交换失败、致命错误。释放过程中不会触发。
    fn on_worker_error(&self, worker_id: &str, error: &WorkerError) {
        let _ = (worker_id, error);
    }

    /// 读循环结束，通道已从管理器注销。
    fn on_channel_closed(&self, worker_id: &str) {
        let _ = worker_id;
    }
}

/// 不关心事件时使用的观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ChannelObserver for NoopObserver {}
