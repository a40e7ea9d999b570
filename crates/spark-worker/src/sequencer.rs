//! # sequencer：单调用有序投递
//!
//! ## 核心意图（Why）
//! - 读循环把入站消息分发到并发处理池，同一调用的若干日志与最终响应因此可能乱序处理；
//! - 为"出现过日志的调用"惰性创建一个排序单元：私有队列 + 专属排空任务，严格按到达顺序调用处理器。
//!
//! ## 行为契约（What）
//! - 路由决策必须在读循环内按接收顺序同步完成（[`InvocationSequencer::route`] 不阻塞）；
//! - 用户日志：调用仍在执行时进入（必要时新建的）排序单元；调用不在执行中则直接分发；
//! - 最终响应：若存在排序单元，则追加到队尾并拆除单元，排空任务处理完后自然退出；
//!   否则直接分发；
//! - 入队失败（单元已拆除或排空任务异常退出）时退回直接分发，消息不会被静默丢弃。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{Message, RpcLogCategory};

/// 入站消息的最终处理器。
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message);
}

/// 路由结果。
#[derive(Debug)]
pub enum Route {
    /// 已进入排序单元。
    Sequenced,
    /// 应交给通用处理池。
    Direct(Message),
}

/// 按调用 ID 管理排序单元。
#[derive(Debug, Default)]
pub struct InvocationSequencer {
    units: DashMap<String, mpsc::UnboundedSender<Message>>,
}

impl InvocationSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为入站消息做路由决策。
    ///
    /// `is_executing` 判断调用是否仍在执行，仅在需要新建排序单元时调用。
    pub fn route<F>(&self, message: Message, handler: &Arc<dyn InboundHandler>, is_executing: F) -> Route
    where
        F: FnOnce(&str) -> bool,
    {
        match &message {
            Message::RpcLog(log) if log.category != RpcLogCategory::System => {
                let Some(invocation_id) = log.invocation_id.clone() else {
                    return Route::Direct(message);
                };
                let existing = self
                    .units
                    .get(&invocation_id)
                    .map(|unit| unit.value().clone());
                let tx = match existing {
                    Some(tx) => tx,
                    None if is_executing(&invocation_id) => self
                        .units
                        .entry(invocation_id.clone())
                        .or_insert_with(|| Self::spawn_unit(&invocation_id, Arc::clone(handler)))
                        .value()
                        .clone(),
                    None => return Route::Direct(message),
                };
                self.enqueue(&invocation_id, &tx, message)
            }
            Message::InvocationResponse(response) => {
                let invocation_id = response.invocation_id.clone();
                match self.units.remove(&invocation_id) {
                    Some((_, tx)) => {
                        trace!(%invocation_id, "routing response through sequencing unit");
                        self.enqueue(&invocation_id, &tx, message)
                    }
                    None => Route::Direct(message),
                }
            }
            _ => Route::Direct(message),
        }
    }

    /// 拆除排序单元；已入队的消息仍会被排空任务处理。
    pub fn discard(&self, invocation_id: &str) -> bool {
        self.units.remove(invocation_id).is_some()
    }

    /// 拆除全部排序单元。
    pub fn clear(&self) {
        self.units.clear();
    }

    pub fn contains(&self, invocation_id: &str) -> bool {
        self.units.contains_key(invocation_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn enqueue(
        &self,
        invocation_id: &str,
        tx: &mpsc::UnboundedSender<Message>,
        message: Message,
    ) -> Route {
        match tx.send(message) {
            Ok(()) => Route::Sequenced,
            Err(mpsc::error::SendError(message)) => {
                debug!(invocation_id, "sequencing unit is gone; dispatching directly");
                self.units.remove(invocation_id);
                Route::Direct(message)
            }
        }
    }

    fn spawn_unit(
        invocation_id: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let invocation_id = invocation_id.to_owned();
        trace!(%invocation_id, "sequencing unit created");
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler.handle(message).await;
            }
            trace!(%invocation_id, "sequencing unit drained");
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InvocationResponse, RpcLog};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn handle(&self, message: Message) {
            let label = match &message {
                Message::RpcLog(log) => {
                    // 越早到达的日志处理越慢，用于暴露潜在乱序。
                    let delay = 10u64.saturating_sub(log.message.len() as u64);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    format!("log:{}", log.message)
                }
                Message::InvocationResponse(response) => format!("response:{}", response.invocation_id),
                other => format!("other:{}", other.kind()),
            };
            self.seen.lock().push(label);
        }
    }

    fn user_log(invocation_id: &str, text: &str) -> Message {
        Message::RpcLog(RpcLog {
            invocation_id: Some(invocation_id.into()),
            message: text.into(),
            ..RpcLog::default()
        })
    }

    fn response(invocation_id: &str) -> Message {
        Message::InvocationResponse(InvocationResponse {
            invocation_id: invocation_id.into(),
            ..InvocationResponse::default()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn logs_precede_the_response() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn InboundHandler> = recorder.clone();
        let sequencer = InvocationSequencer::new();

        for text in ["a", "bb", "ccc", "dddd"] {
            assert!(matches!(
                sequencer.route(user_log("inv-1", text), &handler, |_| true),
                Route::Sequenced
            ));
        }
        assert!(sequencer.contains("inv-1"));
        assert!(matches!(
            sequencer.route(response("inv-1"), &handler, |_| true),
            Route::Sequenced
        ));
        assert!(sequencer.is_empty());

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.seen.lock().len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sequenced messages must be handled");
        assert_eq!(
            *recorder.seen.lock(),
            vec!["log:a", "log:bb", "log:ccc", "log:dddd", "response:inv-1"]
        );
    }

    #[tokio::test]
    async fn response_without_logs_bypasses_the_sequencer() {
        let handler: Arc<dyn InboundHandler> = Arc::new(Recorder::default());
        let sequencer = InvocationSequencer::new();
        assert!(matches!(
            sequencer.route(response("inv-2"), &handler, |_| true),
            Route::Direct(_)
        ));
        assert!(sequencer.is_empty());
    }

    #[tokio::test]
    async fn logs_for_finished_invocations_are_dispatched_directly() {
        let handler: Arc<dyn InboundHandler> = Arc::new(Recorder::default());
        let sequencer = InvocationSequencer::new();
        assert!(matches!(
            sequencer.route(user_log("gone", "late"), &handler, |_| false),
            Route::Direct(_)
        ));
        let system = Message::RpcLog(RpcLog {
            invocation_id: Some("inv-3".into()),
            category: RpcLogCategory::System,
            ..RpcLog::default()
        });
        assert!(matches!(
            sequencer.route(system, &handler, |_| true),
            Route::Direct(_)
        ));
        assert!(sequencer.is_empty());
    }

    #[tokio::test]
    async fn failed_enqueue_falls_back_to_direct_dispatch() {
        let handler: Arc<dyn InboundHandler> = Arc::new(Recorder::default());
        let sequencer = InvocationSequencer::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        sequencer.units.insert("inv-4".into(), dead_tx);

        match sequencer.route(response("inv-4"), &handler, |_| true) {
            Route::Direct(message) => assert_eq!(message, response("inv-4")),
            Route::Sequenced => panic!("dead unit must not swallow the response"),
        }
        assert!(!sequencer.contains("inv-4"));
    }
}
