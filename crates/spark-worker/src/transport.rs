//! # transport：通道双工消息流
//!
//! ## 核心意图（Why）
//! - 抽象出"一个入站读端 + 一个出站写端"的消息流，Worker 通道只依赖逻辑 [`Message`]；
//! - 真实部署中由宿主的编解码层把线上帧桥接到这里；测试与嵌入场景使用 [`duplex`] 构造内存管道。
//!
//! ## 行为契约（What）
//! - [`OutboundWriter`] 可被任意任务并发使用；`send` 先尝试同步快路径，队列满时异步等待；
//! - [`OutboundWriter::send_and_forget`] 永不阻塞调用方：快路径失败时把发送挪到后台任务；
//! - 入站读端只允许一个消费者（由通道的读循环独占）。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::message::Message;

/// 出站写端。
#[derive(Clone, Debug)]
pub struct OutboundWriter {
    worker_id: Arc<str>,
    tx: mpsc::Sender<Message>,
}

impl OutboundWriter {
    pub fn new(worker_id: impl Into<Arc<str>>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            worker_id: worker_id.into(),
            tx,
        }
    }

    /// 发送消息；队列满时等待容量，通道关闭时返回 [`WorkerError::TransportClosed`]。
    pub async fn send(&self, message: Message) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => self
                .tx
                .send(message)
                .await
                .map_err(|_| WorkerError::TransportClosed),
            Err(TrySendError::Closed(_)) => Err(WorkerError::TransportClosed),
        }
    }

    /// 尽力发送，不等待也不向调用方报告失败。
    pub fn send_and_forget(&self, message: Message) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let tx = self.tx.clone();
                    let worker_id = Arc::clone(&self.worker_id);
                    handle.spawn(async move {
                        let kind = message.kind();
                        if tx.send(message).await.is_err() {
                            debug!(worker_id = %worker_id, %kind, "outbound transport closed; message dropped");
                        }
                    });
                }
                Err(_) => {
                    warn!(
                        worker_id = %self.worker_id,
                        kind = %message.kind(),
                        "outbound queue full outside of a runtime; message dropped"
                    );
                }
            },
            Err(TrySendError::Closed(message)) => {
                debug!(
                    worker_id = %self.worker_id,
                    kind = %message.kind(),
                    "outbound transport closed; message dropped"
                );
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 入站读端。
#[derive(Debug)]
pub struct InboundReader {
    rx: mpsc::Receiver<Message>,
}

impl InboundReader {
    pub fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// 读取下一条消息；流关闭后返回 `None`。
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// 停止接收新消息，已排队的消息仍可读出。
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// 宿主侧的一对读写端。
#[derive(Debug)]
pub struct ChannelTransport {
    pub writer: OutboundWriter,
    pub reader: InboundReader,
}

/// Worker 侧端点：向宿主发送入站消息、读取宿主的出站消息。
#[derive(Debug)]
pub struct WorkerEndpoint {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl WorkerEndpoint {
    /// 向宿主发送一条消息。
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| WorkerError::TransportClosed)
    }

    /// 读取宿主发来的下一条消息。
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// 非阻塞读取。
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// 构造容量为 `capacity` 的内存双工管道。
pub fn duplex(worker_id: impl Into<Arc<str>>, capacity: usize) -> (ChannelTransport, WorkerEndpoint) {
    let capacity = capacity.max(1);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let transport = ChannelTransport {
        writer: OutboundWriter::new(worker_id, outbound_tx),
        reader: InboundReader::new(inbound_rx),
    };
    let endpoint = WorkerEndpoint {
        tx: inbound_tx,
        rx: outbound_rx,
    };
    (transport, endpoint)
}
