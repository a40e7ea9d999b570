//! 集成测试共享夹具：脚本化的假 Worker 进程、记录型观察者与握手辅助函数。
//!
//! # 结构安排（How）
//! - [`FakeProcess`]：记录启动、终止与强杀调用，`exit_on_terminate` 决定优雅退出是否成功；
//! - [`RecordingObserver`]：收集通道上报的错误与关闭事件；
//! - [`Harness`]：持有通道与 Worker 侧端点，测试代码扮演 Worker 逐条应答。

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_worker::message::{
    FunctionLoadResponse, Message, StartStream, StatusResult, WorkerInitRequest,
    WorkerInitResponse, WorkerMetadata,
};
use spark_worker::{
    ChannelObserver, FunctionDescriptor, FunctionLoadOptions, Result, WorkerChannel,
    WorkerChannelOptions, WorkerEndpoint, WorkerError, WorkerProcess, duplex,
};
use tokio::sync::Notify;

pub const WORKER_ID: &str = "worker-1";

/// 单次等待 Worker 侧消息的上限，避免断言失败时测试挂起。
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct FakeProcess {
    pub exit_on_terminate: AtomicBool,
    pub fail_start: AtomicBool,
    pub starts: AtomicUsize,
    pub kills: AtomicUsize,
    pub exit_waits: AtomicUsize,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(WorkerError::Process {
                detail: "executable not found".into(),
            });
        }
        Ok(())
    }

    async fn wait_for_exit(&self, _timeout: Duration) -> bool {
        self.exit_waits.fetch_add(1, Ordering::SeqCst);
        self.exit_on_terminate.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub errors: Mutex<Vec<WorkerError>>,
    pub closed: Mutex<Vec<String>>,
    pub closed_signal: Notify,
}

impl ChannelObserver for RecordingObserver {
    fn on_worker_error(&self, _worker_id: &str, error: &WorkerError) {
        self.errors.lock().push(error.clone());
    }

    fn on_channel_closed(&self, worker_id: &str) {
        self.closed.lock().push(worker_id.to_owned());
        self.closed_signal.notify_one();
    }
}

pub struct Harness {
    pub channel: WorkerChannel,
    pub worker: WorkerEndpoint,
    pub process: Arc<FakeProcess>,
    pub observer: Arc<RecordingObserver>,
}

pub fn options() -> WorkerChannelOptions {
    WorkerChannelOptions {
        runtime: "python".into(),
        host_version: "4.0.0".into(),
        worker_directory: "/workers/python".into(),
        function_app_directory: "/home/site/wwwroot".into(),
        ..WorkerChannelOptions::default()
    }
}

pub fn harness(options: WorkerChannelOptions) -> Harness {
    let (transport, worker) = duplex(WORKER_ID, 64);
    let process = Arc::new(FakeProcess::default());
    let observer = Arc::new(RecordingObserver::default());
    let channel = WorkerChannel::new(
        WORKER_ID,
        options,
        transport,
        process.clone(),
        observer.clone(),
    )
    .expect("valid options");
    Harness {
        channel,
        worker,
        process,
        observer,
    }
}

pub fn capabilities(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect()
}

impl Harness {
    /// 读取宿主发往 Worker 的下一条消息。
    pub async fn next(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.worker.recv())
            .await
            .expect("host sent nothing in time")
            .expect("host closed the outbound stream")
    }

    pub async fn reply(&self, message: Message) {
        self.worker.send(message).await.expect("host inbound open");
    }

    /// 扮演 Worker 完成握手，返回宿主发出的初始化请求。
    pub async fn start(&mut self, worker_capabilities: &[(&str, &str)]) -> WorkerInitRequest {
        let channel = self.channel.clone();
        let started = tokio::spawn(async move { channel.start_worker_process().await });
        self.reply(Message::StartStream(StartStream {
            worker_id: WORKER_ID.into(),
        }))
        .await;
        let Message::WorkerInitRequest(init) = self.next().await else {
            panic!("expected WorkerInitRequest");
        };
        self.reply(Message::WorkerInitResponse(WorkerInitResponse {
            result: StatusResult::success(),
            capabilities: capabilities(worker_capabilities),
            worker_metadata: Some(WorkerMetadata {
                runtime_name: "python".into(),
                runtime_version: "3.11".into(),
                worker_version: "4.20.0".into(),
                ..WorkerMetadata::default()
            }),
        }))
        .await;
        started
            .await
            .expect("start task")
            .expect("handshake succeeds");
        init
    }

    /// 建立缓冲并逐个应答加载请求；`failures` 中的函数 ID 以失败应答。
    pub async fn load(&mut self, functions: Vec<FunctionDescriptor>, failures: &[&str]) {
        self.channel.setup_function_invocation_buffers(functions);
        let count = self
            .channel
            .send_function_load_requests(FunctionLoadOptions::default());
        for _ in 0..count {
            let Message::FunctionLoadRequest(request) = self.next().await else {
                panic!("expected FunctionLoadRequest");
            };
            let result = if failures.contains(&request.function_id.as_str()) {
                StatusResult::failure(spark_worker::RpcException::new("module not found"))
            } else {
                StatusResult::success()
            };
            self.reply(Message::FunctionLoadResponse(FunctionLoadResponse {
                function_id: request.function_id,
                result,
                is_dependency_downloaded: false,
            }))
            .await;
        }
    }
}
