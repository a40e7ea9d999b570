//! # pending：挂起应答注册表
//!
//! ## 核心意图（Why）
//! - 握手、元数据查询、函数加载、环境重载、预热等应答不携带调用 ID，只能按"同种类消息先到先配"关联；
//! - 注册表按 [`MessageKind`] 维护独立 FIFO 队列，支持一次注册 N 个期望（例如 N 个加载应答）。
//!
//! ## 行为契约（What）
//! - 到达一条某种类消息：从该种类队列头部弹出最早的未完成挂起项并触发其成功回调；
//!   已完成（例如已超时）的挂起项在弹出时被惰性丢弃；
//! - 超时：故障回调恰好触发一次；
//! - 完成依赖原子 CAS，超时与到达竞争时只有一方胜出，失败方被静默抑制；
//! - 成功回调返回 `Err` 时转交故障回调处理；
//! - 种类之间互不影响，顺序只在同一种类内成立。
//!
//! ## 注意事项（Trade-offs）
//! - 批量注册时超时只挂在最后一个挂起项上，表达"整批应答的截止时间"；
//!   需要逐项超时的调用方应逐个注册。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::message::{Message, MessageKind};

/// 成功回调：收到匹配消息时调用。
pub type MessageCallback = Arc<dyn Fn(Message) -> Result<()> + Send + Sync>;
/// 故障回调：超时、回调失败或注册表整体失败时调用。
pub type FaultCallback = Arc<dyn Fn(WorkerError) + Send + Sync>;

/// 单个挂起期望。
pub struct PendingEntry {
    kind: MessageKind,
    completed: AtomicBool,
    on_message: MessageCallback,
    on_fault: FaultCallback,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEntry")
            .field("kind", &self.kind)
            .field("completed", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl PendingEntry {
    fn new(kind: MessageKind, on_message: MessageCallback, on_fault: FaultCallback) -> Self {
        Self {
            kind,
            completed: AtomicBool::new(false),
            on_message,
            on_fault,
            timer: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// 抢占完成权；仅首个调用者返回 `true`。
    fn try_mark_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// 已获得完成权后触发成功回调。
    fn deliver(&self, message: Message) {
        self.cancel_timer();
        if let Err(err) = (self.on_message)(message) {
            (self.on_fault)(err);
        }
    }

    /// 超时路径；若应答已先一步完成则什么都不做。
    fn expire(&self, timeout: Duration) {
        if self.try_mark_complete() {
            debug!(kind = %self.kind, ?timeout, "pending entry timed out");
            (self.on_fault)(WorkerError::pending_timeout(self.kind.as_str(), timeout));
        }
    }

    /// 撤销挂起项：抢占完成权并停止计时，但不触发任何回调。
    ///
    /// 调用方已自行上报错误时使用，避免超时再次触发故障回调。返回是否由本次撤销。
    pub fn dismiss(&self) -> bool {
        let dismissed = self.try_mark_complete();
        if dismissed {
            self.cancel_timer();
        }
        dismissed
    }

    fn fail(&self, error: WorkerError) {
        if self.try_mark_complete() {
            self.cancel_timer();
            (self.on_fault)(error);
        }
    }
}

type KindQueue = Arc<Mutex<VecDeque<Arc<PendingEntry>>>>;

/// 挂起应答注册表。
#[derive(Debug, Default)]
pub struct PendingRegistry {
    queues: Mutex<HashMap<MessageKind, KindQueue>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: MessageKind) -> KindQueue {
        let mut queues = self.queues.lock();
        Arc::clone(queues.entry(kind).or_default())
    }

    fn existing_queue(&self, kind: MessageKind) -> Option<KindQueue> {
        self.queues.lock().get(&kind).cloned()
    }

    /// 为 `kind` 注册 `count` 个挂起期望。
    ///
    /// `timeout` 只作用于本批次的最后一个挂起项；`None` 表示不设超时。
    /// 需在 Tokio 运行时内调用（超时由后台定时任务驱动）。
    pub fn register(
        &self,
        kind: MessageKind,
        count: usize,
        timeout: Option<Duration>,
        on_message: MessageCallback,
        on_fault: FaultCallback,
    ) -> Vec<Arc<PendingEntry>> {
        let queue = self.queue(kind);
        let mut created = Vec::with_capacity(count);
        let mut guard = queue.lock();
        while guard.front().is_some_and(|entry| entry.is_complete()) {
            guard.pop_front();
        }
        for index in 0..count {
            let entry = Arc::new(PendingEntry::new(
                kind,
                Arc::clone(&on_message),
                Arc::clone(&on_fault),
            ));
            if index + 1 == count
                && let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero())
            {
                let weak = Arc::downgrade(&entry);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(entry) = weak.upgrade() {
                        entry.expire(timeout);
                    }
                });
                *entry.timer.lock() = Some(timer);
            }
            guard.push_back(Arc::clone(&entry));
            created.push(entry);
        }
        created
    }

    /// 便捷方法：注册单个挂起项。
    pub fn register_one(
        &self,
        kind: MessageKind,
        timeout: Option<Duration>,
        on_message: MessageCallback,
        on_fault: FaultCallback,
    ) -> Arc<PendingEntry> {
        let mut entries = self.register(kind, 1, timeout, on_message, on_fault);
        // 单个注册必然返回一个挂起项。
        entries.remove(0)
    }

    /// 将入站消息交给同种类最早的未完成挂起项；返回是否匹配成功。
    pub fn dispatch(&self, message: Message) -> bool {
        let kind = message.kind();
        let Some(queue) = self.existing_queue(kind) else {
            debug!(%kind, "no pending entry registered for inbound message");
            return false;
        };
        let winner = {
            let mut guard = queue.lock();
            loop {
                match guard.pop_front() {
                    Some(entry) if entry.try_mark_complete() => break Some(entry),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };
        match winner {
            Some(entry) => {
                entry.deliver(message);
                true
            }
            None => {
                debug!(%kind, "inbound message arrived with no outstanding pending entry");
                false
            }
        }
    }

    /// 以同一错误失败全部未完成挂起项，用于通道释放。
    pub fn fail_all(&self, error: &WorkerError) {
        let queues: Vec<KindQueue> = self.queues.lock().values().cloned().collect();
        let mut failed = 0usize;
        for queue in queues {
            let drained: Vec<_> = queue.lock().drain(..).collect();
            for entry in drained {
                if !entry.is_complete() {
                    failed += 1;
                }
                entry.fail(error.clone());
            }
        }
        if failed > 0 {
            warn!(failed, code = error.code(), "failed outstanding pending entries");
        }
    }

    /// 某种类尚未完成的挂起项数量。
    pub fn outstanding(&self, kind: MessageKind) -> usize {
        self.existing_queue(kind)
            .map(|queue| queue.lock().iter().filter(|entry| !entry.is_complete()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FunctionLoadResponse, StartStream, WorkerInitResponse};
    use proptest::prelude::*;

    fn load_response(id: &str) -> Message {
        Message::FunctionLoadResponse(FunctionLoadResponse {
            function_id: id.into(),
            ..FunctionLoadResponse::default()
        })
    }

    fn function_id(message: &Message) -> String {
        match message {
            Message::FunctionLoadResponse(response) => response.function_id.clone(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(tag: &'static str, log: &Log) -> (MessageCallback, FaultCallback) {
        let ok_log = Arc::clone(log);
        let fault_log = Arc::clone(log);
        (
            Arc::new(move |message| {
                ok_log.lock().push(format!("{tag}:{}", function_id(&message)));
                Ok(())
            }),
            Arc::new(move |err| {
                fault_log.lock().push(format!("{tag}:fault:{}", err.code()));
            }),
        )
    }

    #[tokio::test]
    async fn responses_match_entries_in_registration_order() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        for tag in ["first", "second", "third"] {
            let (ok, fault) = recording(tag, &log);
            registry.register_one(MessageKind::FunctionLoadResponse, None, ok, fault);
        }
        for id in ["a", "b", "c"] {
            assert!(registry.dispatch(load_response(id)));
        }
        assert_eq!(*log.lock(), vec!["first:a", "second:b", "third:c"]);
        assert!(!registry.dispatch(load_response("d")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_on_one_entry_does_not_affect_later_entries() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok1, fault1) = recording("e1", &log);
        let (ok2, fault2) = recording("e2", &log);
        let (ok3, fault3) = recording("e3", &log);
        registry.register_one(MessageKind::FunctionLoadResponse, None, ok1, fault1);
        registry.register_one(
            MessageKind::FunctionLoadResponse,
            Some(Duration::from_millis(10)),
            ok2,
            fault2,
        );
        registry.register_one(MessageKind::FunctionLoadResponse, None, ok3, fault3);

        assert!(registry.dispatch(load_response("a")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.dispatch(load_response("b")));

        assert_eq!(
            *log.lock(),
            vec!["e1:a", "e2:fault:spark.worker.pending.timeout", "e3:b"]
        );
        assert_eq!(registry.outstanding(MessageKind::FunctionLoadResponse), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_after_timeout_is_a_no_op() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok, fault) = recording("only", &log);
        registry.register_one(
            MessageKind::FunctionLoadResponse,
            Some(Duration::from_millis(5)),
            ok,
            fault,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!registry.dispatch(load_response("late")));
        assert_eq!(*log.lock(), vec!["only:fault:spark.worker.pending.timeout"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_completion_is_a_no_op() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok, fault) = recording("only", &log);
        let entry = registry.register_one(
            MessageKind::FunctionLoadResponse,
            Some(Duration::from_millis(5)),
            ok,
            fault,
        );
        assert!(registry.dispatch(load_response("x")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        entry.expire(Duration::from_millis(5));
        assert_eq!(*log.lock(), vec!["only:x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissed_entry_never_calls_back() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok, fault) = recording("gone", &log);
        let entry = registry.register_one(
            MessageKind::FunctionLoadResponse,
            Some(Duration::from_millis(5)),
            ok,
            fault,
        );
        assert!(entry.dismiss());
        assert!(!entry.dismiss());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.dispatch(load_response("late")));
        assert!(log.lock().is_empty());
        assert_eq!(registry.outstanding(MessageKind::FunctionLoadResponse), 0);
    }

    #[tokio::test]
    async fn kinds_have_independent_queues() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let init_log = Arc::clone(&log);
        registry.register_one(
            MessageKind::WorkerInitResponse,
            None,
            Arc::new(move |_| {
                init_log.lock().push("init".into());
                Ok(())
            }),
            Arc::new(|_| {}),
        );
        assert!(!registry.dispatch(Message::StartStream(StartStream::default())));
        assert!(registry.dispatch(Message::WorkerInitResponse(WorkerInitResponse::default())));
        assert_eq!(*log.lock(), vec!["init"]);
    }

    #[tokio::test]
    async fn callback_error_is_routed_to_fault_handler() {
        let registry = PendingRegistry::new();
        let faults: Arc<Mutex<Vec<WorkerError>>> = Arc::default();
        let sink = Arc::clone(&faults);
        registry.register_one(
            MessageKind::WorkerInitResponse,
            None,
            Arc::new(|_| Err(WorkerError::Internal { detail: "bad".into() })),
            Arc::new(move |err| sink.lock().push(err)),
        );
        assert!(registry.dispatch(Message::WorkerInitResponse(WorkerInitResponse::default())));
        assert_eq!(
            *faults.lock(),
            vec![WorkerError::Internal { detail: "bad".into() }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_timeout_applies_to_last_entry_only() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok, fault) = recording("batch", &log);
        registry.register(
            MessageKind::FunctionLoadResponse,
            3,
            Some(Duration::from_millis(10)),
            ok,
            fault,
        );
        assert!(registry.dispatch(load_response("a")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.dispatch(load_response("b")));
        assert!(!registry.dispatch(load_response("c")));
        assert_eq!(
            *log.lock(),
            vec!["batch:a", "batch:fault:spark.worker.pending.timeout", "batch:b"]
        );
    }

    #[tokio::test]
    async fn fail_all_faults_outstanding_entries_once() {
        let registry = PendingRegistry::new();
        let log: Log = Arc::default();
        let (ok, fault) = recording("x", &log);
        registry.register(MessageKind::FunctionLoadResponse, 2, None, ok, fault);
        assert!(registry.dispatch(load_response("a")));
        registry.fail_all(&WorkerError::Disposed {
            worker_id: "w".into(),
        });
        registry.fail_all(&WorkerError::Disposed {
            worker_id: "w".into(),
        });
        assert_eq!(
            *log.lock(),
            vec!["x:a", "x:fault:spark.worker.channel.disposed"]
        );
    }

    proptest! {
        #[test]
        fn fifo_matching_for_any_batch(count in 1usize..16) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let registry = PendingRegistry::new();
                let seen: Arc<Mutex<Vec<(usize, String)>>> = Arc::default();
                for index in 0..count {
                    let sink = Arc::clone(&seen);
                    registry.register_one(
                        MessageKind::FunctionLoadResponse,
                        None,
                        Arc::new(move |message| {
                            sink.lock().push((index, function_id(&message)));
                            Ok(())
                        }),
                        Arc::new(|_| {}),
                    );
                }
                for index in 0..count {
                    registry.dispatch(load_response(&index.to_string()));
                }
                let seen = seen.lock().clone();
                let expected: Vec<_> = (0..count).map(|i| (i, i.to_string())).collect();
                assert_eq!(seen, expected);
            });
        }
    }
}
