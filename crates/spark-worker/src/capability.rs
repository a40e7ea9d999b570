//! # capability：按通道持有的能力协商表
//!
//! ## 核心意图（Why）
//! - 握手与环境重载时 Worker 会上报一组 `名称 → 状态` 的可选协议特性；
//! - 每个通道独立持有一份 [`CapabilitySet`]，不存在进程级全局表。
//!
//! ## 行为契约（What）
//! - [`CapabilityUpdateStrategy::Merge`]：覆盖同名键，保留其余旧键；
//! - [`CapabilityUpdateStrategy::Replace`]：先清空，再写入全部新键；
//! - "缺失或空字符串" 一律视为关闭，所有特性门控都以 [`CapabilitySet::is_enabled`] 判断。

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

/// 已知能力名称。
pub mod names {
    pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";
    pub const SHARED_MEMORY_DATA_TRANSFER: &str = "SharedMemoryDataTransfer";
    pub const HANDLES_INVOCATION_CANCEL_MESSAGE: &str = "HandlesInvocationCancelMessage";
    pub const HANDLES_WORKER_TERMINATE_MESSAGE: &str = "HandlesWorkerTerminateMessage";
    pub const HANDLES_WORKER_WARMUP_MESSAGE: &str = "HandlesWorkerWarmupMessage";
    pub const WORKER_STATUS: &str = "WorkerStatus";
    pub const SUPPORTS_LOAD_RESPONSE_COLLECTION: &str = "SupportsLoadResponseCollection";
    pub const ENABLE_USER_CODE_EXCEPTION: &str = "EnableUserCodeException";
    pub const MULTI_STREAM: &str = "MultiStream";
    pub const FUNCTION_DATA_CACHE: &str = "FunctionDataCache";
}

/// 能力更新策略。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CapabilityUpdateStrategy {
    #[default]
    Merge,
    Replace,
}

/// 通道级能力表。
///
/// 读多写少：握手与环境重载时写入，之后每次调用都会读取若干门控，因此使用 `RwLock`。
#[derive(Debug, Default)]
pub struct CapabilitySet {
    inner: RwLock<HashMap<String, String>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按策略更新能力表。
    pub fn update<I, K, V>(&self, capabilities: I, strategy: CapabilityUpdateStrategy)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut guard = self.inner.write();
        if strategy == CapabilityUpdateStrategy::Replace {
            guard.clear();
        }
        for (name, state) in capabilities {
            guard.insert(name.into(), state.into());
        }
    }

    /// 返回能力状态；缺失时为 `None`。
    pub fn state(&self, name: &str) -> Option<String> {
        self.inner.read().get(name).cloned()
    }

    /// 能力是否开启：存在且状态非空。
    pub fn is_enabled(&self, name: &str) -> bool {
        self.inner
            .read()
            .get(name)
            .is_some_and(|state| !state.is_empty())
    }

    /// 能力状态是否为布尔真值（大小写不敏感的 `true`）。
    pub fn is_true(&self, name: &str) -> bool {
        self.inner
            .read()
            .get(name)
            .is_some_and(|state| state.eq_ignore_ascii_case("true"))
    }

    /// 当前能力表的有序快照，便于日志与断言。
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
