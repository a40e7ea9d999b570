//! # config：Worker 通道配置
//!
//! ## 核心意图（Why）
//! - 汇总各类内建超时、处理并发度、队列容量与共享内存阈值，使每个通道可按语言运行时独立配置；
//! - 支持从 TOML 片段加载（`[worker]` 表或顶层字段均可），缺省字段使用与宿主一致的默认值。
//!
//! ## 行为契约（What）
//! - 时长字段以毫秒表示，读取时通过访问器转换为 [`Duration`]；
//! - `invocation_timeout_ms` 缺省关闭：稳态调用不设隐式超时，需要时显式配置；
//! - [`WorkerChannelOptions::validate`] 拒绝零值超时、零并发度、零缓存上限与颠倒的共享内存阈值；
//! - 出站队列容量由传输的构造方决定（见 [`crate::transport::duplex`]），不在此配置。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WorkerError};
use crate::shared_memory::DEFAULT_DATA_CACHE_BYTES;

/// 函数加载超时的下限。
pub const MIN_FUNCTION_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// 共享内存传输配置。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SharedMemoryOptions {
    /// 宿主侧总开关；还需 Worker 通告 `SharedMemoryDataTransfer` 能力。
    pub enabled: bool,
    /// 低于该字节数的负载保持内联。
    pub min_transfer_bytes: u64,
    /// 超过该字节数的负载保持内联。
    pub max_transfer_bytes: u64,
    /// 内存映射文件所在目录。
    pub directory: PathBuf,
}

impl Default for SharedMemoryOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            min_transfer_bytes: 1024 * 1024,
            max_transfer_bytes: 2 * 1024 * 1024 * 1024,
            directory: PathBuf::from("/dev/shm"),
        }
    }
}

impl SharedMemoryOptions {
    /// 负载大小是否落在共享内存传输区间内（闭区间）。
    pub fn is_eligible_size(&self, len: u64) -> bool {
        len >= self.min_transfer_bytes && len <= self.max_transfer_bytes
    }
}

/// 单个 Worker 通道的配置。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerChannelOptions {
    /// 语言运行时名称，例如 `python`、`node`。
    pub runtime: String,
    pub host_version: String,
    pub worker_directory: String,
    pub function_app_directory: String,
    pub process_startup_timeout_ms: u64,
    pub initialization_timeout_ms: u64,
    pub environment_reload_timeout_ms: u64,
    pub function_load_timeout_ms: u64,
    pub metadata_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
    pub terminate_grace_period_ms: u64,
    /// 可选的调用级协议超时；缺省不设。
    pub invocation_timeout_ms: Option<u64>,
    /// 入站消息并发处理上限（信号量许可数）。
    pub processing_concurrency: usize,
    /// 每个函数输入缓冲的容量；`None` 表示无界。
    pub function_buffer_capacity: Option<usize>,
    /// 状态探测延迟历史的保留条数。
    pub status_history_size: usize,
    /// 初始化请求中通告的多流数量提示。
    pub multi_stream_hint: u32,
    pub function_data_cache_enabled: bool,
    /// 函数数据缓存保留的负载字节上限，超出时按最久未访问淘汰。
    pub function_data_cache_max_bytes: u64,
    pub shared_memory: SharedMemoryOptions,
    /// 环境重载时额外注入的宿主配置项。
    pub hosting_config: BTreeMap<String, String>,
}

impl Default for WorkerChannelOptions {
    fn default() -> Self {
        Self {
            runtime: String::new(),
            host_version: env!("CARGO_PKG_VERSION").to_owned(),
            worker_directory: String::new(),
            function_app_directory: String::new(),
            process_startup_timeout_ms: 60_000,
            initialization_timeout_ms: 30_000,
            environment_reload_timeout_ms: 30_000,
            function_load_timeout_ms: 60_000,
            metadata_timeout_ms: 60_000,
            warmup_timeout_ms: 90_000,
            terminate_grace_period_ms: 5_000,
            invocation_timeout_ms: None,
            processing_concurrency: 64,
            function_buffer_capacity: None,
            status_history_size: 10,
            multi_stream_hint: 10,
            function_data_cache_enabled: false,
            function_data_cache_max_bytes: DEFAULT_DATA_CACHE_BYTES,
            shared_memory: SharedMemoryOptions::default(),
            hosting_config: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct WorkerSection {
    worker: WorkerChannelOptions,
}

impl WorkerChannelOptions {
    /// 从 TOML 文本解析配置并校验。
    ///
    /// 同时接受顶层字段与 `[worker]` 表两种写法。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let options = match toml::from_str::<WorkerSection>(source) {
            Ok(section) => section.worker,
            Err(_) => toml::from_str::<WorkerChannelOptions>(source)
                .map_err(|err| WorkerError::configuration(err.to_string()))?,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("process_startup_timeout_ms", self.process_startup_timeout_ms),
            ("initialization_timeout_ms", self.initialization_timeout_ms),
            (
                "environment_reload_timeout_ms",
                self.environment_reload_timeout_ms,
            ),
            ("function_load_timeout_ms", self.function_load_timeout_ms),
            ("metadata_timeout_ms", self.metadata_timeout_ms),
            ("warmup_timeout_ms", self.warmup_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(WorkerError::configuration(format!("`{name}` must be positive")));
        }
        if self.invocation_timeout_ms == Some(0) {
            return Err(WorkerError::configuration(
                "`invocation_timeout_ms` must be positive when set",
            ));
        }
        if self.processing_concurrency == 0 {
            return Err(WorkerError::configuration(
                "`processing_concurrency` must be at least 1",
            ));
        }
        if self.function_data_cache_max_bytes == 0 {
            return Err(WorkerError::configuration(
                "`function_data_cache_max_bytes` must be positive",
            ));
        }
        if self.function_buffer_capacity == Some(0) {
            return Err(WorkerError::configuration(
                "`function_buffer_capacity` must be at least 1 when set",
            ));
        }
        if self.shared_memory.min_transfer_bytes > self.shared_memory.max_transfer_bytes {
            return Err(WorkerError::configuration(
                "shared memory `min_transfer_bytes` exceeds `max_transfer_bytes`",
            ));
        }
        Ok(())
    }

    pub fn process_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.process_startup_timeout_ms)
    }

    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_millis(self.initialization_timeout_ms)
    }

    pub fn environment_reload_timeout(&self) -> Duration {
        Duration::from_millis(self.environment_reload_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    pub fn terminate_grace_period(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_period_ms)
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    /// 计算函数加载超时。
    ///
    /// 未给出函数超时则不设加载超时；否则取函数超时与配置值（不低于一分钟）中的较大者。
    pub fn function_load_timeout(&self, function_timeout: Option<Duration>) -> Option<Duration> {
        let configured =
            Duration::from_millis(self.function_load_timeout_ms).max(MIN_FUNCTION_LOAD_TIMEOUT);
        function_timeout.map(|timeout| timeout.max(configured))
    }
}
