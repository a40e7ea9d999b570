//! # shared_memory：基于内存映射文件的大负载传输
//!
//! ## 核心意图（Why）
//! - 超过阈值的字节/字符串负载不内联进消息，而是写入具名共享区域，消息只携带引用；
//! - 宿主负责自己分配的区域的释放时机；Worker 产出的区域读完后由宿主发送释放请求，
//!   可选的函数数据缓存会保留已读出的值。
//!
//! ## 行为契约（What）
//! - 区域布局：8 字节小端内容长度头 + 内容；
//! - 宿主分配的区域按调用 ID 归组，调用完成后统一释放，同名区域只记录一次；
//! - 只有 `Bytes` 与 `String` 两类负载可以走共享内存。
//!
//! ## 注意事项（Trade-offs）
//! - 区域以普通文件承载（默认 `/dev/shm`），名称为随机 UUID；
//! - Worker 给出的区域名只能是目录内的单个文件名，含路径分隔符或 `..` 的名称一律拒绝；
//! - 读取时一次性拷贝出内容，不把映射生命周期暴露给调用方；
//! - 进程内数据缓存按字节数设上限，超出时淘汰最久未访问的条目。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::message::{SharedMemoryDataType, SharedMemoryReference, TypedData};

/// 内容长度头的字节数。
pub const HEADER_LEN: usize = 8;

/// 函数数据缓存：保留从共享区域读出的输出值。
pub trait FunctionDataCache: Send + Sync + 'static {
    fn get(&self, reference: &SharedMemoryReference) -> Option<TypedData>;
    fn put(&self, reference: &SharedMemoryReference, value: &TypedData);
}

/// [`InMemoryDataCache`] 的默认字节上限。
pub const DEFAULT_DATA_CACHE_BYTES: u64 = 256 * 1024 * 1024;

type CacheKey = (String, u64, u64);

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, (TypedData, u64)>,
    /// 访问顺序，队头最久未访问。
    order: VecDeque<CacheKey>,
    bytes: u64,
}

impl CacheState {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(position) = self.order.iter().position(|candidate| candidate == key) {
            self.order.remove(position);
        }
        self.order.push_back(key.clone());
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some((_, size)) = self.entries.remove(key) {
            self.bytes -= size;
            self.order.retain(|candidate| candidate != key);
        }
    }
}

/// 进程内 LRU 缓存，键为区域名 + 偏移 + 长度，总量以负载字节数计。
#[derive(Debug)]
pub struct InMemoryDataCache {
    capacity_bytes: u64,
    state: Mutex<CacheState>,
}

impl Default for InMemoryDataCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DATA_CACHE_BYTES)
    }
}

impl InMemoryDataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// 当前缓存的负载字节数。
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn key(reference: &SharedMemoryReference) -> CacheKey {
        (reference.name.clone(), reference.offset, reference.count)
    }
}

impl FunctionDataCache for InMemoryDataCache {
    fn get(&self, reference: &SharedMemoryReference) -> Option<TypedData> {
        let key = Self::key(reference);
        let mut state = self.state.lock();
        let value = state.entries.get(&key).map(|(value, _)| value.clone())?;
        state.touch(&key);
        Some(value)
    }

    fn put(&self, reference: &SharedMemoryReference, value: &TypedData) {
        let size = value.transferable_len().unwrap_or(0) as u64;
        if size > self.capacity_bytes {
            debug!(region = %reference.name, bytes = size, "value exceeds data cache capacity; not cached");
            return;
        }
        let key = Self::key(reference);
        let mut state = self.state.lock();
        state.remove(&key);
        while state.bytes + size > self.capacity_bytes {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some((_, evicted)) = state.entries.remove(&oldest) {
                state.bytes -= evicted;
                trace!(region = %oldest.0, bytes = evicted, "evicted cached shared memory value");
            }
        }
        state.entries.insert(key.clone(), (value.clone(), size));
        state.order.push_back(key);
        state.bytes += size;
    }
}

/// 宿主分配的区域。
struct SharedMemoryRegion {
    path: PathBuf,
    _map: MmapMut,
}

/// 共享内存管理器。
pub struct SharedMemoryManager {
    directory: PathBuf,
    regions: DashMap<String, SharedMemoryRegion>,
    invocation_regions: DashMap<String, HashSet<String>>,
    cache: Option<Arc<dyn FunctionDataCache>>,
}

impl std::fmt::Debug for SharedMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryManager")
            .field("directory", &self.directory)
            .field("regions", &self.regions.len())
            .field("invocations", &self.invocation_regions.len())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl SharedMemoryManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            regions: DashMap::new(),
            invocation_regions: DashMap::new(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn FunctionDataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 负载类型是否可走共享内存。
    pub fn is_supported(data: &TypedData) -> bool {
        matches!(data, TypedData::Bytes(_) | TypedData::String(_))
    }

    /// 把负载写入新分配的区域。
    pub fn put(&self, data: &TypedData) -> Result<SharedMemoryReference> {
        let (content, data_type): (&[u8], _) = match data {
            TypedData::Bytes(bytes) => (bytes.as_ref(), SharedMemoryDataType::Bytes),
            TypedData::String(text) => (text.as_bytes(), SharedMemoryDataType::String),
            _ => {
                return Err(WorkerError::shared_memory(
                    "",
                    "only bytes and string payloads can be transferred",
                ));
            }
        };
        let name = Uuid::new_v4().to_string();
        let path = self.directory.join(&name);
        let map = Self::create_region(&name, &path, content)?;
        self.regions.insert(
            name.clone(),
            SharedMemoryRegion { path, _map: map },
        );
        debug!(region = %name, bytes = content.len(), "shared memory region written");
        Ok(SharedMemoryReference {
            name,
            offset: 0,
            count: content.len() as u64,
            data_type,
        })
    }

    /// 写入区域并挂到调用上，调用结束时一并释放。
    pub fn put_for_invocation(
        &self,
        invocation_id: &str,
        data: &TypedData,
    ) -> Result<SharedMemoryReference> {
        let reference = self.put(data)?;
        self.add_for_invocation(invocation_id, &reference.name);
        Ok(reference)
    }

    /// 记录调用持有的区域；同名区域只记录一次，返回是否新增。
    pub fn add_for_invocation(&self, invocation_id: &str, name: &str) -> bool {
        self.invocation_regions
            .entry(invocation_id.to_owned())
            .or_default()
            .insert(name.to_owned())
    }

    pub fn regions_for_invocation(&self, invocation_id: &str) -> Vec<String> {
        self.invocation_regions
            .get(invocation_id)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 读取引用指向的内容（区域可以由任何一方写入）。
    pub fn get(&self, reference: &SharedMemoryReference) -> Result<TypedData> {
        let path = self.region_path(&reference.name)?;
        let file = File::open(&path)
            .map_err(|err| WorkerError::shared_memory(&reference.name, err.to_string()))?;
        // SAFETY: 映射只读；区域在写入完成后才会被对端引用，读取期间长度头与内容不再变化；
        // 所有访问都在下面按长度头做了边界校验。
        let map = unsafe { Mmap::map(&file) }
            .map_err(|err| WorkerError::shared_memory(&reference.name, err.to_string()))?;
        let content = Self::content_slice(&reference.name, &map, reference.offset, reference.count)?;
        match reference.data_type {
            SharedMemoryDataType::Bytes => Ok(TypedData::Bytes(Bytes::copy_from_slice(content))),
            SharedMemoryDataType::String => String::from_utf8(content.to_vec())
                .map(TypedData::String)
                .map_err(|err| WorkerError::shared_memory(&reference.name, err.to_string())),
        }
    }

    /// 解析 Worker 产出的输出，启用缓存时优先命中缓存并回填。
    pub fn resolve_output(&self, reference: &SharedMemoryReference) -> Result<TypedData> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(reference)
        {
            return Ok(hit);
        }
        let value = self.get(reference)?;
        if let Some(cache) = &self.cache {
            cache.put(reference, &value);
        }
        Ok(value)
    }

    /// 释放单个宿主分配的区域；区域不存在时返回 `false`。
    pub fn try_free(&self, name: &str) -> bool {
        match self.regions.remove(name) {
            Some((_, region)) => {
                Self::delete_region(name, &region);
                true
            }
            None => false,
        }
    }

    /// 释放调用持有的全部区域；调用没有任何区域也视为成功。
    pub fn try_free_for_invocation(&self, invocation_id: &str) -> bool {
        let Some((_, names)) = self.invocation_regions.remove(invocation_id) else {
            return true;
        };
        let mut all_freed = true;
        for name in names {
            if !self.try_free(&name) {
                debug!(invocation_id, region = %name, "shared memory region already released");
                all_freed = false;
            }
        }
        all_freed
    }

    /// 释放全部区域。
    pub fn dispose(&self) {
        self.invocation_regions.clear();
        let names: Vec<String> = self.regions.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.try_free(&name);
        }
    }

    pub fn allocated(&self) -> usize {
        self.regions.len()
    }

    /// 区域名必须是目录内的单个普通文件名。
    fn region_path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        let bare = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) && !name.contains(&['/', '\\'][..]);
        if !bare {
            return Err(WorkerError::shared_memory(
                name,
                "region name must be a bare file name",
            ));
        }
        Ok(self.directory.join(name))
    }

    fn create_region(name: &str, path: &Path, content: &[u8]) -> Result<MmapMut> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| WorkerError::shared_memory(name, err.to_string()))?;
        file.set_len((HEADER_LEN + content.len()) as u64)
            .map_err(|err| WorkerError::shared_memory(name, err.to_string()))?;
        // SAFETY: 文件刚以独占方式创建并设置好长度，映射期间只有本进程写入。
        let mut map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|err| WorkerError::shared_memory(name, err.to_string()))?;
        map[..HEADER_LEN].copy_from_slice(&(content.len() as u64).to_le_bytes());
        map[HEADER_LEN..].copy_from_slice(content);
        map.flush()
            .map_err(|err| WorkerError::shared_memory(name, err.to_string()))?;
        Ok(map)
    }

    fn content_slice<'a>(name: &str, map: &'a [u8], offset: u64, count: u64) -> Result<&'a [u8]> {
        if map.len() < HEADER_LEN {
            return Err(WorkerError::shared_memory(name, "region is smaller than its header"));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&map[..HEADER_LEN]);
        let content_len = u64::from_le_bytes(header);
        let available = (map.len() - HEADER_LEN) as u64;
        if content_len > available {
            return Err(WorkerError::shared_memory(
                name,
                format!("header declares {content_len} bytes but region holds {available}"),
            ));
        }
        let end = offset
            .checked_add(count)
            .filter(|end| *end <= content_len)
            .ok_or_else(|| {
                WorkerError::shared_memory(
                    name,
                    format!("range {offset}+{count} exceeds content length {content_len}"),
                )
            })?;
        let start = HEADER_LEN + offset as usize;
        Ok(&map[start..HEADER_LEN + end as usize])
    }

    fn delete_region(name: &str, region: &SharedMemoryRegion) {
        if let Err(err) = fs::remove_file(&region.path) {
            warn!(region = %name, error = %err, "failed to delete shared memory region");
        }
    }
}

impl Drop for SharedMemoryManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
