//! 通道状态位。
//!
//! 状态是可叠加的标志位而非互斥枚举：`Initializing → Initialized` 与
//! `InvocationBuffersInitialized` 相互独立。除释放外，标志位只增不减。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 状态标志位集合。
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const DEFAULT: StateFlags = StateFlags(0);
    pub const INITIALIZING: StateFlags = StateFlags(1 << 0);
    pub const INITIALIZED: StateFlags = StateFlags(1 << 1);
    pub const INVOCATION_BUFFERS_INITIALIZED: StateFlags = StateFlags(1 << 2);
    pub const DISPOSING: StateFlags = StateFlags(1 << 3);
    pub const DISPOSED: StateFlags = StateFlags(1 << 4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: StateFlags) -> StateFlags {
        StateFlags(self.0 | other.0)
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StateFlags, &str); 5] = [
            (StateFlags::INITIALIZING, "Initializing"),
            (StateFlags::INITIALIZED, "Initialized"),
            (StateFlags::INVOCATION_BUFFERS_INITIALIZED, "InvocationBuffersInitialized"),
            (StateFlags::DISPOSING, "Disposing"),
            (StateFlags::DISPOSED, "Disposed"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("Default")
        } else {
            f.write_str(&set.join(" | "))
        }
    }
}

/// 原子状态机。
#[derive(Debug, Default)]
pub struct ChannelState {
    bits: AtomicU8,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> StateFlags {
        StateFlags(self.bits.load(Ordering::Acquire))
    }

    /// 置位；返回此前是否未置位。
    pub fn set(&self, flag: StateFlags) -> bool {
        let previous = self.bits.fetch_or(flag.bits(), Ordering::AcqRel);
        !StateFlags(previous).contains(flag)
    }

    pub fn contains(&self, flag: StateFlags) -> bool {
        self.load().contains(flag)
    }

    pub fn is_disposing_or_disposed(&self) -> bool {
        let state = self.load();
        state.contains(StateFlags::DISPOSING) || state.contains(StateFlags::DISPOSED)
    }

    /// 就绪 ⇔ 未释放且握手与缓冲均已完成。
    pub fn is_ready_for_invocations(&self) -> bool {
        !self.is_disposing_or_disposed()
            && self.contains(
                StateFlags::INITIALIZED.union(StateFlags::INVOCATION_BUFFERS_INITIALIZED),
            )
    }
}
