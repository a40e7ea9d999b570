//! Worker 状态探测结果与延迟历史。

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// 一次状态探测的结果。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerStatus {
    /// 通道是否可接收调用。
    pub is_ready: bool,
    /// 最近若干次探测往返延迟，按时间先后排列；Worker 不支持探测时为空。
    pub latency_history: Vec<Duration>,
}

/// 有界延迟历史，超出容量时淘汰最旧的样本。
#[derive(Debug)]
pub struct LatencyHistory {
    capacity: usize,
    samples: Mutex<VecDeque<Duration>>,
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, latency: Duration) {
        if self.capacity == 0 {
            return;
        }
        let mut samples = self.samples.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    pub fn snapshot(&self) -> Vec<Duration> {
        self.samples.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keeps_most_recent_samples() {
        let history = LatencyHistory::new(3);
        for ms in 1..=5 {
            history.record(Duration::from_millis(ms));
        }
        assert_eq!(
            history.snapshot(),
            vec![
                Duration::from_millis(3),
                Duration::from_millis(4),
                Duration::from_millis(5)
            ]
        );

        let disabled = LatencyHistory::new(0);
        disabled.record(Duration::from_millis(1));
        assert!(disabled.snapshot().is_empty());
    }
}
