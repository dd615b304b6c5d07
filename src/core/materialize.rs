//! 懒加载物化控制
//!
//! 每个访问事件大约对应读取了一个固定大小的数据块。占位符号链接只有在
//! 短时间内被持续读取、累计读取量与文件大小相当时，才会被替换为真实副本。

use crate::config::TuningConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// 单个路径的访问计数
#[derive(Debug, Clone, Copy)]
pub struct AccessCounter {
    pub weighted_count: f64,
    pub last_access: Instant,
}

/// 访问计数表，仅保存在内存中
#[derive(Debug)]
pub struct AccessTracker {
    counters: HashMap<PathBuf, AccessCounter>,
    chunk_size: u64,
    threshold_fraction: f64,
    decay_per_second: f64,
}

impl AccessTracker {
    pub fn new(tuning: &TuningConfig) -> Self {
        Self {
            counters: HashMap::new(),
            chunk_size: tuning.chunk_size,
            threshold_fraction: tuning.threshold_fraction,
            decay_per_second: tuning.decay_per_second,
        }
    }

    /// 记录一次访问并返回衰减后的加权计数
    pub fn record_access(&mut self, relative: &Path, now: Instant) -> f64 {
        let decay = self.decay_per_second;
        let counter = self
            .counters
            .entry(relative.to_path_buf())
            .and_modify(|c| {
                let elapsed = now.saturating_duration_since(c.last_access).as_secs_f64();
                let factor = (1.0 - elapsed * decay).max(0.0);
                c.weighted_count = 1.0 + factor * c.weighted_count;
                c.last_access = now;
            })
            .or_insert(AccessCounter {
                weighted_count: 1.0,
                last_access: now,
            });
        counter.weighted_count
    }

    /// 非懒加载模式总是物化；否则估算读取量超过文件大小的阈值比例时物化
    pub fn should_materialize(&self, weighted_count: f64, size: u64, lazy: bool) -> bool {
        !lazy || weighted_count * self.chunk_size as f64 > size as f64 * self.threshold_fraction
    }

    pub fn clear(&mut self, relative: &Path) {
        self.counters.remove(relative);
    }
}
