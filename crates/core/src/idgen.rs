//! 雪花算法 ID 生成器
//!
//! 63 位构成：41 位毫秒时间戳 | 10 位 worker | 12 位序列号。
//! worker 位取协调器下发的集群自增序号对 1024 取模，
//! 同一 worker 产生的 ID 严格递增。

use std::sync::Mutex;

use chrono::Utc;

use crate::errors::{CrondError, CrondResult};

const WORKER_BITS: i64 = 10;
const SEQUENCE_BITS: i64 = 12;
const WORKER_MAX: i64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: i64 = WORKER_BITS + SEQUENCE_BITS;

/// 自定义纪元 2020-01-01T00:00:00Z，留出 41 位可用约 69 年
const EPOCH_MS: i64 = 1_577_836_800_000;

#[derive(Debug)]
struct IdState {
    last_ms: i64,
    sequence: i64,
}

/// 进程级 ID 源，启动时显式构造并传给使用方
#[derive(Debug)]
pub struct IdGenerator {
    worker_id: i64,
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// `seed` 通常是协调器 `inc` 下发的集群序号，内部取模到 10 位
    pub fn new(seed: i64) -> Self {
        Self {
            worker_id: seed.rem_euclid(WORKER_MAX + 1),
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// 生成下一个 ID；同毫秒内序列号用尽时自旋等到下一毫秒
    pub fn next_id(&self) -> CrondResult<i64> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| CrondError::internal("ID生成器状态异常", e))?;

        let mut now = Utc::now().timestamp_millis();
        if now < state.last_ms {
            // 时钟回拨，继续沿用上次时间戳保证递增
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    now = Utc::now().timestamp_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        Ok(((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence)
    }

    /// 生成字符串形式的任务 ID
    pub fn next_task_id(&self) -> CrondResult<String> {
        Ok(self.next_id()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_strictly_increasing() {
        let gen = IdGenerator::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id().unwrap();
            assert!(id > last, "ID 必须严格递增");
            last = id;
        }
    }

    #[test]
    fn test_ids_positive_63bit() {
        let gen = IdGenerator::new(1023);
        for _ in 0..1000 {
            assert!(gen.next_id().unwrap() > 0);
        }
    }

    #[test]
    fn test_seed_wraps_to_worker_bits() {
        assert_eq!(IdGenerator::new(1024).worker_id(), 0);
        assert_eq!(IdGenerator::new(1025).worker_id(), 1);
        assert_eq!(IdGenerator::new(7).worker_id(), 7);
    }

    #[test]
    fn test_distinct_workers_distinct_ids() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            assert!(seen.insert(a.next_id().unwrap()));
            assert!(seen.insert(b.next_id().unwrap()));
        }
    }
}
