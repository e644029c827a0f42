//! The `memory` subsystem. Grounded on `containers-youki`'s
//! `v1::memory::Memory` (limit/swap read-current-then-write-sequence
//! pattern, `memory.stat`/`memory.use_hierarchy` parsing), extended with
//! idle-page-stats, numa-stats, and compression-stats getters and
//! `oom_control`-backed notification registration.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::events::{NotificationCallback, NotificationHandle};
use crate::parsing::{parse_flat_keyed_data, parse_single_value};

use super::{CgroupController, ControllerBase};

const MEMORY_LIMIT_IN_BYTES: &str = "memory.limit_in_bytes";
const MEMORY_SOFT_LIMIT_IN_BYTES: &str = "memory.soft_limit_in_bytes";
const MEMORY_SWAP_LIMIT_IN_BYTES: &str = "memory.memsw.limit_in_bytes";
const MEMORY_USAGE_IN_BYTES: &str = "memory.usage_in_bytes";
const MEMORY_MAX_USAGE_IN_BYTES: &str = "memory.max_usage_in_bytes";
const MEMORY_SWAP_USAGE_IN_BYTES: &str = "memory.memsw.usage_in_bytes";
const MEMORY_SWAP_MAX_USAGE_IN_BYTES: &str = "memory.memsw.max_usage_in_bytes";
const MEMORY_FAILCNT: &str = "memory.failcnt";
const MEMORY_STALE_PAGE_AGE: &str = "memory.stale_page_age";
const MEMORY_OOM_SCORE: &str = "memory.oom_score";
const MEMORY_COMPRESSION_SAMPLING_RATIO: &str = "memory.compression_sampling_ratio";
const MEMORY_DIRTY_RATIO: &str = "memory.dirty_ratio";
const MEMORY_DIRTY_BACKGROUND_RATIO: &str = "memory.dirty_background_ratio";
const MEMORY_DIRTY_LIMIT_IN_BYTES: &str = "memory.dirty_limit_in_bytes";
const MEMORY_DIRTY_BACKGROUND_LIMIT_IN_BYTES: &str = "memory.dirty_background_limit_in_bytes";
const MEMORY_KMEM_CHARGE_USAGE: &str = "memory.kmem.charge_usage";
const MEMORY_STAT: &str = "memory.stat";
const MEMORY_NUMA_STAT: &str = "memory.numa_stat";
const MEMORY_IDLE_PAGE_STATS: &str = "memory.idle_page_stats";
const MEMORY_COMPRESSION_SAMPLING_STATS: &str = "memory.compression_sampling_stats";
const MEMORY_OOM_CONTROL: &str = "memory.oom_control";

/// Values at or above this threshold map to the kernel's `-1` ("unlimited")
/// wire value.
const INT64_MAX: i64 = i64::MAX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdlePageStats {
    pub scans: Option<u64>,
    pub stale: Option<u64>,
    pub idle_clean: HashMap<u32, u64>,
    pub idle_dirty_file: HashMap<u32, u64>,
    pub idle_dirty_swap: HashMap<u32, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionSamplingStats {
    pub raw_size: u64,
    pub compressed_size: u64,
    pub fifo_overflow: u64,
}

/// One side (container-local or hierarchical) of `memory.stat`: the fixed
/// accounting keys as named fields, everything else bucketed by prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStatRecord {
    pub cache: Option<u64>,
    pub rss: Option<u64>,
    pub rss_huge: Option<u64>,
    pub mapped_file: Option<u64>,
    pub pgpgin: Option<u64>,
    pub pgfault: Option<u64>,
    pub pgmajfault: Option<u64>,
    pub dirty: Option<u64>,
    pub writeback: Option<u64>,
    pub inactive_anon: Option<u64>,
    pub active_anon: Option<u64>,
    pub inactive_file: Option<u64>,
    pub active_file: Option<u64>,
    pub unevictable: Option<u64>,
    pub thp: HashMap<String, u64>,
    pub kernel: HashMap<String, u64>,
    pub kernel_noncharged: HashMap<String, u64>,
    pub compression: HashMap<String, u64>,
}

impl MemoryStatRecord {
    /// Routes one `memory.stat` key into its fixed field or prefix bucket;
    /// keys matching nothing recognized are dropped.
    fn set(&mut self, key: &str, value: u64) {
        match key {
            "cache" => self.cache = Some(value),
            "rss" => self.rss = Some(value),
            "rss_huge" => self.rss_huge = Some(value),
            "mapped_file" => self.mapped_file = Some(value),
            "pgpgin" => self.pgpgin = Some(value),
            "pgfault" => self.pgfault = Some(value),
            "pgmajfault" => self.pgmajfault = Some(value),
            "dirty" => self.dirty = Some(value),
            "writeback" => self.writeback = Some(value),
            "inactive_anon" => self.inactive_anon = Some(value),
            "active_anon" => self.active_anon = Some(value),
            "inactive_file" => self.inactive_file = Some(value),
            "active_file" => self.active_file = Some(value),
            "unevictable" => self.unevictable = Some(value),
            _ => {
                if let Some(rest) = key.strip_prefix("kernel_noncharged_") {
                    self.kernel_noncharged.insert(rest.to_string(), value);
                } else if let Some(rest) = key.strip_prefix("kernel_") {
                    self.kernel.insert(rest.to_string(), value);
                } else if let Some(rest) = key.strip_prefix("thp_") {
                    self.thp.insert(rest.to_string(), value);
                } else if let Some(rest) = key.strip_prefix("compression_") {
                    self.compression.insert(rest.to_string(), value);
                } else if let Some(rest) = key.strip_prefix("zswap_") {
                    self.compression.insert(rest.to_string(), value);
                }
            }
        }
    }
}

/// `memory.stat` split into the container's own accounting
/// (unprefixed keys) and the hierarchy's (`total_`-prefixed keys).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStatData {
    pub container_data: MemoryStatRecord,
    pub hierarchical_data: MemoryStatRecord,
}

pub struct Memory {
    base: ControllerBase,
}

impl CgroupController for Memory {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

/// Clamps any value at or beyond `INT64_MAX` to the kernel's `-1` sentinel.
fn to_wire(bytes: i64) -> i64 {
    if bytes >= INT64_MAX {
        -1
    } else {
        bytes
    }
}

impl Memory {
    pub fn new(base: ControllerBase) -> Self {
        Memory { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    fn write(&self, file: &str, value: i64) -> Result<()> {
        self.base.fs().safe_write(self.absolute_path().join(file), &value.to_string())
    }

    fn read_i64(&self, file: &str) -> Result<i64> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(file))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::failed_precondition(format!("malformed {file}")))
    }

    pub fn set_limit(&self, bytes: i64) -> Result<()> {
        self.write(MEMORY_LIMIT_IN_BYTES, to_wire(bytes))
    }
    pub fn get_limit(&self) -> Result<i64> {
        self.read_i64(MEMORY_LIMIT_IN_BYTES)
    }

    pub fn set_soft_limit(&self, bytes: i64) -> Result<()> {
        self.write(MEMORY_SOFT_LIMIT_IN_BYTES, to_wire(bytes))
    }
    pub fn get_soft_limit(&self) -> Result<i64> {
        self.read_i64(MEMORY_SOFT_LIMIT_IN_BYTES)
    }

    pub fn set_swap_limit(&self, bytes: i64) -> Result<()> {
        self.write(MEMORY_SWAP_LIMIT_IN_BYTES, to_wire(bytes))
    }
    pub fn get_swap_limit(&self) -> Result<i64> {
        self.read_i64(MEMORY_SWAP_LIMIT_IN_BYTES)
    }

    pub fn set_stale_page_age(&self, cycles: i64) -> Result<()> {
        self.write(MEMORY_STALE_PAGE_AGE, cycles)
    }
    pub fn get_stale_page_age(&self) -> Result<i64> {
        self.read_i64(MEMORY_STALE_PAGE_AGE)
    }

    pub fn set_oom_score(&self, score: i64) -> Result<()> {
        self.write(MEMORY_OOM_SCORE, score)
    }
    pub fn get_oom_score(&self) -> Result<i64> {
        self.read_i64(MEMORY_OOM_SCORE)
    }

    pub fn set_compression_sampling_ratio(&self, ratio: i64) -> Result<()> {
        self.write(MEMORY_COMPRESSION_SAMPLING_RATIO, ratio)
    }
    pub fn get_compression_sampling_ratio(&self) -> Result<i64> {
        self.read_i64(MEMORY_COMPRESSION_SAMPLING_RATIO)
    }

    pub fn set_dirty_ratio(&self, pct: i64) -> Result<()> {
        self.write(MEMORY_DIRTY_RATIO, pct)
    }
    pub fn get_dirty_ratio(&self) -> Result<i64> {
        self.read_i64(MEMORY_DIRTY_RATIO)
    }

    pub fn set_dirty_background_ratio(&self, pct: i64) -> Result<()> {
        self.write(MEMORY_DIRTY_BACKGROUND_RATIO, pct)
    }
    pub fn get_dirty_background_ratio(&self) -> Result<i64> {
        self.read_i64(MEMORY_DIRTY_BACKGROUND_RATIO)
    }

    pub fn set_dirty_limit(&self, bytes: i64) -> Result<()> {
        self.write(MEMORY_DIRTY_LIMIT_IN_BYTES, to_wire(bytes))
    }
    pub fn get_dirty_limit(&self) -> Result<i64> {
        self.read_i64(MEMORY_DIRTY_LIMIT_IN_BYTES)
    }

    pub fn set_dirty_background_limit(&self, bytes: i64) -> Result<()> {
        self.write(MEMORY_DIRTY_BACKGROUND_LIMIT_IN_BYTES, to_wire(bytes))
    }
    pub fn get_dirty_background_limit(&self) -> Result<i64> {
        self.read_i64(MEMORY_DIRTY_BACKGROUND_LIMIT_IN_BYTES)
    }

    pub fn set_kmem_charge_usage(&self, enabled: bool) -> Result<()> {
        self.write(MEMORY_KMEM_CHARGE_USAGE, if enabled { 1 } else { 0 })
    }
    pub fn get_kmem_charge_usage(&self) -> Result<bool> {
        Ok(self.read_i64(MEMORY_KMEM_CHARGE_USAGE)? != 0)
    }

    pub fn get_usage(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(MEMORY_USAGE_IN_BYTES))
    }
    pub fn get_max_usage(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(MEMORY_MAX_USAGE_IN_BYTES))
    }
    pub fn get_swap_usage(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(MEMORY_SWAP_USAGE_IN_BYTES))
    }
    pub fn get_swap_max_usage(&self) -> Result<u64> {
        parse_single_value(
            self.base.fs(),
            &self.absolute_path().join(MEMORY_SWAP_MAX_USAGE_IN_BYTES),
        )
    }
    pub fn get_fail_count(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(MEMORY_FAILCNT))
    }

    /// `get_effective_limit()` — the `hierarchical_memory_limit` row of
    /// `memory.stat`.
    pub fn get_effective_limit(&self) -> Result<u64> {
        let stat = self.stat()?;
        stat.get("hierarchical_memory_limit")
            .copied()
            .ok_or_else(|| Error::failed_precondition("memory.stat missing hierarchical_memory_limit"))
    }

    fn stat(&self) -> Result<HashMap<String, u64>> {
        parse_flat_keyed_data(self.base.fs(), &self.absolute_path().join(MEMORY_STAT))
    }

    /// `get_memory_stats()` — splits `memory.stat` into the container's own
    /// counters and the hierarchy's (`total_`-prefixed) counters.
    pub fn get_memory_stats(&self) -> Result<MemoryStatData> {
        let stat = self.stat()?;
        let mut data = MemoryStatData::default();
        for (key, value) in stat {
            match key.strip_prefix("total_") {
                Some(rest) => data.hierarchical_data.set(rest, value),
                None => data.container_data.set(&key, value),
            }
        }
        Ok(data)
    }

    /// `get_working_set()` — `max(0, usage - stale)`. `stale` prefers
    /// `memory.idle_page_stats[stale]`; falls back to
    /// `total_inactive_anon + total_inactive_file` from `memory.stat` when
    /// the idle-page-stats file is absent.
    pub fn get_working_set(&self) -> Result<u64> {
        let usage = self.get_usage()?;

        let stale = match self.get_idle_page_stats() {
            Ok(idle) => idle.stale.unwrap_or(0),
            Err(e) if e.is_not_found() => {
                let stat = self.stat()?;
                stat.get("total_inactive_anon").copied().unwrap_or(0)
                    + stat.get("total_inactive_file").copied().unwrap_or(0)
            }
            Err(e) => return Err(e),
        };

        Ok(usage.saturating_sub(stale))
    }

    /// `get_numa_stats()` — `<name>=<total> N<level>=<count> ...` lines;
    /// `hierarchical_` prefix routes to the caller's hierarchical view.
    pub fn get_numa_stats(&self) -> Result<HashMap<String, HashMap<u32, u64>>> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(MEMORY_NUMA_STAT))?;
        let mut result: HashMap<String, HashMap<u32, u64>> = HashMap::new();
        for line in raw.lines() {
            let mut fields = line.split_whitespace();
            let head = fields
                .next()
                .ok_or_else(|| Error::failed_precondition(format!("malformed numa_stat line {line:?}")))?;
            let (name, _total) = head
                .split_once('=')
                .ok_or_else(|| Error::failed_precondition(format!("malformed numa_stat line {line:?}")))?;

            let mut levels = HashMap::new();
            for pair in fields {
                let Some(rest) = pair.strip_prefix('N') else { continue };
                let (level, count) = rest
                    .split_once('=')
                    .ok_or_else(|| Error::failed_precondition(format!("malformed numa entry {pair:?}")))?;
                let level: u32 = level
                    .parse()
                    .map_err(|_| Error::failed_precondition(format!("malformed numa level {level:?}")))?;
                let count: u64 = count
                    .parse()
                    .map_err(|_| Error::failed_precondition(format!("malformed numa count {count:?}")))?;
                if levels.insert(level, count).is_some() {
                    return Err(Error::failed_precondition(format!("duplicate numa level {level} in {pair:?}")));
                }
            }
            result.insert(name.to_string(), levels);
        }
        Ok(result)
    }

    /// `get_idle_page_stats()` — recognized keys `scans`, `stale`,
    /// `idle_[<age>_]{clean,dirty_file,dirty_swap} <n>`; absent age token
    /// means age 0.
    pub fn get_idle_page_stats(&self) -> Result<IdlePageStats> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(MEMORY_IDLE_PAGE_STATS))?;
        let mut stats = IdlePageStats::default();

        for line in raw.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::failed_precondition(format!("malformed idle_page_stats line {line:?}")))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::failed_precondition(format!("malformed idle_page_stats value {value:?}")))?;

            match key {
                "scans" => stats.scans = Some(value),
                "stale" => stats.stale = Some(value),
                _ => {
                    let Some(rest) = key.strip_prefix("idle_") else { continue };
                    let (age, kind) = match rest.rsplit_once('_') {
                        Some((age_str, kind)) if age_str.parse::<u32>().is_ok() => {
                            (age_str.parse().unwrap(), kind)
                        }
                        _ => (0, rest),
                    };
                    let bucket = match kind {
                        "clean" => &mut stats.idle_clean,
                        "dirty_file" => &mut stats.idle_dirty_file,
                        "dirty_swap" => &mut stats.idle_dirty_swap,
                        _ => continue,
                    };
                    bucket.insert(age, value);
                }
            }
        }

        Ok(stats)
    }

    pub fn get_compression_sampling_stats(&self) -> Result<CompressionSamplingStats> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(MEMORY_COMPRESSION_SAMPLING_STATS))?;
        let mut stats = CompressionSamplingStats::default();
        for line in raw.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::failed_precondition(format!("malformed line {line:?}")))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::failed_precondition(format!("malformed value {value:?}")))?;
            match key {
                "raw_size" => stats.raw_size = value,
                "compressed_size" => stats.compressed_size = value,
                "fifo_overflow" => stats.fifo_overflow = value,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// `register_oom_notification(cb)` — registers against
    /// `memory.oom_control` with empty arguments.
    pub fn register_oom_notification(&self, callback: NotificationCallback) -> Result<NotificationHandle> {
        self.register_notification("cgroup.event_control", MEMORY_OOM_CONTROL, "", callback)
    }

    /// `register_usage_threshold_notification(threshold, cb)`.
    pub fn register_usage_threshold_notification(
        &self,
        threshold: u64,
        callback: NotificationCallback,
    ) -> Result<NotificationHandle> {
        self.register_notification(
            "cgroup.event_control",
            MEMORY_USAGE_IN_BYTES,
            &threshold.to_string(),
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    #[test]
    fn wire_clamps_int64_max_to_negative_one() {
        assert_eq!(to_wire(INT64_MAX), -1);
        assert_eq!(to_wire(1024), 1024);
    }

    #[test]
    fn set_limit_clamps_at_wire() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MEMORY_LIMIT_IN_BYTES), "").unwrap();
        let memory = Memory::new(test_base(tmp.path()));

        memory.set_limit(INT64_MAX).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join(MEMORY_LIMIT_IN_BYTES)).unwrap(),
            "-1"
        );
    }

    #[test]
    fn working_set_falls_back_to_memory_stat_without_idle_page_stats() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MEMORY_USAGE_IN_BYTES), "1000").unwrap();
        std::fs::write(
            tmp.path().join(MEMORY_STAT),
            "total_inactive_anon 100\ntotal_inactive_file 200\n",
        )
        .unwrap();
        let memory = Memory::new(test_base(tmp.path()));

        assert_eq!(memory.get_working_set().unwrap(), 700);
    }

    #[test]
    fn working_set_uses_idle_page_stats_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MEMORY_USAGE_IN_BYTES), "1000").unwrap();
        std::fs::write(tmp.path().join(MEMORY_IDLE_PAGE_STATS), "stale 400\n").unwrap();
        let memory = Memory::new(test_base(tmp.path()));

        assert_eq!(memory.get_working_set().unwrap(), 600);
    }

    #[test]
    fn idle_page_stats_parses_aged_keys() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(MEMORY_IDLE_PAGE_STATS),
            "scans 3\nstale 10\nidle_clean 5\nidle_1_clean 7\n",
        )
        .unwrap();
        let memory = Memory::new(test_base(tmp.path()));

        let stats = memory.get_idle_page_stats().unwrap();
        assert_eq!(stats.scans, Some(3));
        assert_eq!(stats.idle_clean.get(&0), Some(&5));
        assert_eq!(stats.idle_clean.get(&1), Some(&7));
    }

    #[test]
    fn memory_stats_splits_container_and_hierarchical_data() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(MEMORY_STAT),
            "cache 100\ninactive_file 30\nactive_file 70\n\
             thp_fault_alloc 4\nkernel_stack 50\nkernel_noncharged_slab 9\n\
             compression_compress_count 2\nzswap_pool_limit_hit 1\n\
             total_cache 200\ntotal_inactive_file 60\ntotal_active_file 140\n\
             unknown_key 999\n",
        )
        .unwrap();
        let memory = Memory::new(test_base(tmp.path()));

        let stats = memory.get_memory_stats().unwrap();
        let container = &stats.container_data;
        assert_eq!(container.cache, Some(100));
        assert_eq!(container.inactive_file.unwrap() + container.active_file.unwrap(), 100);
        assert_eq!(container.thp.get("fault_alloc"), Some(&4));
        assert_eq!(container.kernel.get("stack"), Some(&50));
        assert_eq!(container.kernel_noncharged.get("slab"), Some(&9));
        assert_eq!(container.compression.get("compress_count"), Some(&2));
        assert_eq!(container.compression.get("pool_limit_hit"), Some(&1));

        let hierarchical = &stats.hierarchical_data;
        assert_eq!(hierarchical.cache, Some(200));
        assert_eq!(
            hierarchical.inactive_file.unwrap() + hierarchical.active_file.unwrap(),
            200
        );
    }

    #[test]
    fn numa_stats_rejects_duplicate_level() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MEMORY_NUMA_STAT), "total=10 N0=5 N0=5\n").unwrap();
        let memory = Memory::new(test_base(tmp.path()));
        let err = memory.get_numa_stats().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FailedPrecondition);
    }
}
