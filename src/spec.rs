//! The `ContainerSpec`/`ContainerStats`/`EventSpec` plain-data records the
//! resource-handler layer maps onto controller calls.
//!
//! `containers-youki` consumes an OCI runtime spec once at create time
//! instead of this declarative update/diff model; this module is grounded
//! directly on lmctfy's `container_spec.proto`/`container_stats.proto`
//! shape, expressed as plain Rust structs with `Option` fields standing in
//! for protobuf's optional-field-presence semantics.

use crate::controller::blkio::{DeviceLimit, MaxLimits};
use crate::controller::cpu::{LatencyClass, ThrottlingStats};
use crate::controller::cpuacct::CpuTime;
use crate::controller::device::DeviceRestriction;
use crate::controller::memory::MemoryStatData;

pub const INT64_MAX: i64 = i64::MAX;

/// Diff merges `adjusted` onto the kernel's current spec field-by-field;
/// Replace first fills every absent field in `adjusted` with its documented
/// default before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdatePolicy {
    Diff,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemorySpec {
    pub limit: Option<i64>,
    pub soft_limit: Option<i64>,
    pub swap_limit: Option<i64>,
    pub stale_page_age: Option<i64>,
    pub oom_score: Option<i64>,
    pub compression_sampling_ratio: Option<i64>,
    pub dirty_ratio: Option<i64>,
    pub dirty_background_ratio: Option<i64>,
    pub dirty_limit: Option<i64>,
    pub dirty_background_limit: Option<i64>,
    pub kmem_charge_usage: Option<bool>,
}

impl MemorySpec {
    /// Defaults applied on a replace-policy update: limits unlimited, dirty
    /// ratios at the kernel's historical defaults, oom_score mid-range, kmem
    /// charging off.
    pub fn fill_defaults(&mut self) {
        self.limit.get_or_insert(INT64_MAX);
        self.soft_limit.get_or_insert(INT64_MAX);
        self.swap_limit.get_or_insert(INT64_MAX);
        self.dirty_ratio.get_or_insert(75);
        self.dirty_background_ratio.get_or_insert(10);
        self.oom_score.get_or_insert(5000);
        self.kmem_charge_usage.get_or_insert(false);
    }

    pub fn merge_onto(self, current: &MemorySpec) -> MemorySpec {
        MemorySpec {
            limit: self.limit.or(current.limit),
            soft_limit: self.soft_limit.or(current.soft_limit),
            swap_limit: self.swap_limit.or(current.swap_limit),
            stale_page_age: self.stale_page_age.or(current.stale_page_age),
            oom_score: self.oom_score.or(current.oom_score),
            compression_sampling_ratio: self.compression_sampling_ratio.or(current.compression_sampling_ratio),
            dirty_ratio: self.dirty_ratio.or(current.dirty_ratio),
            dirty_background_ratio: self.dirty_background_ratio.or(current.dirty_background_ratio),
            dirty_limit: self.dirty_limit.or(current.dirty_limit),
            dirty_background_limit: self.dirty_background_limit.or(current.dirty_background_limit),
            kmem_charge_usage: self.kmem_charge_usage.or(current.kmem_charge_usage),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub usage: Option<u64>,
    pub max_usage: Option<u64>,
    pub swap_usage: Option<u64>,
    pub swap_max_usage: Option<u64>,
    pub fail_count: Option<u64>,
    pub effective_limit: Option<u64>,
    pub working_set: Option<u64>,
    pub memory_stats: Option<MemoryStatData>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CpuSpec {
    pub milli_cpus: Option<u32>,
    pub max_milli_cpus: Option<i64>,
    pub latency: Option<LatencyClass>,
    pub placement_strategy: Option<i64>,
}

impl CpuSpec {
    pub fn merge_onto(self, current: &CpuSpec) -> CpuSpec {
        CpuSpec {
            milli_cpus: self.milli_cpus.or(current.milli_cpus),
            max_milli_cpus: self.max_milli_cpus.or(current.max_milli_cpus),
            latency: self.latency.or(current.latency),
            placement_strategy: self.placement_strategy.or(current.placement_strategy),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuStats {
    pub throttling: Option<ThrottlingStats>,
    pub usage_ns: Option<u64>,
    pub cpu_time: Option<CpuTime>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockIoSpec {
    pub default_limit: Option<u32>,
    pub per_device_limits: Option<Vec<DeviceLimit>>,
}

impl BlockIoSpec {
    pub fn merge_onto(self, current: &BlockIoSpec) -> BlockIoSpec {
        BlockIoSpec {
            default_limit: self.default_limit.or(current.default_limit),
            per_device_limits: self.per_device_limits.or_else(|| current.per_device_limits.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockIoStats {
    pub default_limit: Option<u32>,
    pub device_limits: Option<Vec<DeviceLimit>>,
    pub max_limits: Option<MaxLimits>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceSpec {
    pub restrictions: Option<Vec<DeviceRestriction>>,
}

impl DeviceSpec {
    pub fn merge_onto(self, current: &DeviceSpec) -> DeviceSpec {
        DeviceSpec {
            restrictions: self.restrictions.or_else(|| current.restrictions.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    pub state: Option<Vec<DeviceRestriction>>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FilesystemSpec {
    pub fd_limit: Option<u64>,
}

impl FilesystemSpec {
    pub fn fill_defaults(&mut self) {
        self.fd_limit.get_or_insert(INT64_MAX as u64);
    }

    pub fn merge_onto(self, current: &FilesystemSpec) -> FilesystemSpec {
        FilesystemSpec {
            fd_limit: self.fd_limit.or(current.fd_limit),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilesystemStats {
    pub fd_limit: Option<u64>,
    pub fd_usage: Option<u64>,
    pub fd_max_usage: Option<u64>,
    pub fd_fail_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContainerSpec {
    pub memory: Option<MemorySpec>,
    pub cpu: Option<CpuSpec>,
    pub block_io: Option<BlockIoSpec>,
    pub device: Option<DeviceSpec>,
    pub filesystem: Option<FilesystemSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub memory: Option<MemoryStats>,
    pub cpu: Option<CpuStats>,
    pub block_io: Option<BlockIoStats>,
    pub device: Option<DeviceStats>,
    pub filesystem: Option<FilesystemStats>,
}

/// At most one subtype is set; `register_notification` rejects anything
/// else with `InvalidArgument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventSpec {
    Oom,
    MemoryThreshold { usage: u64 },
}
