//! The closed set of cgroup v1 hierarchy kinds and the registry that
//! discovers which of them are mounted, where, and who owns each co-mounted
//! directory.
//!
//! The mountinfo walk and the `cpu`/`cpuacct`, `net_cls`/`net_prio` co-mount
//! special-casing follow the same shape as `containers-youki`'s subsystem
//! mount-point lookup.

use std::collections::HashMap;
use std::path::PathBuf;

use procfs::process::Process;

use crate::error::{Error, Result};

/// Closed tagged set of cgroup v1 hierarchies. Only the first eight
/// variants have a concrete [`crate::controller`] type with resource-specific
/// operations; `PerfEvent`, `Net`, and `Job` are recognized for mount
/// discovery and ownership bookkeeping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HierarchyKind {
    Job,
    Cpu,
    Memory,
    BlockIo,
    Device,
    Freezer,
    RLimit,
    CpuSet,
    CpuAcct,
    PerfEvent,
    Net,
}

/// Priority order used to break co-mount ownership ties. The earliest kind
/// present in a mount's subsystem list owns the directory.
pub const OWNERSHIP_PRIORITY: &[HierarchyKind] = &[
    HierarchyKind::Job,
    HierarchyKind::Cpu,
    HierarchyKind::Memory,
    HierarchyKind::BlockIo,
    HierarchyKind::Device,
    HierarchyKind::Freezer,
    HierarchyKind::RLimit,
    HierarchyKind::CpuSet,
    HierarchyKind::CpuAcct,
    HierarchyKind::PerfEvent,
    HierarchyKind::Net,
];

/// All kinds with a concrete controller.
pub const CONTROLLED_KINDS: &[HierarchyKind] = &[
    HierarchyKind::Cpu,
    HierarchyKind::CpuAcct,
    HierarchyKind::CpuSet,
    HierarchyKind::Memory,
    HierarchyKind::BlockIo,
    HierarchyKind::Freezer,
    HierarchyKind::Device,
    HierarchyKind::RLimit,
];

impl HierarchyKind {
    /// Canonical subsystem name as it appears in `/proc/cgroups`,
    /// `/proc/self/cgroup`, and a mount's comma-separated data field.
    ///
    /// `Job` has no corresponding Linux subsystem name: it is lmctfy's
    /// own top-level grouping hierarchy, not a kernel subsystem, so it
    /// never matches a real mount and always sorts first in
    /// [`OWNERSHIP_PRIORITY`] without being found.
    pub fn canonical_name(self) -> &'static str {
        match self {
            HierarchyKind::Job => "job",
            HierarchyKind::Cpu => "cpu",
            HierarchyKind::Memory => "memory",
            HierarchyKind::BlockIo => "blkio",
            HierarchyKind::Device => "devices",
            HierarchyKind::Freezer => "freezer",
            HierarchyKind::RLimit => "rlimit",
            HierarchyKind::CpuSet => "cpuset",
            HierarchyKind::CpuAcct => "cpuacct",
            HierarchyKind::PerfEvent => "perf_event",
            HierarchyKind::Net => "net_cls",
        }
    }

    fn from_canonical_name(name: &str) -> Option<Self> {
        CONTROLLED_KINDS
            .iter()
            .chain([HierarchyKind::PerfEvent, HierarchyKind::Net, HierarchyKind::Job].iter())
            .copied()
            .find(|k| k.canonical_name() == name)
            .or_else(|| {
                // net_prio co-mounts with net_cls; both resolve to Net.
                if name == "net_prio" {
                    Some(HierarchyKind::Net)
                } else {
                    None
                }
            })
    }
}

/// `(absolute_path, owns)`. `owns` is true iff this kind is responsible
/// for creating/removing the cgroup directory at a co-mounted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub absolute_path: PathBuf,
    pub owns: bool,
}

/// Discovers mounted hierarchies and their ownership bindings at
/// construction time; answers the static-mapping and mount-table queries.
#[derive(Debug, Clone, Default)]
pub struct HierarchyRegistry {
    mounts: HashMap<HierarchyKind, MountPoint>,
}

impl HierarchyRegistry {
    /// Builds a registry by walking the process's mountinfo via `procfs`,
    /// the same way `containers-youki`'s `get_subsystem_mount_point` does.
    pub fn discover() -> Result<Self> {
        let mountinfo = Process::myself()
            .map_err(|e| Error::internal(format!("failed to read /proc/self: {e}")))?
            .mountinfo()
            .map_err(|e| Error::internal(format!("failed to read mountinfo: {e}")))?;

        let mut registry = HierarchyRegistry::default();
        for mount in mountinfo.into_iter().filter(|m| m.fs_type == "cgroup") {
            // The cgroup data field (super_options) enumerates co-mounted
            // subsystem names, in order, as bare option flags.
            let names = subsystem_names_for_mount(&mount);
            let kinds: Vec<HierarchyKind> = names
                .iter()
                .filter_map(|n| HierarchyKind::from_canonical_name(n))
                .collect();
            if kinds.is_empty() {
                continue;
            }
            registry.record_comount(&kinds, mount.mount_point);
        }
        Ok(registry)
    }

    /// Registers an already-resolved set of co-mounted kinds at one path,
    /// used both by [`discover`](Self::discover) and by
    /// [`crate::factory::CgroupFactory::mount`] after a successful mount.
    pub fn record_comount(&mut self, kinds: &[HierarchyKind], path: PathBuf) {
        let owner = OWNERSHIP_PRIORITY
            .iter()
            .find(|k| kinds.contains(k))
            .copied();
        for &kind in kinds {
            let owns = owner == Some(kind);
            self.mounts.insert(
                kind,
                MountPoint {
                    absolute_path: path.clone(),
                    owns,
                },
            );
        }
    }

    pub fn mount_point(&self, kind: HierarchyKind) -> Option<&MountPoint> {
        self.mounts.get(&kind)
    }

    pub fn is_mounted(&self, kind: HierarchyKind) -> bool {
        self.mounts.contains_key(&kind)
    }

    pub fn owns_cgroup(&self, kind: HierarchyKind) -> bool {
        self.mounts.get(&kind).map(|m| m.owns).unwrap_or(false)
    }

    pub fn mounted_kinds(&self) -> impl Iterator<Item = HierarchyKind> + '_ {
        self.mounts.keys().copied()
    }

    /// Parses `/proc/cgroups`, dropping subsystems with `enabled = 0`.
    pub fn get_supported() -> Result<Vec<HierarchyKind>> {
        let raw = std::fs::read_to_string("/proc/cgroups")
            .map_err(|e| Error::internal(format!("failed to read /proc/cgroups: {e}")))?;
        let mut supported = Vec::new();
        for line in raw.lines() {
            if line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            let enabled = fields[3] == "1";
            if !enabled {
                continue;
            }
            if let Some(kind) = HierarchyKind::from_canonical_name(fields[0]) {
                supported.push(kind);
            }
        }
        Ok(supported)
    }
}

fn subsystem_names_for_mount(mount: &procfs::process::MountInfo) -> Vec<String> {
    // The cgroup v1 data field (co-mounted subsystem list) is exposed by
    // procfs as the super_options keys for a `cgroup`-typed mount (e.g.
    // `cpu`, `cpuacct`, `noexec`, ...); real subsystem names are the ones
    // matching a known canonical name.
    mount.super_options.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_priority_picks_first_listed() {
        let mut registry = HierarchyRegistry::default();
        registry.record_comount(
            &[HierarchyKind::CpuAcct, HierarchyKind::Cpu],
            PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"),
        );
        assert!(registry.owns_cgroup(HierarchyKind::Cpu));
        assert!(!registry.owns_cgroup(HierarchyKind::CpuAcct));
        assert_eq!(
            registry.mount_point(HierarchyKind::Cpu).unwrap().absolute_path,
            registry.mount_point(HierarchyKind::CpuAcct).unwrap().absolute_path
        );
    }

    #[test]
    fn net_cls_and_net_prio_co_mount_to_net() {
        assert_eq!(
            HierarchyKind::from_canonical_name("net_prio"),
            Some(HierarchyKind::Net)
        );
        assert_eq!(
            HierarchyKind::from_canonical_name("net_cls"),
            Some(HierarchyKind::Net)
        );
    }

    #[test]
    fn unmounted_kind_reports_not_owning() {
        let registry = HierarchyRegistry::default();
        assert!(!registry.owns_cgroup(HierarchyKind::Memory));
        assert!(!registry.is_mounted(HierarchyKind::Memory));
    }
}
