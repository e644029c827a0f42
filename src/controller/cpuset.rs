//! The `cpuset` subsystem. Grounded on `containers-youki`'s
//! `v1::cpuset::CpuSet` (`cpuset.cpus`/`cpuset.mems` direct string writes);
//! the canonical range-list codec additionally round-trips through a
//! bitmask, built with `fixedbitset` the same way `containers-youki`
//! already depends on it for device-cgroup bitmaps.

use std::collections::BTreeSet;
use std::path::Path;

use fixedbitset::FixedBitSet;

use crate::error::{Error, Result};

use super::{CgroupController, ControllerBase};

const CPUSET_CPUS: &str = "cpuset.cpus";
const CPUSET_MEMS: &str = "cpuset.mems";

/// A set of CPU (or memory node) ids, backed by a bitset so that
/// [`format_ranges`] always emits the canonical minimal range list
/// regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMask(FixedBitSet);

impl CpuMask {
    pub fn from_ids(ids: impl IntoIterator<Item = usize>) -> Self {
        let ids: Vec<usize> = ids.into_iter().collect();
        let len = ids.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut bits = FixedBitSet::with_capacity(len);
        for id in ids {
            bits.insert(id);
        }
        CpuMask(bits)
    }

    pub fn ids(&self) -> Vec<usize> {
        self.0.ones().collect()
    }
}

pub struct CpuSet {
    base: ControllerBase,
}

impl CgroupController for CpuSet {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl CpuSet {
    pub fn new(base: ControllerBase) -> Self {
        CpuSet { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    pub fn set_cpu_mask(&self, mask: &CpuMask) -> Result<()> {
        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPUSET_CPUS), &format_ranges(&mask.ids()))
    }

    pub fn get_cpu_mask(&self) -> Result<CpuMask> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPUSET_CPUS))?;
        Ok(CpuMask::from_ids(parse_ranges(&raw)?))
    }

    pub fn set_memory_nodes(&self, nodes: &BTreeSet<usize>) -> Result<()> {
        let ids: Vec<usize> = nodes.iter().copied().collect();
        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPUSET_MEMS), &format_ranges(&ids))
    }

    pub fn get_memory_nodes(&self) -> Result<BTreeSet<usize>> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPUSET_MEMS))?;
        Ok(parse_ranges(&raw)?.into_iter().collect())
    }
}

/// `"0-7,14,16-19"` -> sorted id list.
fn parse_ranges(raw: &str) -> Result<Vec<usize>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut ids = BTreeSet::new();
    for part in raw.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo
                .parse()
                .map_err(|_| Error::failed_precondition(format!("malformed range {part:?}")))?;
            let hi: usize = hi
                .parse()
                .map_err(|_| Error::failed_precondition(format!("malformed range {part:?}")))?;
            for id in lo..=hi {
                ids.insert(id);
            }
        } else {
            let id: usize = part
                .parse()
                .map_err(|_| Error::failed_precondition(format!("malformed entry {part:?}")))?;
            ids.insert(id);
        }
    }
    Ok(ids.into_iter().collect())
}

/// Sorted id list -> canonical minimal range list.
fn format_ranges(ids: &[usize]) -> String {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &id in ids {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == id => *end = id,
            _ => ranges.push((id, id)),
        }
    }
    ranges
        .into_iter()
        .map(|(lo, hi)| if lo == hi { lo.to_string() } else { format!("{lo}-{hi}") })
        .collect::<Vec<_>>()
        .join(",")
}
