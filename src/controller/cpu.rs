//! The `cpu` subsystem. Grounded on `containers-youki`'s `v1::cpu::Cpu`
//! (shares/period/quota clamp-and-write pattern, `cpu.stat` parsing via
//! [`crate::parsing::parse_flat_keyed_data`]).

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

use super::{CgroupController, ControllerBase};

const CPU_SHARES: &str = "cpu.shares";
const CPU_CFS_PERIOD_US: &str = "cpu.cfs_period_us";
const CPU_CFS_QUOTA_US: &str = "cpu.cfs_quota_us";
const CPU_LAT: &str = "cpu.lat";
const CPU_PLACEMENT_STRATEGY: &str = "cpu.placement_strategy";
const CPU_STAT: &str = "cpu.stat";

const KERNEL_MIN_SHARES: i64 = 2;
const DEFAULT_PERIOD_MS: i64 = 100;

/// Premier/Priority/Normal/BestEffort map to `cpu.lat` values of
/// 25/50/100/-1 respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LatencyClass {
    Premier,
    Priority,
    Normal,
    BestEffort,
}

impl LatencyClass {
    fn cpu_lat_value(self) -> i64 {
        match self {
            LatencyClass::Premier => 25,
            LatencyClass::Priority => 50,
            LatencyClass::Normal => 100,
            LatencyClass::BestEffort => -1,
        }
    }

    fn from_cpu_lat_value(value: i64) -> Result<Self> {
        match value {
            25 => Ok(LatencyClass::Premier),
            50 => Ok(LatencyClass::Priority),
            100 => Ok(LatencyClass::Normal),
            -1 => Ok(LatencyClass::BestEffort),
            other => Err(Error::failed_precondition(format!("unrecognized cpu.lat value {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottlingStats {
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub throttled_time: u64,
}

pub struct Cpu {
    base: ControllerBase,
    throttling_period_ms: i64,
}

impl CgroupController for Cpu {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl Cpu {
    pub fn new(base: ControllerBase) -> Self {
        Cpu {
            base,
            throttling_period_ms: DEFAULT_PERIOD_MS,
        }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    /// `set_milli_cpus(mcpus)` — writes `clamp(mcpus * 1024 / 1000, 2, inf)`.
    pub fn set_milli_cpus(&self, mcpus: i64) -> Result<()> {
        let shares = (mcpus * 1024 / 1000).max(KERNEL_MIN_SHARES);
        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPU_SHARES), &shares.to_string())
    }

    /// `get_milli_cpus()` — inverse of `set_milli_cpus`: `cpu.shares * 1000 / 1024`.
    pub fn get_milli_cpus(&self) -> Result<i64> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPU_SHARES))?;
        let shares: i64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cpu.shares"))?;
        Ok(shares * 1000 / 1024)
    }

    /// `set_max_milli_cpus(mcpus)` — two-file update, period then quota.
    pub fn set_max_milli_cpus(&self, mcpus: i64) -> Result<()> {
        let period_us = self.throttling_period_ms * 1000;
        let quota_us = period_us * mcpus / 1000;
        if quota_us < 1 {
            return Err(Error::invalid_argument(format!(
                "{mcpus} milli-cpus rounds to a zero quota for a {period_us}us period"
            )));
        }

        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPU_CFS_PERIOD_US), &period_us.to_string())?;
        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPU_CFS_QUOTA_US), &quota_us.to_string())
    }

    /// `get_max_milli_cpus()` — `-1` means uncapped, returned verbatim.
    pub fn get_max_milli_cpus(&self) -> Result<i64> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(CPU_CFS_QUOTA_US))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cpu.cfs_quota_us"))
    }

    pub fn set_latency(&self, class: LatencyClass) -> Result<()> {
        self.base
            .fs()
            .safe_write(self.absolute_path().join(CPU_LAT), &class.cpu_lat_value().to_string())
    }

    pub fn get_latency(&self) -> Result<LatencyClass> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPU_LAT))?;
        let value: i64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cpu.lat"))?;
        LatencyClass::from_cpu_lat_value(value)
    }

    pub fn set_placement_strategy(&self, strategy: i64) -> Result<()> {
        self.base.fs().safe_write(
            self.absolute_path().join(CPU_PLACEMENT_STRATEGY),
            &strategy.to_string(),
        )
    }

    /// `get_placement_strategy()` — read verbatim, no validation.
    pub fn get_placement_strategy(&self) -> Result<i64> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(CPU_PLACEMENT_STRATEGY))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cpu.placement_strategy"))
    }

    /// `get_throttling_stats()` — whitespace key/value lines in `cpu.stat`;
    /// lines that aren't exactly `<key> <value>` and keys outside the three
    /// this returns are ignored; missing required keys fail.
    pub fn get_throttling_stats(&self) -> Result<ThrottlingStats> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPU_STAT))?;
        let mut data: HashMap<&str, u64> = HashMap::new();
        for line in raw.lines() {
            let mut fields = line.split_ascii_whitespace();
            let (Some(key), Some(value), None) = (fields.next(), fields.next(), fields.next()) else {
                continue;
            };
            if let Ok(value) = value.parse() {
                data.insert(key, value);
            }
        }
        let get = |key: &str| -> Result<u64> {
            data.get(key)
                .copied()
                .ok_or_else(|| Error::failed_precondition(format!("cpu.stat missing {key}")))
        };
        Ok(ThrottlingStats {
            nr_periods: get("nr_periods")?,
            nr_throttled: get("nr_throttled")?,
            throttled_time: get("throttled_time")?,
        })
    }
}
