//! The `cpuacct` subsystem: usage accounting and scheduler latency
//! histograms. Grounded on `containers-youki`'s `v1::cpuacct::CpuAcct`
//! (`cpuacct.stat`/`cpuacct.usage_percpu` parsing via
//! [`crate::parsing::parse_flat_keyed_data`]); the histogram operations have
//! no analog there and are built directly from `cpuacct.histogram`'s
//! section format.

use std::path::Path;

use crate::error::{Error, Result};
use crate::parsing::parse_flat_keyed_data;

use super::{CgroupController, ControllerBase};

const CPUACCT_USAGE: &str = "cpuacct.usage";
const CPUACCT_USAGE_PERCPU: &str = "cpuacct.usage_percpu";
const CPUACCT_STAT: &str = "cpuacct.stat";
const CPUACCT_HISTOGRAM: &str = "cpuacct.histogram";
const SCHED_HISTOGRAM_SYSCTL: &str = "/proc/sys/kernel/sched_histogram";

const QUEUE_BUCKETS: &[i64] = &[1000, 5000, 10000, 25000, 75000, 100000, 500000];
const NON_QUEUE_BUCKETS: &[i64] = &[1000, 5000, 10000, 20000, 50000, 100000, 250000];
const HISTOGRAM_NAMES: &[&str] = &["serve", "oncpu", "sleep", "queue_self", "queue_other"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub user_ns: u64,
    pub system_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramBucket {
    pub upper_bound: i64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuHistogramData {
    pub name: String,
    pub buckets: Vec<HistogramBucket>,
}

pub struct CpuAcct {
    base: ControllerBase,
    clock_ticks_per_second: u64,
}

impl CgroupController for CpuAcct {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl CpuAcct {
    pub fn new(base: ControllerBase) -> Self {
        let clock_ticks_per_second = sysconf_clock_ticks();
        CpuAcct {
            base,
            clock_ticks_per_second,
        }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    pub fn get_cpu_usage_ns(&self) -> Result<u64> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(CPUACCT_USAGE))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cpuacct.usage"))
    }

    pub fn get_per_cpu_usage_ns(&self) -> Result<Vec<u64>> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(CPUACCT_USAGE_PERCPU))?;
        raw.split_whitespace()
            .map(|v| v.parse().map_err(|_| Error::failed_precondition("malformed cpuacct.usage_percpu")))
            .collect()
    }

    /// `get_cpu_time()` — `cpuacct.stat` reports user/system in USER_HZ
    /// ticks; convert to nanoseconds via `sysconf(_SC_CLK_TCK)`.
    pub fn get_cpu_time(&self) -> Result<CpuTime> {
        let stat = parse_flat_keyed_data(self.base.fs(), &self.absolute_path().join(CPUACCT_STAT))?;
        let ticks_to_ns = |ticks: u64| ticks * 1_000_000_000 / self.clock_ticks_per_second;
        let get = |key: &str| -> Result<u64> {
            stat.get(key)
                .copied()
                .ok_or_else(|| Error::failed_precondition(format!("cpuacct.stat missing {key}")))
        };
        Ok(CpuTime {
            user_ns: ticks_to_ns(get("user")?),
            system_ns: ticks_to_ns(get("system")?),
        })
    }

    /// Writes the five fixed control lines `cpuacct.histogram` expects
    /// before it starts accumulating samples.
    pub fn setup_histograms(&self) -> Result<()> {
        for name in HISTOGRAM_NAMES {
            let buckets = if name.starts_with("queue") {
                QUEUE_BUCKETS
            } else {
                NON_QUEUE_BUCKETS
            };
            let line = format!(
                "{name} {}",
                buckets.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(" ")
            );
            self.base
                .fs()
                .safe_write(self.absolute_path().join(CPUACCT_HISTOGRAM), &line)?;
        }
        Ok(())
    }

    pub fn enable_scheduler_histograms(&self) -> Result<()> {
        self.base.fs().safe_write(SCHED_HISTOGRAM_SYSCTL, "1")
    }

    /// Parses the multi-section `cpuacct.histogram` format.
    pub fn get_scheduler_histograms(&self) -> Result<Vec<CpuHistogramData>> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(CPUACCT_HISTOGRAM))?;
        let mut lines = raw.lines();

        match lines.next() {
            Some("unit: us") => {}
            _ => return Err(Error::internal("Malformed histogram data.")),
        }

        let mut result = Vec::new();
        while let Some(name_line) = lines.next() {
            let name = name_line.trim();
            if name.is_empty() {
                continue;
            }
            if !HISTOGRAM_NAMES.contains(&name) {
                return Err(Error::internal(format!("Unknown histogram name {name}")));
            }

            // "bucket count" header line, ignored beyond presence.
            lines.next();

            let mut buckets = Vec::new();
            loop {
                let Some(line) = lines.next() else { break };
                let line = line.trim();
                if line.is_empty() {
                    break;
                }
                let Some(rest) = line.strip_prefix('<') else { break };
                let mut parts = rest.split_whitespace();
                let bound_token = parts
                    .next()
                    .ok_or_else(|| Error::internal("Failed to parse int from string"))?;
                let count_token = parts
                    .next()
                    .ok_or_else(|| Error::internal("Failed to parse int from string"))?;

                let upper_bound = if bound_token == "inf" {
                    i32::MAX as i64
                } else {
                    bound_token
                        .parse()
                        .map_err(|_| Error::internal(format!("Failed to parse int from string {bound_token:?}")))?
                };
                let count = count_token
                    .parse()
                    .map_err(|_| Error::internal(format!("Failed to parse int from string {count_token:?}")))?;
                let is_inf = bound_token == "inf";
                buckets.push(HistogramBucket { upper_bound, count });
                if is_inf {
                    break;
                }
            }

            result.push(CpuHistogramData {
                name: name.to_string(),
                buckets,
            });
        }

        Ok(result)
    }
}

fn sysconf_clock_ticks() -> u64 {
    // SC_CLK_TCK is universally 100 on Linux; nix does not expose sysconf
    // directly for this value, and it has not changed since the early 2.6
    // kernels, so it is hardcoded the way most container runtimes do.
    100
}
