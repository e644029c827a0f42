//! Cpu resource domain. Grounded on lmctfy's `cpu_resource_handler.cc`,
//! composing [`crate::controller::cpu::Cpu`] and
//! [`crate::controller::cpuacct::CpuAcct`] as one domain covering both CPU
//! scheduling and accounting.

use tracing::debug;

use crate::controller::cpu::Cpu;
use crate::controller::cpuacct::CpuAcct;
use crate::error::Result;
use crate::spec::{CpuSpec, CpuStats, UpdatePolicy};

use super::ResourceHandler;

pub struct CpuResourceHandler {
    cpu: Cpu,
    cpuacct: CpuAcct,
}

impl CpuResourceHandler {
    pub fn new(cpu: Cpu, cpuacct: CpuAcct) -> Self {
        CpuResourceHandler { cpu, cpuacct }
    }

    fn do_update(&self, adjusted: &CpuSpec) -> Result<()> {
        if let Some(v) = adjusted.milli_cpus {
            debug!(milli_cpus = v, "apply cpu.shares");
            self.cpu.set_milli_cpus(v as i64)?;
        }
        if let Some(v) = adjusted.max_milli_cpus {
            debug!(max_milli_cpus = v, "apply cpu.cfs_quota_us");
            self.cpu.set_max_milli_cpus(v)?;
        }
        if let Some(v) = adjusted.latency {
            self.cpu.set_latency(v)?;
        }
        if let Some(v) = adjusted.placement_strategy {
            self.cpu.set_placement_strategy(v)?;
        }
        Ok(())
    }
}

impl ResourceHandler for CpuResourceHandler {
    type Spec = CpuSpec;
    type Stats = CpuStats;

    fn create_resource(&self, _spec: &CpuSpec) -> Result<()> {
        Ok(())
    }

    fn update(&self, spec: &CpuSpec, policy: UpdatePolicy) -> Result<()> {
        let mut adjusted = spec.clone();
        if policy == UpdatePolicy::Replace {
            adjusted.placement_strategy.get_or_insert(0);
        }
        let current = self.spec()?;
        let adjusted = adjusted.merge_onto(&current);
        self.do_update(&adjusted)
    }

    fn stats(&self) -> Result<CpuStats> {
        let mut stats = CpuStats::default();
        stats.throttling = ignore_not_found(self.cpu.get_throttling_stats())?;
        stats.usage_ns = ignore_not_found(self.cpuacct.get_cpu_usage_ns())?;
        stats.cpu_time = ignore_not_found(self.cpuacct.get_cpu_time())?;
        Ok(stats)
    }

    fn spec(&self) -> Result<CpuSpec> {
        Ok(CpuSpec {
            milli_cpus: ignore_not_found(self.cpu.get_milli_cpus())?.map(|v| v as u32),
            max_milli_cpus: ignore_not_found(self.cpu.get_max_milli_cpus())?,
            latency: ignore_not_found(self.cpu.get_latency())?,
            placement_strategy: ignore_not_found(self.cpu.get_placement_strategy())?,
        })
    }
}

fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
