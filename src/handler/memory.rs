//! Memory resource domain. Grounded on lmctfy's
//! `memory_resource_handler.cc` `Update`/`Spec`/`Stats` sequencing, driving
//! [`crate::controller::memory::Memory`].

use tracing::debug;

use crate::controller::memory::Memory;
use crate::error::Result;
use crate::events::{NotificationCallback, NotificationHandle};
use crate::spec::{EventSpec, MemorySpec, MemoryStats, UpdatePolicy};

use super::{tolerate_missing_feature, ResourceHandler};

pub struct MemoryResourceHandler {
    memory: Memory,
}

impl MemoryResourceHandler {
    pub fn new(memory: Memory) -> Self {
        MemoryResourceHandler { memory }
    }

    fn do_update(&self, adjusted: &MemorySpec) -> Result<()> {
        if let Some(v) = adjusted.limit {
            debug!(value = v, "apply memory.limit_in_bytes");
            self.memory.set_limit(v)?;
        }
        if let Some(v) = adjusted.soft_limit {
            debug!(value = v, "apply memory.soft_limit_in_bytes");
            self.memory.set_soft_limit(v)?;
        }
        if let Some(v) = adjusted.swap_limit {
            debug!(value = v, "apply memory.memsw.limit_in_bytes");
            self.memory.set_swap_limit(v)?;
        }
        if let Some(v) = adjusted.stale_page_age {
            tolerate_missing_feature(self.memory.set_stale_page_age(v))?;
        }
        if let Some(v) = adjusted.oom_score {
            tolerate_missing_feature(self.memory.set_oom_score(v))?;
        }
        if let Some(v) = adjusted.compression_sampling_ratio {
            tolerate_missing_feature(self.memory.set_compression_sampling_ratio(v))?;
        }
        if let Some(v) = adjusted.dirty_ratio {
            self.memory.set_dirty_ratio(v)?;
        }
        if let Some(v) = adjusted.dirty_background_ratio {
            self.memory.set_dirty_background_ratio(v)?;
        }
        if let Some(v) = adjusted.dirty_limit {
            self.memory.set_dirty_limit(v)?;
        }
        if let Some(v) = adjusted.dirty_background_limit {
            self.memory.set_dirty_background_limit(v)?;
        }
        if let Some(v) = adjusted.kmem_charge_usage {
            tolerate_missing_feature(self.memory.set_kmem_charge_usage(v))?;
        }
        Ok(())
    }
}

impl ResourceHandler for MemoryResourceHandler {
    type Spec = MemorySpec;
    type Stats = MemoryStats;

    /// Enables kstaled (stale-page tracking) where the kernel supports it;
    /// absent on kernels without the feature, which is not fatal.
    fn create_resource(&self, _spec: &MemorySpec) -> Result<()> {
        tolerate_missing_feature(self.memory.set_stale_page_age(1))
    }

    fn update(&self, spec: &MemorySpec, policy: UpdatePolicy) -> Result<()> {
        let mut adjusted = spec.clone();
        if policy == UpdatePolicy::Replace {
            adjusted.fill_defaults();
        }
        let current = self.spec()?;
        let adjusted = adjusted.merge_onto(&current);
        verify_full_spec(&adjusted)?;
        self.do_update(&adjusted)
    }

    fn stats(&self) -> Result<MemoryStats> {
        let mut stats = MemoryStats::default();
        stats.usage = ignore_not_found(self.memory.get_usage())?;
        stats.max_usage = ignore_not_found(self.memory.get_max_usage())?;
        stats.swap_usage = ignore_not_found(self.memory.get_swap_usage())?;
        stats.swap_max_usage = ignore_not_found(self.memory.get_swap_max_usage())?;
        stats.fail_count = ignore_not_found(self.memory.get_fail_count())?;
        stats.effective_limit = ignore_not_found(self.memory.get_effective_limit())?;
        stats.working_set = ignore_not_found(self.memory.get_working_set())?;
        stats.memory_stats = ignore_not_found(self.memory.get_memory_stats())?;
        Ok(stats)
    }

    fn spec(&self) -> Result<MemorySpec> {
        Ok(MemorySpec {
            limit: ignore_not_found(self.memory.get_limit())?,
            soft_limit: ignore_not_found(self.memory.get_soft_limit())?,
            swap_limit: ignore_not_found(self.memory.get_swap_limit())?,
            stale_page_age: ignore_not_found(self.memory.get_stale_page_age())?,
            oom_score: ignore_not_found(self.memory.get_oom_score())?,
            compression_sampling_ratio: ignore_not_found(self.memory.get_compression_sampling_ratio())?,
            dirty_ratio: ignore_not_found(self.memory.get_dirty_ratio())?,
            dirty_background_ratio: ignore_not_found(self.memory.get_dirty_background_ratio())?,
            dirty_limit: ignore_not_found(self.memory.get_dirty_limit())?,
            dirty_background_limit: ignore_not_found(self.memory.get_dirty_background_limit())?,
            kmem_charge_usage: ignore_not_found(self.memory.get_kmem_charge_usage())?,
        })
    }

    fn register_notification(&self, event: &EventSpec, callback: NotificationCallback) -> Result<NotificationHandle> {
        match event {
            EventSpec::Oom => self.memory.register_oom_notification(callback),
            EventSpec::MemoryThreshold { usage } => self.memory.register_usage_threshold_notification(*usage, callback),
        }
    }
}

fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Dirty settings are either a ratio or a byte limit, never both.
fn verify_full_spec(spec: &MemorySpec) -> Result<()> {
    if spec.dirty_ratio.is_some() && spec.dirty_limit.is_some() {
        return Err(crate::error::Error::invalid_argument(
            "dirty_ratio and dirty_limit are mutually exclusive",
        ));
    }
    if spec.dirty_background_ratio.is_some() && spec.dirty_background_limit.is_some() {
        return Err(crate::error::Error::invalid_argument(
            "dirty_background_ratio and dirty_background_limit are mutually exclusive",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    fn handler(path: &std::path::Path) -> MemoryResourceHandler {
        MemoryResourceHandler::new(Memory::new(test_base(path)))
    }

    #[test]
    fn update_replace_fills_defaults_then_writes() {
        let tmp = tempfile::tempdir().unwrap();
        for f in [
            "memory.limit_in_bytes",
            "memory.soft_limit_in_bytes",
            "memory.memsw.limit_in_bytes",
            "memory.dirty_ratio",
            "memory.dirty_background_ratio",
            "memory.oom_control",
            "memory.dirty_limit_in_bytes",
            "memory.dirty_background_limit_in_bytes",
        ] {
            std::fs::write(tmp.path().join(f), "0").unwrap();
        }
        let handler = handler(tmp.path());

        handler.update(&MemorySpec::default(), UpdatePolicy::Replace).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("memory.dirty_ratio")).unwrap(),
            "75"
        );
    }

    #[test]
    fn register_notification_routes_oom_through_the_event_listener() {
        use crate::events::MockEventListener;
        use crate::factory::CgroupFactory;
        use crate::hierarchy::HierarchyKind;
        use std::sync::{Arc, Mutex};

        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockEventListener::new();
        mock.expect_register()
            .withf(|control, _target, args, _cb| control.ends_with("cgroup.event_control") && args.is_empty())
            .returning(|_, _, _, _| Ok(crate::events::NotificationHandle::for_test(1)));
        let mut registry = crate::hierarchy::HierarchyRegistry::default();
        registry.record_comount(&[HierarchyKind::Memory], tmp.path().to_path_buf());
        let factory = Arc::new(CgroupFactory::new(crate::kernel_fs::KernelFs::new(), Arc::new(Mutex::new(registry))));
        let base = crate::controller::ControllerBase::new(
            crate::kernel_fs::KernelFs::new(),
            factory,
            Some(Arc::new(mock)),
            HierarchyKind::Memory,
            "/test".to_string(),
            tmp.path().to_path_buf(),
        );
        let handler = MemoryResourceHandler::new(Memory::new(base));

        let cb: NotificationCallback = Arc::new(|_| {});
        handler.register_notification(&EventSpec::Oom, cb).unwrap();
    }

    #[test]
    fn verify_rejects_ratio_and_limit_together() {
        let spec = MemorySpec {
            dirty_ratio: Some(50),
            dirty_limit: Some(1024),
            ..Default::default()
        };
        let err = verify_full_spec(&spec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
