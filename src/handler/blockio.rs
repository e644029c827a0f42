//! BlockIo resource domain. Grounded on lmctfy's `block_io_resource_handler.cc`,
//! driving [`crate::controller::blkio::BlockIo`].

use tracing::debug;

use crate::controller::blkio::BlockIo;
use crate::error::{Error, Result};
use crate::spec::{BlockIoSpec, BlockIoStats, UpdatePolicy};

use super::ResourceHandler;

pub struct BlockIoResourceHandler {
    blkio: BlockIo,
}

impl BlockIoResourceHandler {
    pub fn new(blkio: BlockIo) -> Self {
        BlockIoResourceHandler { blkio }
    }

    fn do_update(&self, adjusted: &BlockIoSpec) -> Result<()> {
        if let Some(w) = adjusted.default_limit {
            debug!(weight = w, "apply blkio.weight");
            self.blkio.update_default_limit(w)?;
        }
        if let Some(limits) = &adjusted.per_device_limits {
            self.blkio.update_per_device_limit(limits)?;
        }
        Ok(())
    }
}

impl ResourceHandler for BlockIoResourceHandler {
    type Spec = BlockIoSpec;
    type Stats = BlockIoStats;

    fn create_resource(&self, _spec: &BlockIoSpec) -> Result<()> {
        Ok(())
    }

    fn update(&self, spec: &BlockIoSpec, policy: UpdatePolicy) -> Result<()> {
        let mut adjusted = spec.clone();
        if policy == UpdatePolicy::Replace {
            adjusted.default_limit.get_or_insert(100);
        }
        verify_full_spec(&adjusted)?;
        let current = self.spec()?;
        let adjusted = adjusted.merge_onto(&current);
        self.do_update(&adjusted)
    }

    fn stats(&self) -> Result<BlockIoStats> {
        Ok(BlockIoStats {
            default_limit: ignore_not_found(self.blkio.get_default_limit())?,
            device_limits: ignore_not_found(self.blkio.get_device_limits())?,
            max_limits: ignore_not_found(self.blkio.get_max_limit())?,
        })
    }

    fn spec(&self) -> Result<BlockIoSpec> {
        Ok(BlockIoSpec {
            default_limit: ignore_not_found(self.blkio.get_default_limit())?,
            per_device_limits: ignore_not_found(self.blkio.get_device_limits())?,
        })
    }
}

fn verify_full_spec(spec: &BlockIoSpec) -> Result<()> {
    if let Some(w) = spec.default_limit {
        if !(1..=100).contains(&w) {
            return Err(Error::invalid_argument(format!("default_limit {w} out of range [1, 100]")));
        }
    }
    Ok(())
}

fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    fn handler(path: &std::path::Path) -> BlockIoResourceHandler {
        BlockIoResourceHandler::new(BlockIo::new(test_base(path)))
    }

    #[test]
    fn update_replace_defaults_weight_to_100() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("blkio.weight"), "").unwrap();
        std::fs::write(tmp.path().join("blkio.weight_device"), "").unwrap();
        let handler = handler(tmp.path());

        handler.update(&BlockIoSpec::default(), UpdatePolicy::Replace).unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("blkio.weight")).unwrap(), "1000");
    }
}
