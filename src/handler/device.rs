//! Device resource domain. Grounded on lmctfy's `device_resource_handler.cc`
//! and `containers-youki`'s `v1::devices::Devices::apply_device` (always
//! re-applying every rule rather than diffing), driving
//! [`crate::controller::device::Device`].

use crate::controller::device::Device;
use crate::error::Result;
use crate::spec::{DeviceSpec, DeviceStats, UpdatePolicy};

use super::ResourceHandler;

pub struct DeviceResourceHandler {
    device: Device,
}

impl DeviceResourceHandler {
    pub fn new(device: Device) -> Self {
        DeviceResourceHandler { device }
    }
}

impl ResourceHandler for DeviceResourceHandler {
    type Spec = DeviceSpec;
    type Stats = DeviceStats;

    /// Default devices are always applied regardless of whether a caller
    /// sets anything explicit, matching `containers-youki`'s
    /// `needs_to_handle` always returning `Some(())` for this domain.
    fn create_resource(&self, spec: &DeviceSpec) -> Result<()> {
        if let Some(restrictions) = &spec.restrictions {
            self.device.set_restrictions(restrictions)?;
        }
        Ok(())
    }

    fn update(&self, spec: &DeviceSpec, policy: UpdatePolicy) -> Result<()> {
        let adjusted = spec.clone();
        let current = self.spec()?;
        let adjusted = adjusted.merge_onto(&current);
        if let Some(restrictions) = &adjusted.restrictions {
            for rule in restrictions {
                self.device.verify_restriction(rule)?;
            }
            self.device.set_restrictions(restrictions)?;
        }
        let _ = policy;
        Ok(())
    }

    fn stats(&self) -> Result<DeviceStats> {
        Ok(DeviceStats {
            state: ignore_not_found(self.device.get_state())?,
        })
    }

    fn spec(&self) -> Result<DeviceSpec> {
        Ok(DeviceSpec {
            restrictions: ignore_not_found(self.device.get_state())?,
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
