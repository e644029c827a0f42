//! The `blkio` subsystem. Grounded on `containers-youki`'s
//! `v1::blkio::Blkio` (the `blkio.weight`/`blkio.weight_device`/
//! `blkio.throttle.*_device` file constants and the "Major:Minor value"
//! line format), extended with weight validation and non-transactional
//! per-device write semantics.

use std::path::Path;

use crate::error::{Error, Result};
use crate::parsing::parse_device_number;

use super::{CgroupController, ControllerBase};

const BLKIO_WEIGHT: &str = "blkio.weight";
const BLKIO_WEIGHT_DEVICE: &str = "blkio.weight_device";
const BLKIO_THROTTLE_READ_BPS: &str = "blkio.throttle.read_bps_device";
const BLKIO_THROTTLE_WRITE_BPS: &str = "blkio.throttle.write_bps_device";
const BLKIO_THROTTLE_READ_IOPS: &str = "blkio.throttle.read_iops_device";
const BLKIO_THROTTLE_WRITE_IOPS: &str = "blkio.throttle.write_iops_device";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OpType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LimitType {
    BytesPerSecond,
    IoPerSecond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceLimit {
    pub major: u64,
    pub minor: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MaxLimits {
    pub read_bps: Vec<DeviceLimit>,
    pub write_bps: Vec<DeviceLimit>,
    pub read_iops: Vec<DeviceLimit>,
    pub write_iops: Vec<DeviceLimit>,
}

fn max_limit_file(op: OpType, limit_type: LimitType) -> &'static str {
    match (op, limit_type) {
        (OpType::Read, LimitType::BytesPerSecond) => BLKIO_THROTTLE_READ_BPS,
        (OpType::Write, LimitType::BytesPerSecond) => BLKIO_THROTTLE_WRITE_BPS,
        (OpType::Read, LimitType::IoPerSecond) => BLKIO_THROTTLE_READ_IOPS,
        (OpType::Write, LimitType::IoPerSecond) => BLKIO_THROTTLE_WRITE_IOPS,
    }
}

pub struct BlockIo {
    base: ControllerBase,
}

impl CgroupController for BlockIo {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl BlockIo {
    pub fn new(base: ControllerBase) -> Self {
        BlockIo { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    /// `update_default_limit(w)` — writes `w * 10` to `blkio.weight`;
    /// `w` must be in `[1, 100]`.
    pub fn update_default_limit(&self, weight: u32) -> Result<()> {
        if !(1..=100).contains(&weight) {
            return Err(Error::invalid_argument(format!("weight {weight} out of range [1, 100]")));
        }
        self.base
            .fs()
            .safe_write(self.absolute_path().join(BLKIO_WEIGHT), &(weight * 10).to_string())
    }

    /// `get_default_limit()` — inverse of `update_default_limit`.
    pub fn get_default_limit(&self) -> Result<u32> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(BLKIO_WEIGHT))?;
        let written: u32 = raw
            .trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed blkio.weight"))?;
        Ok((written + 5) / 10)
    }

    /// `update_per_device_limit(limits)` — writes are independent; a
    /// rejected entry does not roll back previously-applied writes.
    pub fn update_per_device_limit(&self, limits: &[DeviceLimit]) -> Result<()> {
        for limit in limits {
            if !(1..=100).contains(&limit.limit) {
                return Err(Error::invalid_argument(format!(
                    "device limit {} out of range [1, 100]",
                    limit.limit
                )));
            }
            let line = format!("{}:{} {}", limit.major, limit.minor, limit.limit * 10);
            self.base.fs().safe_write(self.absolute_path().join(BLKIO_WEIGHT_DEVICE), &line)?;
        }
        Ok(())
    }

    /// `get_device_limits()` — malformed lines are skipped.
    pub fn get_device_limits(&self) -> Result<Vec<DeviceLimit>> {
        let raw = self
            .base
            .fs()
            .read_to_string(self.absolute_path().join(BLKIO_WEIGHT_DEVICE))?;
        let mut limits = Vec::new();
        for line in raw.lines() {
            let Some((device, weight)) = line.split_once(' ') else { continue };
            let Ok((major, minor)) = parse_device_number(device) else { continue };
            let Ok(weight): std::result::Result<u64, _> = weight.trim().parse() else { continue };
            limits.push(DeviceLimit {
                major,
                minor,
                limit: weight / 10,
            });
        }
        Ok(limits)
    }

    /// `update_max_limit(limits)` — writes each device limit to the file
    /// selected by the `(op_type, limit_type)` cross product.
    pub fn update_max_limit(&self, op: OpType, limit_type: LimitType, limits: &[DeviceLimit]) -> Result<()> {
        let file = max_limit_file(op, limit_type);
        for limit in limits {
            let line = format!("{}:{} {}", limit.major, limit.minor, limit.limit);
            self.base.fs().safe_write(self.absolute_path().join(file), &line)?;
        }
        Ok(())
    }

    /// `get_max_limit()` — any of the four files missing is `NotFound`.
    pub fn get_max_limit(&self) -> Result<MaxLimits> {
        Ok(MaxLimits {
            read_bps: self.read_device_limit_file(BLKIO_THROTTLE_READ_BPS)?,
            write_bps: self.read_device_limit_file(BLKIO_THROTTLE_WRITE_BPS)?,
            read_iops: self.read_device_limit_file(BLKIO_THROTTLE_READ_IOPS)?,
            write_iops: self.read_device_limit_file(BLKIO_THROTTLE_WRITE_IOPS)?,
        })
    }

    fn read_device_limit_file(&self, file: &str) -> Result<Vec<DeviceLimit>> {
        let raw = self.base.fs().read_to_string(self.absolute_path().join(file))?;
        let mut limits = Vec::new();
        for line in raw.lines() {
            let Some((device, value)) = line.split_once(' ') else { continue };
            let Ok((major, minor)) = parse_device_number(device) else { continue };
            let Ok(limit) = value.trim().parse() else { continue };
            limits.push(DeviceLimit { major, minor, limit });
        }
        Ok(limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    #[test]
    fn update_default_limit_rejects_out_of_range_weight() {
        let tmp = tempfile::tempdir().unwrap();
        let blkio = BlockIo::new(test_base(tmp.path()));
        let err = blkio.update_default_limit(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        let err = blkio.update_default_limit(101).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn default_limit_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(BLKIO_WEIGHT), "").unwrap();
        let blkio = BlockIo::new(test_base(tmp.path()));

        blkio.update_default_limit(50).unwrap();
        assert_eq!(blkio.get_default_limit().unwrap(), 50);
    }

    #[test]
    fn per_device_limit_writes_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(BLKIO_WEIGHT_DEVICE), "").unwrap();
        let blkio = BlockIo::new(test_base(tmp.path()));

        let good = DeviceLimit { major: 8, minor: 0, limit: 50 };
        blkio.update_per_device_limit(&[good]).unwrap();

        let bad = DeviceLimit { major: 8, minor: 1, limit: 200 };
        let err = blkio.update_per_device_limit(&[bad]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        // the earlier successful write is still in place.
        let limits = blkio.get_device_limits().unwrap();
        assert_eq!(limits, vec![DeviceLimit { major: 8, minor: 0, limit: 50 }]);
    }

    #[test]
    fn malformed_device_limit_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(BLKIO_WEIGHT_DEVICE), "not a line\n8:0 500\n").unwrap();
        let blkio = BlockIo::new(test_base(tmp.path()));

        let limits = blkio.get_device_limits().unwrap();
        assert_eq!(limits, vec![DeviceLimit { major: 8, minor: 0, limit: 50 }]);
    }

    #[test]
    fn get_max_limit_propagates_missing_file_as_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let blkio = BlockIo::new(test_base(tmp.path()));
        let err = blkio.get_max_limit().unwrap_err();
        assert!(err.is_not_found());
    }
}
