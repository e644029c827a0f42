//! The `freezer` subsystem. Grounded on `containers-youki`'s
//! `v1::freezer::Freezer` (the retry-until-FROZEN loop polling
//! `freezer.state`, falling back to THAWED on failure), extended with a
//! hierarchical-freezing-support gate (`freezer.parent_freezing` +
//! `get_subcontainers`).

use std::path::Path;
use std::{thread, time};

use crate::error::{Error, Result};

use super::{CgroupController, ControllerBase};

const FREEZER_STATE: &str = "freezer.state";
const FREEZER_PARENT_FREEZING: &str = "freezer.parent_freezing";

const STATE_THAWED: &str = "THAWED";
const STATE_FROZEN: &str = "FROZEN";
const STATE_FREEZING: &str = "FREEZING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    Frozen,
    Freezing,
    Thawed,
}

pub struct Freezer {
    base: ControllerBase,
}

impl CgroupController for Freezer {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl Freezer {
    pub fn new(base: ControllerBase) -> Self {
        Freezer { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    fn hierarchical_freezing_supported(&self) -> bool {
        self.base
            .fs()
            .read_to_string(self.absolute_path().join(FREEZER_PARENT_FREEZING))
            .is_ok()
    }

    /// Gate shared by `freeze`/`unfreeze`: proceed if the kernel supports
    /// hierarchical freezing, or if it doesn't but this cgroup has no
    /// subcontainers (a flat freezer can't safely freeze a tree).
    fn check_can_transition(&self) -> Result<()> {
        if self.hierarchical_freezing_supported() {
            return Ok(());
        }
        if !self.get_subcontainers()?.is_empty() {
            return Err(Error::failed_precondition(
                "hierarchical freezing unsupported and subcontainers exist",
            ));
        }
        Ok(())
    }

    fn write_state(&self, value: &str) -> Result<()> {
        self.base.fs().safe_write(self.absolute_path().join(FREEZER_STATE), value)
    }

    fn read_state(&self) -> Result<String> {
        self.base.fs().read_to_string(self.absolute_path().join(FREEZER_STATE))
    }

    pub fn unfreeze(&self) -> Result<()> {
        self.check_can_transition()?;
        self.write_state(STATE_THAWED)
    }

    /// `freeze()` — retries while the kernel reports `FREEZING`, thawing
    /// back out if it never reaches `FROZEN`.
    pub fn freeze(&self) -> Result<()> {
        self.check_can_transition()?;

        let result = self.freeze_loop();
        if result.is_err() {
            let _ = self.write_state(STATE_THAWED);
        }
        result
    }

    fn freeze_loop(&self) -> Result<()> {
        for i in 0..1000 {
            if i % 50 == 49 {
                let _ = self.write_state(STATE_THAWED);
                thread::sleep(time::Duration::from_millis(10));
            }

            self.write_state(STATE_FROZEN)?;

            if i % 25 == 24 {
                thread::sleep(time::Duration::from_millis(10));
            }

            match self.read_state()?.trim() {
                STATE_FREEZING => continue,
                STATE_FROZEN => return Ok(()),
                other => return Err(Error::internal(format!("unexpected freezer state {other:?}"))),
            }
        }
        Err(Error::internal("unable to freeze: stuck in FREEZING"))
    }

    pub fn state(&self) -> Result<FreezerState> {
        match self.read_state()?.trim() {
            STATE_FROZEN => Ok(FreezerState::Frozen),
            STATE_FREEZING => Ok(FreezerState::Freezing),
            STATE_THAWED => Ok(FreezerState::Thawed),
            other => Err(Error::internal(format!("unknown freezer state {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    #[test]
    fn freeze_succeeds_immediately_when_kernel_reports_frozen() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(FREEZER_STATE), "").unwrap();
        std::fs::write(tmp.path().join(FREEZER_PARENT_FREEZING), "1").unwrap();
        let freezer = Freezer::new(test_base(tmp.path()));

        freezer.freeze().unwrap();
        assert_eq!(freezer.state().unwrap(), FreezerState::Frozen);
    }

    #[test]
    fn flat_freezer_with_subcontainers_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(FREEZER_STATE), "").unwrap();
        std::fs::create_dir(tmp.path().join("child")).unwrap();
        let freezer = Freezer::new(test_base(tmp.path()));

        let err = freezer.freeze().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn flat_freezer_without_subcontainers_proceeds() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(FREEZER_STATE), "").unwrap();
        let freezer = Freezer::new(test_base(tmp.path()));

        freezer.freeze().unwrap();
        assert_eq!(freezer.state().unwrap(), FreezerState::Frozen);
    }

    #[test]
    fn state_rejects_unknown_string() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(FREEZER_STATE), "BOGUS").unwrap();
        let freezer = Freezer::new(test_base(tmp.path()));
        let err = freezer.state().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
