//! Resource-handler layer: maps declarative spec/stats pairs onto the
//! controllers that implement them, with a diff-vs-replace update policy and
//! notification routing. Modeled on lmctfy's `resource_handler.h` contract
//! (`CreateResource`/`Update`/`Stats`/`Spec`/`RegisterNotification`),
//! expressed as a Rust trait plus the composite `CgroupResourceHandler` that
//! fans `enter`/`destroy` out across every controller a container uses.

pub mod blockio;
pub mod cpu;
pub mod device;
pub mod filesystem;
pub mod memory;

use std::sync::{Arc, Mutex};

use crate::controller::CgroupController;
use crate::error::{Error, Result};
use crate::events::{NotificationCallback, NotificationHandle};
use crate::spec::{EventSpec, UpdatePolicy};

/// One resource domain's mapping between a declarative spec/stats pair and
/// the controllers that implement it.
pub trait ResourceHandler {
    type Spec;
    type Stats;

    /// One-time setup run when the container is created. Optional kernel
    /// features report `NotFound` here and the handler tolerates it.
    fn create_resource(&self, spec: &Self::Spec) -> Result<()>;

    fn update(&self, spec: &Self::Spec, policy: UpdatePolicy) -> Result<()>;

    fn stats(&self) -> Result<Self::Stats>;

    fn spec(&self) -> Result<Self::Spec>;

    /// Domains with no event support (everything but Memory, currently)
    /// return `NotFound` unconditionally.
    fn register_notification(&self, event: &EventSpec, callback: NotificationCallback) -> Result<NotificationHandle> {
        let _ = (event, callback);
        Err(Error::not_found("this resource domain has no notification support"))
    }
}

/// Downgrades a `NotFound` from an optional kernel feature to success;
/// propagates every other error. Used by `do_update` steps for settings that
/// depend on an optional kernel feature.
pub(crate) fn tolerate_missing_feature(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Owns the ordered set of controllers a container uses and fans
/// `enter`/`destroy` across all of them.
pub struct CgroupResourceHandler {
    owned: Mutex<Vec<Arc<dyn CgroupController + Send + Sync>>>,
}

impl CgroupResourceHandler {
    pub fn new(controllers: Vec<Arc<dyn CgroupController + Send + Sync>>) -> Self {
        CgroupResourceHandler {
            owned: Mutex::new(controllers),
        }
    }

    /// Applies `enter(tid)` to each controller in order. A failure after
    /// partial success reports that some TIDs were already tracked.
    pub fn enter(&self, tid: u32) -> Result<()> {
        let controllers = self.owned.lock().unwrap();
        for (i, controller) in controllers.iter().enumerate() {
            if let Err(e) = controller.enter(tid) {
                if i > 0 {
                    return Err(Error::failed_precondition(format!(
                        "{e}: some TIDs were tracked before this error, container may be left in an inconsistent state"
                    )));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Applies `destroy` to each controller in order. On failure, the
    /// already-destroyed prefix is dropped from the owned set so a retry
    /// only targets what's left — idempotent across repeated calls.
    pub fn destroy(&self) -> Result<()> {
        let mut controllers = self.owned.lock().unwrap();
        let mut destroyed = 0;
        for controller in controllers.iter() {
            match controller.destroy() {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    controllers.drain(0..destroyed);
                    return Err(e);
                }
            }
        }
        controllers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    struct FakeController(crate::controller::ControllerBase);
    impl CgroupController for FakeController {
        fn base(&self) -> &crate::controller::ControllerBase {
            &self.0
        }
    }

    fn fake(path: &std::path::Path) -> Arc<dyn CgroupController + Send + Sync> {
        Arc::new(FakeController(test_base(path)))
    }

    #[test]
    fn destroy_drops_successfully_destroyed_prefix_on_retry() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        // b has an unrecognized file so its destroy fails.
        std::fs::write(b.path().join("stray"), "x").unwrap();

        let handler = CgroupResourceHandler::new(vec![fake(a.path()), fake(b.path())]);
        let err = handler.destroy().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FailedPrecondition);
        assert!(!a.path().exists());

        // retry only targets the remaining controller; it's still broken,
        // but `a` is never touched again (already gone).
        let err = handler.destroy().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn register_notification_defaults_to_not_found() {
        struct NoEvents;
        impl ResourceHandler for NoEvents {
            type Spec = ();
            type Stats = ();
            fn create_resource(&self, _: &()) -> Result<()> {
                Ok(())
            }
            fn update(&self, _: &(), _: UpdatePolicy) -> Result<()> {
                Ok(())
            }
            fn stats(&self) -> Result<()> {
                Ok(())
            }
            fn spec(&self) -> Result<()> {
                Ok(())
            }
        }
        let handler = NoEvents;
        let cb: NotificationCallback = Arc::new(|_| {});
        let err = handler.register_notification(&EventSpec::Oom, cb).unwrap_err();
        assert!(err.is_not_found());
    }
}
