//! The base contract every concrete controller shares (task membership,
//! recursive teardown, subcontainer enumeration, notification
//! registration), grounded on `containers-youki`'s `v1::controller::Controller`
//! trait and `v1::manager::Manager`, and on lmctfy's `CgroupController` base
//! class (Enter/Delegate/Destroy/GetThreads/GetProcesses/GetSubcontainers).
//!
//! `containers-youki` threads a `ControllerOpt`/`cgroup_root: &Path` pair
//! through free functions per controller; this crate instead gives every
//! concrete controller a [`ControllerBase`] handle that already knows its
//! own absolute path, so operations read `self.absolute_path` rather than
//! taking it as a parameter on every call.

pub mod blkio;
pub mod cpu;
pub mod cpuacct;
pub mod cpuset;
pub mod device;
pub mod freezer;
pub mod memory;
pub mod rlimit;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::events::{EventListener, NotificationCallback, NotificationHandle};
use crate::factory::CgroupFactory;
use crate::hierarchy::HierarchyKind;
use crate::kernel_fs::{cgroup_file, KernelFs};

const TASKS: &str = "tasks";
const CGROUP_PROCS: &str = "cgroup.procs";
const CGROUP_CLONE_CHILDREN: &str = "cgroup.clone_children";

/// Shared state and shared operations for one controller instance bound to
/// one cgroup directory. Concrete controllers hold one of these and expose
/// it via [`CgroupController::base`] to pick up the default base-contract
/// methods for free.
pub struct ControllerBase {
    fs: KernelFs,
    factory: Arc<CgroupFactory>,
    events: Option<Arc<dyn EventListener>>,
    kind: HierarchyKind,
    hierarchy_path: String,
    absolute_path: PathBuf,
}

impl ControllerBase {
    pub fn new(
        fs: KernelFs,
        factory: Arc<CgroupFactory>,
        events: Option<Arc<dyn EventListener>>,
        kind: HierarchyKind,
        hierarchy_path: String,
        absolute_path: PathBuf,
    ) -> Self {
        ControllerBase {
            fs,
            factory,
            events,
            kind,
            hierarchy_path,
            absolute_path,
        }
    }

    pub fn absolute_path(&self) -> &std::path::Path {
        &self.absolute_path
    }

    pub fn fs(&self) -> &KernelFs {
        &self.fs
    }

    fn file(&self, name: &str) -> PathBuf {
        cgroup_file(&self.absolute_path, name)
    }

    fn read_pid_list(&self, name: &str) -> Result<Vec<u32>> {
        let contents = self.fs.read_to_string(self.file(name))?;
        contents
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.trim()
                    .parse::<u32>()
                    .map_err(|_| Error::failed_precondition(format!("malformed pid line {l:?} in {name}")))
            })
            .collect()
    }
}

/// The base contract shared by every concrete controller, implemented once
/// here and inherited through the `base()` accessor.
pub trait CgroupController {
    fn base(&self) -> &ControllerBase;

    fn kind(&self) -> HierarchyKind {
        self.base().kind
    }

    fn hierarchy_path(&self) -> &str {
        &self.base().hierarchy_path
    }

    fn owns_cgroup(&self) -> bool {
        self.base().factory.owns_cgroup(self.base().kind)
    }

    /// `enter(tid)` — write `tid` to `cgroup.procs`.
    fn enter(&self, tid: u32) -> Result<()> {
        self.base().fs.safe_write(self.base().file(CGROUP_PROCS), &tid.to_string())
    }

    /// `delegate(uid, gid)` — chown the cgroup directory and its task files
    /// so an unprivileged process can move itself into the cgroup.
    fn delegate(&self, uid: u32, gid: u32) -> Result<()> {
        let base = self.base();
        base.fs.chown(&base.absolute_path, uid, gid)?;
        base.fs.chown(base.file(TASKS), uid, gid)?;
        base.fs.chown(base.file(CGROUP_PROCS), uid, gid)
    }

    /// `destroy()` — post-order recursive rmdir of the controller's own
    /// subtree. Non-owners are a no-op: the owning hierarchy tears the
    /// directory down.
    fn destroy(&self) -> Result<()> {
        if !self.owns_cgroup() {
            return Ok(());
        }
        destroy_recursive(self.base())
    }

    fn get_threads(&self) -> Result<Vec<u32>> {
        self.base().read_pid_list(TASKS)
    }

    fn get_processes(&self) -> Result<Vec<u32>> {
        self.base().read_pid_list(CGROUP_PROCS)
    }

    /// `get_subcontainers()` — immediate subdirectory names, not full paths.
    fn get_subcontainers(&self) -> Result<Vec<String>> {
        self.base().fs.list_subdirs(&self.base().absolute_path)
    }

    fn set_children_limit(&self, n: u32) -> Result<()> {
        self.base()
            .fs
            .safe_write(self.base().file("cgroup.children_limit"), &n.to_string())
    }

    fn get_children_limit(&self) -> Result<u32> {
        let raw = self.base().fs.read_to_string(self.base().file("cgroup.children_limit"))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::failed_precondition("malformed cgroup.children_limit"))
    }

    fn enable_clone_children(&self) -> Result<()> {
        self.base().fs.safe_write(self.base().file(CGROUP_CLONE_CHILDREN), "1")
    }

    fn disable_clone_children(&self) -> Result<()> {
        self.base().fs.safe_write(self.base().file(CGROUP_CLONE_CHILDREN), "0")
    }

    /// `register_notification(control_file, args, callback)` — delegates to
    /// the process-wide [`EventListener`]. `NotFound` if this controller was
    /// built without one (e.g. a test double that never wires events).
    fn register_notification(
        &self,
        control_file: &str,
        target_file: &str,
        args: &str,
        callback: NotificationCallback,
    ) -> Result<NotificationHandle> {
        let base = self.base();
        let listener = base
            .events
            .as_ref()
            .ok_or_else(|| Error::not_found("no event listener configured"))?;
        listener.register(&base.file(control_file), &base.file(target_file), args, callback)
    }
}

/// Known non-directory entries that legitimately live inside a cgroup
/// directory: the base-contract files plus any file prefixed with a known
/// subsystem name (co-mounted controllers, e.g. `cpu,cpuacct`, share one
/// directory and therefore each other's control files).
fn is_recognized_control_file(name: &str) -> bool {
    const BASE_FILES: &[&str] = &[
        TASKS,
        CGROUP_PROCS,
        CGROUP_CLONE_CHILDREN,
        "cgroup.children_limit",
        "cgroup.event_control",
        "notify_on_release",
        "release_agent",
    ];
    if BASE_FILES.contains(&name) {
        return true;
    }
    crate::hierarchy::OWNERSHIP_PRIORITY
        .iter()
        .any(|k| name.starts_with(&format!("{}.", k.canonical_name())))
}

fn destroy_recursive(base: &ControllerBase) -> Result<()> {
    destroy_dir(base, &base.absolute_path)
}

fn destroy_dir(base: &ControllerBase, dir: &std::path::Path) -> Result<()> {
    for (name, is_dir) in base.fs.list_entries(dir)? {
        if is_dir {
            destroy_dir(base, &dir.join(&name))?;
        } else if !is_recognized_control_file(&name) {
            return Err(Error::failed_precondition(format!(
                "directory not empty: unexpected file {name} in {}",
                dir.display()
            )));
        }
    }
    base.fs.rmdir_with_retry(dir, 5)
}

/// Test-only helper shared by every concrete controller's unit tests: a
/// [`ControllerBase`] bound to a tempdir with no event listener wired.
#[cfg(test)]
pub(crate) mod test_support {
    use super::ControllerBase;
    use crate::factory::CgroupFactory;
    use crate::hierarchy::{HierarchyKind, HierarchyRegistry};
    use crate::kernel_fs::KernelFs;
    use std::sync::{Arc, Mutex};

    pub(crate) fn test_base(path: &std::path::Path) -> ControllerBase {
        test_base_for_kind(path, HierarchyKind::Memory)
    }

    pub(crate) fn test_base_for_kind(path: &std::path::Path, kind: HierarchyKind) -> ControllerBase {
        let mut registry = HierarchyRegistry::default();
        registry.record_comount(&[kind], path.to_path_buf());
        let factory = Arc::new(CgroupFactory::new(KernelFs::new(), Arc::new(Mutex::new(registry))));
        ControllerBase::new(
            KernelFs::new(),
            factory,
            None,
            kind,
            "/test".to_string(),
            path.to_path_buf(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyRegistry;
    use std::sync::Mutex;

    struct TestController(ControllerBase);
    impl CgroupController for TestController {
        fn base(&self) -> &ControllerBase {
            &self.0
        }
    }

    fn controller_at(path: &std::path::Path) -> TestController {
        let mut registry = HierarchyRegistry::default();
        registry.record_comount(&[HierarchyKind::Memory], path.to_path_buf());
        let factory = Arc::new(CgroupFactory::new(KernelFs::new(), Arc::new(Mutex::new(registry))));
        TestController(ControllerBase::new(
            KernelFs::new(),
            factory,
            None,
            HierarchyKind::Memory,
            "/test".to_string(),
            path.to_path_buf(),
        ))
    }

    #[test]
    fn enter_writes_tid_to_cgroup_procs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CGROUP_PROCS), "").unwrap();
        let controller = controller_at(tmp.path());
        controller.enter(1234).unwrap();
        let content = std::fs::read_to_string(tmp.path().join(CGROUP_PROCS)).unwrap();
        assert_eq!(content, "1234");
    }

    #[test]
    fn destroy_removes_nested_subcontainers_post_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("child/grandchild")).unwrap();
        let controller = controller_at(tmp.path());
        controller.destroy().unwrap();
        assert!(!tmp.path().exists());
    }

    #[test]
    fn get_subcontainers_lists_immediate_children_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/nested")).unwrap();
        std::fs::create_dir(tmp.path().join("b")).unwrap();
        let controller = controller_at(tmp.path());
        assert_eq!(controller.get_subcontainers().unwrap(), vec!["a", "b"]);
    }
}
