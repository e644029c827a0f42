//! Maps `(hierarchy, relative path)` to an absolute cgroup directory,
//! creates and removes those directories respecting ownership, and detects
//! which cgroup a thread belongs to.
//!
//! Grounded on lmctfy's `CgroupFactory` interface (`Get`/`Create`/`Mount`/
//! `DetectCgroupPath`/`OwnsCgroup`) and `containers-youki`'s
//! `v1::manager::Manager::get_subsystem_path` path-joining pattern.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::hierarchy::{HierarchyKind, HierarchyRegistry};
use crate::kernel_fs::KernelFs;

/// `(kind, hierarchy_path, absolute_path)`. `hierarchy_path` is the
/// container's logical name (e.g. `/test`, `/alloc/task`); `absolute_path`
/// is the mount point plus the normalized `hierarchy_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPath {
    pub kind: HierarchyKind,
    pub hierarchy_path: String,
    pub absolute_path: PathBuf,
}

/// A request to mount a set of co-located hierarchies at one path.
#[derive(Debug, Clone)]
pub struct CgroupMount {
    pub mount_path: PathBuf,
    pub hierarchies: Vec<HierarchyKind>,
}

/// Normalizes a hierarchy path the way `CgroupPath` requires: the empty or
/// root path maps to the mount point itself.
fn normalize(hierarchy_path: &str) -> &str {
    hierarchy_path.trim_start_matches('/')
}

pub struct CgroupFactory {
    fs: KernelFs,
    registry: Arc<Mutex<HierarchyRegistry>>,
}

impl CgroupFactory {
    pub fn new(fs: KernelFs, registry: Arc<Mutex<HierarchyRegistry>>) -> Self {
        CgroupFactory { fs, registry }
    }

    pub fn owns_cgroup(&self, kind: HierarchyKind) -> bool {
        self.registry.lock().unwrap().owns_cgroup(kind)
    }

    fn resolve(&self, kind: HierarchyKind, hierarchy_path: &str) -> Result<CgroupPath> {
        let registry = self.registry.lock().unwrap();
        let mount = registry
            .mount_point(kind)
            .ok_or_else(|| Error::not_found(format!("{} is not mounted", kind.canonical_name())))?;
        let rel = normalize(hierarchy_path);
        let absolute_path = if rel.is_empty() {
            mount.absolute_path.clone()
        } else {
            mount.absolute_path.join(rel)
        };
        Ok(CgroupPath {
            kind,
            hierarchy_path: hierarchy_path.to_string(),
            absolute_path,
        })
    }

    /// Resolves and validates that the target cgroup directory exists.
    pub fn get(&self, kind: HierarchyKind, hierarchy_path: &str) -> Result<CgroupPath> {
        let path = self.resolve(kind, hierarchy_path)?;
        if self.fs.access(&path.absolute_path) {
            Ok(path)
        } else {
            Err(Error::not_found(format!(
                "cgroup {} does not exist",
                path.absolute_path.display()
            )))
        }
    }

    /// Creates the target cgroup directory if this kind owns the co-mount.
    pub fn create(&self, kind: HierarchyKind, hierarchy_path: &str) -> Result<CgroupPath> {
        let path = self.resolve(kind, hierarchy_path)?;

        if !self.owns_cgroup(kind) {
            // Not the owner: equivalent to get(), the owning hierarchy
            // creates the directory.
            return self.get(kind, hierarchy_path);
        }

        if self.fs.exists(&path.absolute_path) {
            return Err(Error::already_exists(format!(
                "cgroup {} already exists",
                path.absolute_path.display()
            )));
        }

        self.fs.mkdir_recursive(&path.absolute_path).map_err(|_| {
            Error::failed_precondition(format!(
                "failed to create cgroup directory {}",
                path.absolute_path.display()
            ))
        })?;

        Ok(path)
    }

    /// Mounts a set of co-located hierarchies, or records them against an
    /// already-mounted path.
    pub fn mount(&self, request: CgroupMount) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();

        let already_mounted: Vec<&HierarchyKind> = request
            .hierarchies
            .iter()
            .filter(|k| registry.is_mounted(**k))
            .collect();

        if already_mounted.is_empty() {
            self.fs.mkdir_recursive(&request.mount_path)?;
            let data = request
                .hierarchies
                .iter()
                .map(|k| k.canonical_name())
                .collect::<Vec<_>>()
                .join(",");
            self.fs
                .mount("cgroup", &request.mount_path, "cgroup", &data)?;
            registry.record_comount(&request.hierarchies, request.mount_path);
            return Ok(());
        }

        let all_here = request.hierarchies.iter().all(|k| {
            registry
                .mount_point(*k)
                .map(|m| m.absolute_path == request.mount_path)
                .unwrap_or(false)
        });
        if all_here {
            registry.record_comount(&request.hierarchies, request.mount_path);
            return Ok(());
        }

        Err(Error::invalid_argument(format!(
            "requested hierarchies are mounted elsewhere or the path {} is used by a disjoint set",
            request.mount_path.display()
        )))
    }

    /// Looks up which cgroup a thread belongs to for one hierarchy kind.
    /// `tid == 0` reads `/proc/self/cgroup`.
    pub fn detect_cgroup_path(&self, tid: u32, kind: HierarchyKind) -> Result<String> {
        let proc_path = if tid == 0 {
            PathBuf::from("/proc/self/cgroup")
        } else {
            PathBuf::from(format!("/proc/{tid}/cgroup"))
        };

        let contents = fs::read_to_string(&proc_path)
            .map_err(|_| Error::not_found(format!("{}", proc_path.display())))?;

        let name = kind.canonical_name();
        for line in contents.lines() {
            let mut fields = line.splitn(3, ':');
            let (_id, subsystems, path) = match (fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(s), Some(p)) => (id, s, p),
                _ => continue,
            };
            if subsystems.split(',').any(|s| s == name) {
                return Ok(path.to_string());
            }
        }

        Err(Error::not_found(format!(
            "no cgroup line for {name} in {}",
            proc_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn factory_with_mount(tmp: &Path, kind: HierarchyKind) -> CgroupFactory {
        let mut registry = HierarchyRegistry::default();
        registry.record_comount(&[kind], tmp.to_path_buf());
        CgroupFactory::new(KernelFs::new(), Arc::new(Mutex::new(registry)))
    }

    #[test]
    fn create_then_get_returns_same_path() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = factory_with_mount(tmp.path(), HierarchyKind::Memory);

        let created = factory.create(HierarchyKind::Memory, "/test").unwrap();
        let got = factory.get(HierarchyKind::Memory, "/test").unwrap();
        assert_eq!(created.absolute_path, got.absolute_path);
    }

    #[test]
    fn create_twice_is_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = factory_with_mount(tmp.path(), HierarchyKind::Memory);

        factory.create(HierarchyKind::Memory, "/test").unwrap();
        let err = factory.create(HierarchyKind::Memory, "/test").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn get_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = factory_with_mount(tmp.path(), HierarchyKind::Memory);
        let err = factory.get(HierarchyKind::Memory, "/nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn non_owner_create_does_not_mkdir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = HierarchyRegistry::default();
        registry.record_comount(&[HierarchyKind::Cpu, HierarchyKind::CpuAcct], tmp.path().to_path_buf());
        let factory = CgroupFactory::new(KernelFs::new(), Arc::new(Mutex::new(registry)));

        // CpuAcct doesn't own; the directory doesn't exist yet, so create()
        // behaves like get() and fails NotFound instead of creating it.
        let err = factory.create(HierarchyKind::CpuAcct, "/test").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(!tmp.path().join("test").exists());
    }
}
