//! Filesystem resource domain — the fd-limit surface backed by
//! [`crate::controller::rlimit::RLimit`]. Grounded on lmctfy's
//! `filesystem_resource_handler.h`/`.cc`, which ties file-descriptor
//! accounting to the rlimit cgroup rather than a dedicated filesystem
//! cgroup.

use tracing::debug;

use crate::controller::rlimit::RLimit;
use crate::error::{Error, Result};
use crate::spec::{FilesystemSpec, FilesystemStats, UpdatePolicy};

use super::ResourceHandler;

pub struct FilesystemResourceHandler {
    rlimit: RLimit,
}

impl FilesystemResourceHandler {
    pub fn new(rlimit: RLimit) -> Self {
        FilesystemResourceHandler { rlimit }
    }
}

impl ResourceHandler for FilesystemResourceHandler {
    type Spec = FilesystemSpec;
    type Stats = FilesystemStats;

    fn create_resource(&self, _spec: &FilesystemSpec) -> Result<()> {
        Ok(())
    }

    fn update(&self, spec: &FilesystemSpec, policy: UpdatePolicy) -> Result<()> {
        let mut adjusted = spec.clone();
        if policy == UpdatePolicy::Replace {
            adjusted.fill_defaults();
        }
        let current = self.spec()?;
        let adjusted = adjusted.merge_onto(&current);
        verify_full_spec(&adjusted)?;
        if let Some(limit) = adjusted.fd_limit {
            debug!(fd_limit = limit, "apply rlimit.fd_limit");
            self.rlimit.set_fd_limit(limit)?;
        }
        Ok(())
    }

    fn stats(&self) -> Result<FilesystemStats> {
        Ok(FilesystemStats {
            fd_limit: ignore_not_found(self.rlimit.get_fd_limit())?,
            fd_usage: ignore_not_found(self.rlimit.get_fd_usage())?,
            fd_max_usage: ignore_not_found(self.rlimit.get_max_fd_usage())?,
            fd_fail_count: ignore_not_found(self.rlimit.get_fd_fail_count())?,
        })
    }

    fn spec(&self) -> Result<FilesystemSpec> {
        Ok(FilesystemSpec {
            fd_limit: ignore_not_found(self.rlimit.get_fd_limit())?,
        })
    }
}

/// The Filesystem domain requires `fd_limit` to be set once merged.
fn verify_full_spec(spec: &FilesystemSpec) -> Result<()> {
    if spec.fd_limit.is_none() {
        return Err(Error::invalid_argument("filesystem spec requires fd_limit"));
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

    #[test]
    fn update_diff_without_fd_limit_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = FilesystemResourceHandler::new(RLimit::new(test_base(tmp.path())));
        let err = handler.update(&FilesystemSpec::default(), UpdatePolicy::Diff).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn update_replace_fills_default_fd_limit() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("rlimit.fd_limit"), "").unwrap();
        let handler = FilesystemResourceHandler::new(RLimit::new(test_base(tmp.path())));

        handler.update(&FilesystemSpec::default(), UpdatePolicy::Replace).unwrap();
        let written = std::fs::read_to_string(tmp.path().join("rlimit.fd_limit")).unwrap();
        assert_eq!(written, (i64::MAX as u64).to_string());
    }
}
