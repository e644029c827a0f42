//! The `rlimit` cgroup subsystem: a file descriptor limit and its usage
//! counters. Shaped like the getter/setter pairs in `controller::memory`,
//! since `rlimit.fd_limit` and `rlimit.fd_usage` are structurally the same
//! "single integer file" the memory controller already handles.

use std::path::Path;

use crate::error::Result;
use crate::parsing::parse_single_value;

use super::{CgroupController, ControllerBase};

const RLIMIT_FD_LIMIT: &str = "rlimit.fd_limit";
const RLIMIT_FD_USAGE: &str = "rlimit.fd_usage";
const RLIMIT_FD_MAX_USAGE: &str = "rlimit.fd_max_usage";
const RLIMIT_FD_FAILCNT: &str = "rlimit.fd_failcnt";

pub struct RLimit {
    base: ControllerBase,
}

impl CgroupController for RLimit {
    fn base(&self) -> &ControllerBase {
        &self.base
    }
}

impl RLimit {
    pub fn new(base: ControllerBase) -> Self {
        RLimit { base }
    }

    fn absolute_path(&self) -> &Path {
        self.base.absolute_path()
    }

    pub fn set_fd_limit(&self, limit: u64) -> Result<()> {
        self.base
            .fs()
            .safe_write(self.absolute_path().join(RLIMIT_FD_LIMIT), &limit.to_string())
    }

    pub fn get_fd_limit(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(RLIMIT_FD_LIMIT))
    }

    pub fn get_fd_usage(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(RLIMIT_FD_USAGE))
    }

    pub fn get_max_fd_usage(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(RLIMIT_FD_MAX_USAGE))
    }

    pub fn get_fd_fail_count(&self) -> Result<u64> {
        parse_single_value(self.base.fs(), &self.absolute_path().join(RLIMIT_FD_FAILCNT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_base;

    #[test]
    fn fd_limit_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(RLIMIT_FD_LIMIT), "").unwrap();
        let rlimit = RLimit::new(test_base(tmp.path()));

        rlimit.set_fd_limit(1024).unwrap();
        assert_eq!(rlimit.get_fd_limit().unwrap(), 1024);
    }

    #[test]
    fn fd_usage_reads_single_value() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(RLIMIT_FD_USAGE), "42\n").unwrap();
        let rlimit = RLimit::new(test_base(tmp.path()));
        assert_eq!(rlimit.get_fd_usage().unwrap(), 42);
    }

    #[test]
    fn fd_fail_count_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let rlimit = RLimit::new(test_base(tmp.path()));
        let err = rlimit.get_fd_fail_count().unwrap_err();
        assert!(err.is_not_found());
    }
}
