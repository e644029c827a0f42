//! Component A: a narrow capability over the syscalls every cgroup operation
//! ultimately reduces to. Concentrating file I/O here gives tests a single
//! seam to substitute (a tempdir standing in for `/sys/fs/cgroup/...`),
//! normalizes errors into [`crate::error::Error`], and documents exactly
//! which syscalls this crate performs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::unistd::{Gid, Uid};

use crate::error::{Error, Result};

/// Thin, cloneable capability. Holds no mutable state: every method is a
/// syscall against the path it's given, so `KernelFs` is `Send + Sync` for
/// free and may be shared behind an `Arc` across controllers and factories.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFs;

impl KernelFs {
    pub fn new() -> Self {
        KernelFs
    }

    /// Reads an entire file into a string. `NotFound` if missing.
    pub fn read_to_string<P: AsRef<Path>>(&self, path: P) -> Result<String> {
        let path = path.as_ref();
        fs::read_to_string(path).map_err(|source| wrap_read(path, source))
    }

    /// Lazy, restartable line iterator. Cgroup stat files mutate underneath
    /// readers, so each call re-opens the file rather than caching lines.
    pub fn read_lines<P: AsRef<Path>>(&self, path: P) -> Result<LineReader> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| wrap_open(path, source))?;
        Ok(LineReader {
            inner: BufReader::new(file).lines(),
        })
    }

    /// Opens for write and writes `contents` in a single `write(2)` call,
    /// which the kernel treats atomically for cgroup control files.
    pub fn safe_write<P: AsRef<Path>>(&self, path: P, contents: &str) -> Result<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| wrap_open(path, source))?;
        file.write_all(contents.as_bytes())
            .map_err(|source| wrap_write(path, contents, source))
    }

    /// Retries transient `EAGAIN`/`EINTR` up to `retries` times with a short
    /// linear backoff. Not used for files where a repeated write would
    /// violate semantics (e.g. freezer.state, where a second write could
    /// race a kernel-driven FREEZING->FROZEN transition).
    pub fn safe_write_with_retry<P: AsRef<Path>>(
        &self,
        path: P,
        contents: &str,
        retries: u32,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut attempt = 0;
        loop {
            match self.safe_write(path, contents) {
                Ok(()) => return Ok(()),
                Err(Error::Write { source, .. })
                    if attempt < retries && is_transient(&source) =>
                {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(5 * attempt as u64));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn exists<P: AsRef<Path>>(&self, path: P) -> bool {
        path.as_ref().exists()
    }

    /// `access(path, F_OK)`-equivalent: true iff the path is readable.
    pub fn access<P: AsRef<Path>>(&self, path: P) -> bool {
        nix::unistd::access(path.as_ref(), nix::unistd::AccessFlags::F_OK).is_ok()
    }

    pub fn mkdir<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir(path).map_err(|source| wrap_open(path, source))
    }

    pub fn mkdir_recursive<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|source| wrap_open(path, source))
    }

    pub fn rmdir<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::remove_dir(path).map_err(|source| wrap_open(path, source))
    }

    /// Best-effort directory removal with linear backoff, for cgroups whose
    /// kernel-side teardown (killing the last task) races our `rmdir`.
    pub fn rmdir_with_retry<P: AsRef<Path>>(&self, path: P, retries: u32) -> Result<()> {
        let path = path.as_ref();
        let mut delay = Duration::from_millis(10);
        for attempt in 0..retries {
            if fs::remove_dir(path).is_ok() {
                return Ok(());
            }
            thread::sleep(delay);
            delay *= attempt + 1;
        }
        fs::remove_dir(path).map_err(|source| wrap_open(path, source))
    }

    pub fn chown<P: AsRef<Path>>(&self, path: P, uid: u32, gid: u32) -> Result<()> {
        let path = path.as_ref();
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| Error::internal(format!("chown {}: {e}", path.display())))
    }

    pub fn mount(&self, source: &str, target: &Path, fstype: &str, data: &str) -> Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            Some(fstype),
            nix::mount::MsFlags::empty(),
            Some(data),
        )
        .map_err(|e| Error::failed_precondition(format!("mount {}: {e}", target.display())))
    }

    pub fn umount(&self, target: &Path) -> Result<()> {
        nix::mount::umount(target)
            .map_err(|e| Error::failed_precondition(format!("umount {}: {e}", target.display())))
    }

    pub fn open_read<P: AsRef<Path>>(&self, path: P) -> Result<File> {
        let path = path.as_ref();
        File::open(path).map_err(|source| wrap_open(path, source))
    }

    /// Reads up to `buf.len()` bytes. Used for draining eventfd counters.
    pub fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        file.read(buf)
            .map_err(|source| wrap_read(Path::new("<fd>"), source))
    }

    pub fn raw_fd(&self, file: &File) -> RawFd {
        use std::os::unix::io::AsRawFd;
        file.as_raw_fd()
    }

    /// Immediate subdirectory names of `path`, sorted for deterministic
    /// iteration order. Used by `get_subcontainers()`.
    pub fn list_subdirs<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>> {
        Ok(self
            .list_entries(path)?
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .map(|(name, _)| name)
            .collect())
    }

    /// Immediate directory entries as `(name, is_dir)`, sorted by name.
    pub fn list_entries<P: AsRef<Path>>(&self, path: P) -> Result<Vec<(String, bool)>> {
        let path = path.as_ref();
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|source| wrap_open(path, source))? {
            let entry = entry.map_err(|source| wrap_read(path, source))?;
            let is_dir = entry
                .file_type()
                .map_err(|source| wrap_read(path, source))?
                .is_dir();
            entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        entries.sort();
        Ok(entries)
    }
}

pub struct LineReader {
    inner: std::io::Lines<BufReader<File>>,
}

impl Iterator for LineReader {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|r| r.map_err(|source| wrap_read(Path::new("<line>"), source)))
    }
}

fn is_transient(source: &std::io::Error) -> bool {
    matches!(
        source.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn wrap_open(path: &Path, source: std::io::Error) -> Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("{}: {source}", path.display()))
    } else {
        Error::Open {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn wrap_read(path: &Path, source: std::io::Error) -> Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("{}: {source}", path.display()))
    } else {
        Error::Read {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn wrap_write(path: &Path, data: &str, source: std::io::Error) -> Error {
    Error::Write {
        path: path.to_path_buf(),
        data: data.to_string(),
        source,
    }
}

/// A path with a trailing `/file` component joined for reading/writing a
/// cgroup control file. Kept as a free function rather than a `PathBuf`
/// extension trait since the only caller-visible use is controllers
/// building `absolute_path.join(cgroup_file)`.
pub fn cgroup_file(dir: &Path, file: &str) -> PathBuf {
    dir.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_file_is_not_found() {
        let fs = KernelFs::new();
        let err = fs.read_to_string("/no/such/cgroup/file").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cpu.shares");
        std::fs::write(&path, "").unwrap();

        let fs = KernelFs::new();
        fs.safe_write(&path, "1024").unwrap();
        assert_eq!(fs.read_to_string(&path).unwrap(), "1024");
    }

    #[test]
    fn list_subdirs_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("b")).unwrap();
        std::fs::create_dir(tmp.path().join("a")).unwrap();
        std::fs::write(tmp.path().join("tasks"), "").unwrap();

        let fs = KernelFs::new();
        let subdirs = fs.list_subdirs(tmp.path()).unwrap();
        assert_eq!(subdirs, vec!["a".to_string(), "b".to_string()]);
    }
}
