//! A single process-wide epoll loop servicing eventfds registered against
//! cgroup control files (`cgroup.event_control` + eventfd + epoll).
//!
//! Built on `nix`'s `sys::eventfd`/`sys::epoll` wrappers and the same
//! `thiserror` error style used by the controllers, implementing the
//! `"<event_fd> <target_fd> <args>"` control-file protocol lmctfy's
//! `eventfd_notification.cc` documents.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EventFd, EfdFlags};
use nix::unistd::access;

use crate::error::{Error, Result};
use crate::kernel_fs::KernelFs;

/// Outcome delivered to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The watched condition fired.
    Ok,
    /// The registration was torn down (explicit `unregister`, or the target
    /// cgroup/file disappeared).
    Cancelled,
}

pub type NotificationCallback = Arc<dyn Fn(NotificationOutcome) + Send + Sync>;

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(u64);

impl NotificationHandle {
    #[cfg(test)]
    pub fn for_test(id: u64) -> Self {
        NotificationHandle(id)
    }
}

struct Registration {
    event_fd: EventFd,
    target_path: PathBuf,
    // Kept open for the lifetime of the registration so its fd stays valid
    // for the control-file protocol; dropping the registration closes it.
    target_file: File,
    active: Arc<std::sync::atomic::AtomicBool>,
    callback: NotificationCallback,
}

/// Anything that can register/unregister a kernel event notification. The
/// real implementation drives an epoll loop; tests substitute a mock that
/// captures registrations and replays fires without any kernel involved.
#[cfg_attr(test, mockall::automock)]
pub trait EventListener: Send + Sync {
    fn register(
        &self,
        control_file_path: &Path,
        target_file_path: &Path,
        arguments: &str,
        callback: NotificationCallback,
    ) -> Result<NotificationHandle>;

    fn unregister(&self, handle: NotificationHandle);
}

/// The real epoll-backed listener. One background thread, one epoll set,
/// shared across every memory (or other) notification registered in the
/// process.
pub struct EpollEventListener {
    fs: KernelFs,
    next_id: AtomicU64,
    registrations: Arc<Mutex<HashMap<u64, Registration>>>,
    epoll: Arc<Epoll>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(thiserror::Error, Debug)]
pub enum EventListenerError {
    #[error("failed to create eventfd: {0}")]
    EventFd(#[source] nix::Error),
    #[error("failed to open target file {0}")]
    OpenTarget(PathBuf),
    #[error("failed to register with epoll: {0}")]
    Epoll(#[source] nix::Error),
}

impl EpollEventListener {
    pub fn start(fs: KernelFs) -> std::result::Result<Arc<Self>, EventListenerError> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(EventListenerError::Epoll)?;
        let listener = Arc::new(EpollEventListener {
            fs,
            next_id: AtomicU64::new(1),
            registrations: Arc::new(Mutex::new(HashMap::new())),
            epoll: Arc::new(epoll),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            worker: Mutex::new(None),
        });

        let worker_listener = listener.clone();
        let handle = std::thread::spawn(move || worker_listener.run());
        *listener.worker.lock().unwrap() = Some(handle);

        Ok(listener)
    }

    fn run(&self) {
        let mut events = [EpollEvent::empty(); 16];
        while !self.shutdown.load(Ordering::Acquire) {
            // Small timeout so shutdown is observed promptly.
            let n = match self
                .epoll
                .wait(&mut events, EpollTimeout::try_from(100u16).unwrap())
            {
                Ok(n) => n,
                Err(_) => continue,
            };

            for ev in events.iter().take(n) {
                let id = ev.data();
                self.fire(id);
            }
        }
    }

    fn fire(&self, id: u64) {
        let (active_flag, target_path, callback, counter_fd) = {
            let registrations = self.registrations.lock().unwrap();
            let reg = match registrations.get(&id) {
                Some(r) => r,
                None => return,
            };
            (
                reg.active.clone(),
                reg.target_path.clone(),
                reg.callback.clone(),
                reg.event_fd.as_raw_fd(),
            )
        };

        // Drain the 8-byte counter so epoll doesn't keep firing. Borrow the
        // fd rather than taking ownership: the registration still owns it.
        let mut buf = [0u8; 8];
        unsafe {
            let mut file = std::mem::ManuallyDrop::new(<File as std::os::unix::io::FromRawFd>::from_raw_fd(
                counter_fd,
            ));
            let _ = file.read(&mut buf);
        }

        if !active_flag.load(Ordering::Acquire) {
            return;
        }

        if access(&target_path, nix::unistd::AccessFlags::F_OK).is_err() {
            active_flag.store(false, Ordering::Release);
            callback(NotificationOutcome::Cancelled);
            self.remove_registration(id);
            return;
        }

        callback(NotificationOutcome::Ok);
    }

    fn remove_registration(&self, id: u64) {
        let mut registrations = self.registrations.lock().unwrap();
        if let Some(reg) = registrations.remove(&id) {
            let _ = self.epoll.delete(&reg.event_fd);
        }
    }
}

impl EventListener for EpollEventListener {
    /// Opens the target file read-only, creates a nonblocking eventfd,
    /// writes `"<event_fd> <target_fd> <arguments>"` to `control_file_path`,
    /// adds the eventfd to the epoll set, and returns a handle only once the
    /// registration is visible to the listener thread — no fire can be lost
    /// racing against `register`.
    fn register(
        &self,
        control_file_path: &Path,
        target_file_path: &Path,
        arguments: &str,
        callback: NotificationCallback,
    ) -> Result<NotificationHandle> {
        let target_file = self
            .fs
            .open_read(target_file_path)
            .map_err(|_| Error::not_found(format!("{}", target_file_path.display())))?;
        let target_fd: RawFd = target_file.as_raw_fd();

        let event_fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| Error::internal(format!("eventfd: {e}")))?;

        let control_value = format!("{} {} {}", event_fd.as_raw_fd(), target_fd, arguments);
        self.fs.safe_write(control_file_path, &control_value)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let ev = EpollEvent::new(EpollFlags::EPOLLIN, id);
        self.epoll
            .add(&event_fd, ev)
            .map_err(|e| Error::internal(format!("epoll_ctl add: {e}")))?;

        self.registrations.lock().unwrap().insert(
            id,
            Registration {
                event_fd,
                target_path: target_file_path.to_path_buf(),
                target_file,
                active,
                callback,
            },
        );

        Ok(NotificationHandle(id))
    }

    /// Never blocks on a pending callback: marks the handle inactive,
    /// removes it from epoll, and invokes `Cancelled` exactly once.
    fn unregister(&self, handle: NotificationHandle) {
        let removed = {
            let mut registrations = self.registrations.lock().unwrap();
            registrations.remove(&handle.0)
        };

        if let Some(reg) = removed {
            let _ = self.epoll.delete(&reg.event_fd);
            if reg.active.swap(false, Ordering::AcqRel) {
                (reg.callback)(NotificationOutcome::Cancelled);
            }
        }
    }
}

impl Drop for EpollEventListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unregister_before_fire_is_cancelled_exactly_once() {
        let fs = KernelFs::new();
        let listener = EpollEventListener::start(fs).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("memory.oom_control");
        std::fs::write(&target, "").unwrap();
        let control = tmp.path().join("cgroup.event_control");
        std::fs::write(&control, "").unwrap();

        let fire_count = Arc::new(AtomicUsize::new(0));
        let cancel_count = Arc::new(AtomicUsize::new(0));
        let fc = fire_count.clone();
        let cc = cancel_count.clone();

        let handle = listener
            .register(
                &control,
                &target,
                "",
                Arc::new(move |outcome| match outcome {
                    NotificationOutcome::Ok => {
                        fc.fetch_add(1, Ordering::SeqCst);
                    }
                    NotificationOutcome::Cancelled => {
                        cc.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        listener.unregister(handle);
        // a second unregister of the same handle is a no-op, not a second
        // CANCELLED delivery.
        listener.unregister(handle);

        assert_eq!(cancel_count.load(Ordering::SeqCst), 1);
        assert_eq!(fire_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_closes_the_target_file_descriptor() {
        let fs = KernelFs::new();
        let listener = EpollEventListener::start(fs).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("memory.oom_control");
        std::fs::write(&target, "").unwrap();
        let control = tmp.path().join("cgroup.event_control");
        std::fs::write(&control, "").unwrap();

        let open_fds = || std::fs::read_dir("/proc/self/fd").unwrap().count();
        let before = open_fds();

        let handle = listener
            .register(&control, &target, "", Arc::new(|_| {}))
            .unwrap();
        assert!(open_fds() > before);

        listener.unregister(handle);
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn register_writes_control_file_protocol() {
        let fs = KernelFs::new();
        let listener = EpollEventListener::start(fs).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("memory.usage_in_bytes");
        std::fs::write(&target, "0").unwrap();
        let control = tmp.path().join("cgroup.event_control");
        std::fs::write(&control, "").unwrap();

        let handle = listener
            .register(&control, &target, "1048576", Arc::new(|_| {}))
            .unwrap();

        let written = std::fs::read_to_string(&control).unwrap();
        let fields: Vec<&str> = written.split_whitespace().collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], "1048576");

        listener.unregister(handle);
    }
}
