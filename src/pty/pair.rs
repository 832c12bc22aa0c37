//! PTY pair allocation
//!
//! The implementation uses the POSIX PTY API:
//! - posix_openpt() to open the master
//! - grantpt() to set permissions
//! - unlockpt() to unlock the slave
//! - ptsname() to get the slave device path
//!
//! A failure at any step drops the master, which closes it; no partially
//! built pair is ever returned.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};

use super::size::{resize_pty, window_size, WindowSize};
use super::spawn::SpawnRequest;
use super::{PtyError, PtyResult};

/// Smallest accepted buffer for the slave device name, NUL included
pub const MIN_SLAVE_NAME_CAPACITY: usize = 256;

/// A PTY master together with the path of its slave device
///
/// The master is close-on-exec, so spawned programs never inherit it.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave_name: String,
}

/// Allocate a PTY pair, optionally applying an initial window size
///
/// A size with a zero dimension is skipped rather than rejected.
pub fn allocate_pty(size: Option<WindowSize>) -> PtyResult<PtyPair> {
    allocate_pty_with_capacity(size, MIN_SLAVE_NAME_CAPACITY)
}

/// Allocate a PTY pair whose slave name must fit in `capacity` bytes
///
/// `capacity` counts the trailing NUL of the C representation. Capacities
/// below [`MIN_SLAVE_NAME_CAPACITY`] are rejected before anything is opened.
pub fn allocate_pty_with_capacity(size: Option<WindowSize>, capacity: usize) -> PtyResult<PtyPair> {
    if capacity < MIN_SLAVE_NAME_CAPACITY {
        return Err(PtyError::InvalidArgument(format!(
            "slave name capacity {} is below the minimum of {}",
            capacity, MIN_SLAVE_NAME_CAPACITY
        )));
    }

    let master = open_master()?;
    grantpt(&master).map_err(PtyError::GrantPty)?;
    unlockpt(&master).map_err(PtyError::UnlockPty)?;

    let slave_name = slave_name(&master)?;
    if slave_name.len() >= capacity {
        return Err(PtyError::InvalidArgument(format!(
            "slave name {} does not fit in {} bytes",
            slave_name, capacity
        )));
    }

    // SAFETY: into_raw_fd gives up ownership, so the OwnedFd is the sole owner
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    let pair = PtyPair { master, slave_name };

    match size {
        Some(size) if !size.is_empty() => {
            if let Err(e) = pair.resize(size) {
                tracing::warn!("Initial window size not applied: {}", e);
            }
        },
        Some(size) => {
            tracing::debug!(
                cols = size.cols,
                rows = size.rows,
                "skipping empty initial window size"
            );
        },
        None => {},
    }

    tracing::debug!(fd = pair.master_fd(), slave = %pair.slave_name, "allocated PTY pair");
    Ok(pair)
}

/// Open the master close-on-exec, atomically where the platform allows it
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn open_master() -> PtyResult<PtyMaster> {
    posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC).map_err(PtyError::OpenMaster)
}

/// Open the master, then mark it close-on-exec
///
/// A fork on another thread between the two calls can still inherit the
/// master on these targets.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn open_master() -> PtyResult<PtyMaster> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(PtyError::CloseOnExec)?;
    Ok(master)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    nix::pty::ptsname_r(master).map_err(PtyError::PtsName)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    // SAFETY: ptsname returns a static buffer; nix copies it out before
    // returning. Concurrent callers on other threads may race on that buffer.
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::PtsName)
}

impl PtyPair {
    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_name(&self) -> &str {
        &self.slave_name
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Push a new window size to this pair
    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        resize_pty(self.master_fd(), size)
    }

    /// Current window size as seen by the terminal driver
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        window_size(self.master_fd())
    }

    /// Start a spawn request whose stdio will be this pair's slave
    pub fn spawn_request<S: Into<std::ffi::OsString>>(&self, program: S) -> SpawnRequest {
        SpawnRequest::new(program, &self.slave_name)
    }

    /// Take ownership of the master descriptor
    pub fn into_master(self) -> OwnedFd {
        self.master
    }

    pub fn into_parts(self) -> (OwnedFd, String) {
        (self.master, self.slave_name)
    }
}

impl AsFd for PtyPair {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl AsRawFd for PtyPair {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}
