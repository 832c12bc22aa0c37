//! PTY (Pseudoterminal) lifecycle for Unix
//!
//! This module provides the four operations needed to run a program on a
//! pseudoterminal:
//!
//! - [`allocate_pty`]: create a master/slave pair
//! - [`spawn_child`]: fork a session leader whose controlling terminal and
//!   stdio are the slave, then exec the program
//! - [`resize_pty`]: push a new window size to a live master
//! - [`wait_child`]: wait for the child, optionally with a timeout
//!
//! The operations share no state; each call works on the handles passed in.

mod pair;
mod signals;
mod size;
mod spawn;
mod wait;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

pub use pair::{allocate_pty, allocate_pty_with_capacity, PtyPair, MIN_SLAVE_NAME_CAPACITY};
pub use size::{resize_pty, window_size, WindowSize};
pub use spawn::{spawn_child, ChildProcess, SetupStage, SpawnRequest, EXEC_FAILURE_EXIT_CODE};
pub use wait::{wait_child, ExitOutcome, WaitResult, WaitTimeout, POLL_INTERVAL};

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] nix::Error),

    #[error("Failed to set close-on-exec on PTY master: {0}")]
    CloseOnExec(#[source] nix::Error),

    #[error("Failed to change signal mask: {0}")]
    SignalMask(#[source] nix::Error),

    #[error("Failed to use child setup channel: {0}")]
    ErrorChannel(#[source] nix::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Child setup failed during {stage}: {source}")]
    ChildSetup {
        stage: SetupStage,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to set window size: {0}")]
    SetWindowSize(#[source] nix::Error),

    #[error("Failed to get window size: {0}")]
    GetWindowSize(#[source] nix::Error),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),
}

/// Coarse classification of a [`PtyError`]
///
/// A bounded wait running out is not an error; it is reported as
/// [`WaitResult::TimedOut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any OS state was touched
    InvalidArgument,
    /// An underlying system call failed; see [`PtyError::errno`]
    OsFailure,
}

impl PtyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PtyError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::OsFailure,
        }
    }

    /// The OS cause code, if this error came from a system call
    pub fn errno(&self) -> Option<nix::Error> {
        match self {
            PtyError::InvalidArgument(_) => None,
            PtyError::OpenMaster(e)
            | PtyError::GrantPty(e)
            | PtyError::UnlockPty(e)
            | PtyError::PtsName(e)
            | PtyError::CloseOnExec(e)
            | PtyError::SignalMask(e)
            | PtyError::ErrorChannel(e)
            | PtyError::Fork(e)
            | PtyError::SetWindowSize(e)
            | PtyError::GetWindowSize(e)
            | PtyError::Wait(e)
            | PtyError::Signal(e) => Some(*e),
            PtyError::ChildSetup { source, .. } => Some(*source),
        }
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;
