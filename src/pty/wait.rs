//! Waiting for a spawned child to exit
//!
//! Raw wait statuses are normalized the way shells report them: a normal
//! exit yields the process's own code, death by signal yields 128 plus the
//! signal number.

use std::fmt;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::{PtyError, PtyResult};

/// Granularity of a bounded wait
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long [`wait_child`] may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until the child terminates
    Infinite,
    /// Give up after roughly this long, in [`POLL_INTERVAL`] steps
    Bounded(Duration),
}

impl WaitTimeout {
    /// Negative values mean "wait forever"
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            WaitTimeout::Infinite
        } else {
            WaitTimeout::Bounded(Duration::from_millis(ms as u64))
        }
    }
}

impl From<Option<Duration>> for WaitTimeout {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(WaitTimeout::Infinite, WaitTimeout::Bounded)
    }
}

impl From<Duration> for WaitTimeout {
    fn from(timeout: Duration) -> Self {
        WaitTimeout::Bounded(timeout)
    }
}

/// Normalized exit code of a terminated child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitOutcome {
    code: i32,
}

impl ExitOutcome {
    /// The status had neither an exit code nor a terminating signal
    pub const UNKNOWN: ExitOutcome = ExitOutcome { code: -1 };

    const SIGNAL_BASE: i32 = 128;

    pub fn from_code(code: i32) -> Self {
        Self { code }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: Self::SIGNAL_BASE + signal,
        }
    }

    /// Translate a wait status; `None` while the child is still running
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::StillAlive => None,
            WaitStatus::Exited(_, code) => Some(Self::from_code(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::from_signal(signal as i32)),
            _ => Some(Self::UNKNOWN),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Signal number by the shell convention (code above 128)
    ///
    /// A program that itself exits with such a code is indistinguishable.
    pub fn signal(&self) -> Option<i32> {
        (self.code > Self::SIGNAL_BASE).then(|| self.code - Self::SIGNAL_BASE)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "unknown status");
        }
        match self.signal() {
            Some(signal) => write!(f, "exit code {} (signal {})", self.code, signal),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Result of [`wait_child`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Exited(ExitOutcome),
    TimedOut,
}

impl WaitResult {
    pub fn outcome(&self) -> Option<ExitOutcome> {
        match self {
            WaitResult::Exited(outcome) => Some(*outcome),
            WaitResult::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitResult::TimedOut)
    }
}

/// Wait for `pid` to terminate and reap it
///
/// A bounded wait of zero reports [`WaitResult::TimedOut`] without polling.
/// Waiting on a pid that is not a child of this process fails with `ECHILD`.
pub fn wait_child(pid: Pid, timeout: WaitTimeout) -> PtyResult<WaitResult> {
    match timeout {
        WaitTimeout::Infinite => wait_blocking(pid),
        WaitTimeout::Bounded(limit) => wait_bounded(pid, limit),
    }
}

fn wait_blocking(pid: Pid) -> PtyResult<WaitResult> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(WaitResult::Exited(translate(status))),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PtyError::Wait(e)),
        }
    }
}

fn wait_bounded(pid: Pid, limit: Duration) -> PtyResult<WaitResult> {
    let mut elapsed = Duration::ZERO;
    while elapsed < limit {
        if let Some(outcome) = poll_once(pid)? {
            return Ok(WaitResult::Exited(outcome));
        }
        thread::sleep(POLL_INTERVAL);
        elapsed += POLL_INTERVAL;
    }
    tracing::debug!(pid = pid.as_raw(), ?limit, "wait timed out");
    Ok(WaitResult::TimedOut)
}

/// One non-blocking reap attempt
pub(crate) fn poll_once(pid: Pid) -> PtyResult<Option<ExitOutcome>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(None),
        Ok(status) => Ok(Some(translate(status))),
        Err(e) => Err(PtyError::Wait(e)),
    }
}

fn translate(status: WaitStatus) -> ExitOutcome {
    ExitOutcome::from_wait_status(status).unwrap_or(ExitOutcome::UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use proptest::prelude::*;
    use std::process::Command;

    fn spawn_sh(script: &str) -> Pid {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .spawn()
            .expect("Failed to spawn sh");
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_from_millis() {
        assert_eq!(WaitTimeout::from_millis(-1), WaitTimeout::Infinite);
        assert_eq!(
            WaitTimeout::from_millis(250),
            WaitTimeout::Bounded(Duration::from_millis(250))
        );
        assert_eq!(WaitTimeout::from(None), WaitTimeout::Infinite);
    }

    #[test]
    fn test_still_alive_is_not_an_outcome() {
        assert_eq!(ExitOutcome::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_stopped_is_unknown() {
        let status = WaitStatus::Stopped(Pid::from_raw(1), Signal::SIGSTOP);
        let outcome = ExitOutcome::from_wait_status(status).unwrap();
        assert!(outcome.is_unknown());
        assert_eq!(outcome.code(), -1);
    }

    #[test]
    fn test_wait_infinite_exit_code() {
        let pid = spawn_sh("exit 7");
        let result = wait_child(pid, WaitTimeout::Infinite).unwrap();
        assert_eq!(result, WaitResult::Exited(ExitOutcome::from_code(7)));
    }

    #[test]
    fn test_wait_bounded_signal() {
        let pid = spawn_sh("kill -TERM $$");
        let result = wait_child(pid, WaitTimeout::from_millis(5000)).unwrap();
        let outcome = result.outcome().unwrap();
        assert_eq!(outcome.code(), 128 + Signal::SIGTERM as i32);
        assert_eq!(outcome.signal(), Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn test_wait_bounded_times_out() {
        let pid = spawn_sh("sleep 1");
        let result = wait_child(pid, WaitTimeout::from_millis(50)).unwrap();
        assert!(result.is_timed_out());
        let result = wait_child(pid, WaitTimeout::Infinite).unwrap();
        assert_eq!(result.outcome(), Some(ExitOutcome::from_code(0)));
    }

    #[test]
    fn test_zero_bound_does_not_poll() {
        let result = wait_child(Pid::from_raw(1), WaitTimeout::from_millis(0)).unwrap();
        assert!(result.is_timed_out());
    }

    #[test]
    fn test_wait_not_a_child() {
        let err = wait_child(Pid::from_raw(1), WaitTimeout::Infinite).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ECHILD));

        let err = wait_child(Pid::from_raw(1), WaitTimeout::from_millis(100)).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ECHILD));
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitOutcome::from_code(3).to_string(), "exit code 3");
        assert_eq!(ExitOutcome::from_signal(9).to_string(), "exit code 137 (signal 9)");
        assert_eq!(ExitOutcome::UNKNOWN.to_string(), "unknown status");
    }

    proptest! {
        #[test]
        fn exited_keeps_code(code in 0i32..=255) {
            let status = WaitStatus::Exited(Pid::from_raw(42), code);
            let outcome = ExitOutcome::from_wait_status(status).unwrap();
            prop_assert_eq!(outcome.code(), code);
            prop_assert_eq!(outcome.success(), code == 0);
        }

        #[test]
        fn signaled_adds_128(index in 0usize..Signal::iterator().count(), core in any::<bool>()) {
            let signal = Signal::iterator().nth(index).unwrap();
            let status = WaitStatus::Signaled(Pid::from_raw(42), signal, core);
            let outcome = ExitOutcome::from_wait_status(status).unwrap();
            prop_assert_eq!(outcome.code(), 128 + signal as i32);
            prop_assert_eq!(outcome.signal(), Some(signal as i32));
        }
    }
}
