//! Signal mask and disposition handling around fork

use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use super::{PtyError, PtyResult};

/// Blocks every signal on the calling thread until restored or dropped
///
/// Held across `fork` so that no handler inherited from the parent can run
/// in the child before its dispositions have been reset.
pub(crate) struct SignalMaskGuard {
    previous: Option<SigSet>,
}

impl SignalMaskGuard {
    pub(crate) fn block_all() -> PtyResult<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut previous))
            .map_err(PtyError::SignalMask)?;
        Ok(Self {
            previous: Some(previous),
        })
    }

    /// Reinstate the mask that was active before [`block_all`](Self::block_all).
    /// Async-signal-safe.
    pub(crate) fn restore(mut self) {
        self.restore_previous();
    }

    fn restore_previous(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
        }
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        self.restore_previous();
    }
}

/// Reset every catchable signal to its default disposition.
/// Async-signal-safe; meant for the forked child.
pub(crate) fn reset_signal_handlers() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: SIG_DFL installs no Rust code as a handler
        let _ = unsafe { sigaction(signal, &default) };
    }
    reset_realtime_handlers();
}

#[cfg(target_os = "linux")]
fn reset_realtime_handlers() {
    // SAFETY: a zeroed sigaction has an empty mask and no flags; SIG_DFL is
    // set explicitly. Numbers reserved by libc are below SIGRTMIN().
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        for signum in libc::SIGRTMIN()..=libc::SIGRTMAX() {
            libc::sigaction(signum, &action, std::ptr::null_mut());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn reset_realtime_handlers() {}
