//! Child process spawning on a PTY slave
//!
//! The child becomes a session leader whose controlling terminal and stdio
//! are the slave device, then replaces its image with the requested program.
//!
//! Everything the child touches between `fork` and `execve` is built up
//! front: C strings, the NULL-terminated argv/envp arrays, the environment
//! snapshot and the resolved program path. The child branch itself only
//! makes async-signal-safe calls, so spawning from a multi-threaded process
//! is sound.

use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libc::{c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, close, dup2, fork, read, setsid, ForkResult, Pid};

use super::signals::{reset_signal_handlers, SignalMaskGuard};
use super::wait::{poll_once, wait_child, ExitOutcome, WaitResult, WaitTimeout};
use super::{PtyError, PtyResult};

/// Exit code of a child whose setup or exec failed
///
/// A program that exits with 127 on its own looks the same to [`wait_child`];
/// enable [`SpawnRequest::report_setup_failures`] to tell them apart.
pub const EXEC_FAILURE_EXIT_CODE: i32 = 127;

/// Step of child setup that failed, as reported over the setup channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStage {
    NewSession = 1,
    OpenSlave = 2,
    BindStdin = 3,
    BindStdout = 4,
    BindStderr = 5,
    Exec = 6,
}

impl SetupStage {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SetupStage::NewSession),
            2 => Some(SetupStage::OpenSlave),
            3 => Some(SetupStage::BindStdin),
            4 => Some(SetupStage::BindStdout),
            5 => Some(SetupStage::BindStderr),
            6 => Some(SetupStage::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::NewSession => "new session",
            SetupStage::OpenSlave => "open slave",
            SetupStage::BindStdin => "bind stdin",
            SetupStage::BindStdout => "bind stdout",
            SetupStage::BindStderr => "bind stderr",
            SetupStage::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Everything needed to start one child on a PTY slave
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    program: OsString,
    argv: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    slave_name: OsString,
    cwd: Option<PathBuf>,
    search_path: bool,
    report_setup_failures: bool,
}

impl SpawnRequest {
    /// Create a request for `program` on the slave device `slave_name`
    ///
    /// `argv[0]` defaults to the program itself and the environment is
    /// inherited from this process at spawn time.
    pub fn new<P, S>(program: P, slave_name: S) -> Self
    where
        P: Into<OsString>,
        S: Into<OsString>,
    {
        let program = program.into();
        Self {
            argv: vec![program.clone()],
            program,
            env: None,
            slave_name: slave_name.into(),
            cwd: None,
            search_path: false,
            report_setup_failures: false,
        }
    }

    /// Append an argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.argv.push(arg.as_ref().to_os_string());
        self
    }

    /// Append multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Replace the whole argument vector, `argv[0]` included
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv = argv
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        self
    }

    /// Set an environment variable
    ///
    /// If no explicit environment was given yet, this process's current
    /// environment is captured first and the variable is set on top of it.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        let key = key.as_ref().to_os_string();
        let vars = self.env.get_or_insert_with(|| std::env::vars_os().collect());
        vars.retain(|(existing, _)| *existing != key);
        vars.push((key, value.as_ref().to_os_string()));
        self
    }

    /// Use exactly these environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string()))
                .collect(),
        );
        self
    }

    /// Start the child with an empty environment
    pub fn env_clear(mut self) -> Self {
        self.env = Some(Vec::new());
        self
    }

    /// Change to `dir` before exec; failure to do so is ignored
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Resolve a program name without a `/` through `PATH` before forking
    pub fn search_path(mut self, search: bool) -> Self {
        self.search_path = search;
        self
    }

    /// Report child setup failures from [`spawn_child`] instead of only
    /// through exit code 127
    pub fn report_setup_failures(mut self, report: bool) -> Self {
        self.report_setup_failures = report;
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_argv(&self) -> &[OsString] {
        &self.argv
    }

    /// `None` when the environment is inherited
    pub fn get_env(&self) -> Option<&[(OsString, OsString)]> {
        self.env.as_deref()
    }

    pub fn get_slave_name(&self) -> &OsStr {
        &self.slave_name
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn prepare(self) -> PtyResult<PreparedSpawn> {
        if self.program.is_empty() {
            return Err(PtyError::InvalidArgument("program path is empty".into()));
        }
        if self.argv.is_empty() {
            return Err(PtyError::InvalidArgument("argument vector is empty".into()));
        }
        if self.slave_name.is_empty() {
            return Err(PtyError::InvalidArgument("slave name is empty".into()));
        }

        let program = if self.search_path {
            resolve_program(&self.program)
        } else {
            PathBuf::from(self.program)
        };

        let argv = self
            .argv
            .iter()
            .map(|arg| to_cstring("argument", arg))
            .collect::<PtyResult<Vec<_>>>()?;

        let vars = match self.env {
            Some(vars) => vars,
            None => std::env::vars_os().collect(),
        };
        let envp = vars
            .iter()
            .map(|(key, value)| env_entry(key, value))
            .collect::<PtyResult<Vec<_>>>()?;

        let cwd = match self.cwd {
            Some(dir) if !dir.as_os_str().is_empty() => {
                Some(to_cstring("working directory", dir.as_os_str())?)
            },
            _ => None,
        };

        Ok(PreparedSpawn {
            program: to_cstring("program path", program.as_os_str())?,
            argv,
            envp,
            slave_name: to_cstring("slave name", &self.slave_name)?,
            cwd,
        })
    }
}

/// Owned C representation of a [`SpawnRequest`]
struct PreparedSpawn {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    slave_name: CString,
    cwd: Option<CString>,
}

fn to_cstring(what: &str, value: &OsStr) -> PtyResult<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| PtyError::InvalidArgument(format!("{} contains a NUL byte", what)))
}

fn env_entry(key: &OsStr, value: &OsStr) -> PtyResult<CString> {
    if key.is_empty() || key.as_bytes().contains(&b'=') {
        return Err(PtyError::InvalidArgument(format!(
            "invalid environment variable name {:?}",
            key
        )));
    }
    let mut entry = key.as_bytes().to_vec();
    entry.push(b'=');
    entry.extend_from_slice(value.as_bytes());
    CString::new(entry)
        .map_err(|_| PtyError::InvalidArgument("environment entry contains a NUL byte".into()))
}

fn resolve_program(program: &OsStr) -> PathBuf {
    if program.as_bytes().contains(&b'/') {
        return PathBuf::from(program);
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| is_executable(candidate))
        })
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// NULL-terminated pointer array into `strings`, which must outlive it
fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Stage tag followed by the errno in native byte order
const SETUP_REPORT_LEN: usize = 5;

/// Lowest descriptor the child's report end may use, so binding stdio
/// never replaces it
const MIN_REPORT_FD: RawFd = STDERR_FILENO + 1;

/// Close-on-exec pipe over which the child reports a failed setup step.
/// A successful exec closes the write end, so the parent reads EOF.
struct SetupChannel {
    read: OwnedFd,
    write: OwnedFd,
}

impl SetupChannel {
    fn open() -> PtyResult<Self> {
        let (read, write) = cloexec_pipe().map_err(PtyError::ErrorChannel)?;
        let write = raise_fd(write, MIN_REPORT_FD).map_err(PtyError::ErrorChannel)?;
        Ok(Self { read, write })
    }

    fn into_child_end(self) -> RawFd {
        drop(self.read);
        self.write.into_raw_fd()
    }

    fn read_report(self) -> PtyResult<Option<(SetupStage, Errno)>> {
        let Self { read: reader, write } = self;
        drop(write);

        let mut message = [0u8; SETUP_REPORT_LEN];
        let mut filled = 0;
        while filled < SETUP_REPORT_LEN {
            match read(reader.as_raw_fd(), &mut message[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PtyError::ErrorChannel(e)),
            }
        }
        if filled == 0 {
            return Ok(None);
        }

        let stage = match SetupStage::from_tag(message[0]) {
            Some(stage) if filled == SETUP_REPORT_LEN => stage,
            _ => return Err(PtyError::ErrorChannel(Errno::EPROTO)),
        };
        let mut code = [0u8; 4];
        code.copy_from_slice(&message[1..]);
        Ok(Some((stage, Errno::from_raw(i32::from_ne_bytes(code)))))
    }
}

/// Move `fd` to a close-on-exec descriptor numbered at least `min`
fn raise_fd(fd: OwnedFd, min: RawFd) -> nix::Result<OwnedFd> {
    if fd.as_raw_fd() >= min {
        return Ok(fd);
    }
    let raised = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(min))?;
    // SAFETY: fcntl just returned this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::FdFlag;

    let (read, write) = nix::unistd::pipe()?;
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((read, write))
}

/// Spawn the program described by `request` on its PTY slave
///
/// Errors are returned only for failures before or at `fork`, unless
/// [`SpawnRequest::report_setup_failures`] is set. Otherwise a failed child
/// setup shows up as exit code [`EXEC_FAILURE_EXIT_CODE`] from
/// [`wait_child`].
pub fn spawn_child(request: SpawnRequest) -> PtyResult<ChildProcess> {
    let report = request.report_setup_failures;
    let prepared = request.prepare()?;
    let argv = pointer_array(&prepared.argv);
    let envp = pointer_array(&prepared.envp);
    let channel = if report {
        Some(SetupChannel::open()?)
    } else {
        None
    };

    let mask = SignalMaskGuard::block_all()?;

    // SAFETY: the child branch only makes async-signal-safe calls before it
    // either execs or calls _exit
    match unsafe { fork() } {
        Err(e) => {
            mask.restore();
            Err(PtyError::Fork(e))
        },
        Ok(ForkResult::Child) => {
            let report_fd = channel.map(SetupChannel::into_child_end);
            exec_child(&prepared, &argv, &envp, mask, report_fd)
        },
        Ok(ForkResult::Parent { child }) => {
            mask.restore();
            let mut child = ChildProcess::new(child);
            tracing::debug!(
                pid = child.pid.as_raw(),
                program = ?prepared.program,
                slave = ?prepared.slave_name,
                "spawned child"
            );

            if let Some(channel) = channel {
                match channel.read_report() {
                    Ok(None) => {},
                    Ok(Some((stage, errno))) => {
                        let _ = child.wait(WaitTimeout::Infinite);
                        return Err(PtyError::ChildSetup {
                            stage,
                            source: errno,
                        });
                    },
                    Err(e) => {
                        tracing::warn!(pid = child.pid.as_raw(), "setup report unreadable: {}", e);
                        child.abandon();
                        return Err(e);
                    },
                }
            }
            Ok(child)
        },
    }
}

/// Runs in the forked child and never returns
fn exec_child(
    prepared: &PreparedSpawn,
    argv: &[*const c_char],
    envp: &[*const c_char],
    mask: SignalMaskGuard,
    report_fd: Option<RawFd>,
) -> ! {
    // Dispositions go back to default before anything can be delivered
    reset_signal_handlers();
    mask.restore();

    if let Err(e) = setsid() {
        fail_child(report_fd, SetupStage::NewSession, e);
    }

    // As a session leader without a controlling terminal, opening the
    // slave usually makes it the controlling terminal already
    let slave_fd = match open(prepared.slave_name.as_c_str(), OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => fail_child(report_fd, SetupStage::OpenSlave, e),
    };
    set_controlling_terminal(slave_fd);

    for (target, stage) in [
        (STDIN_FILENO, SetupStage::BindStdin),
        (STDOUT_FILENO, SetupStage::BindStdout),
        (STDERR_FILENO, SetupStage::BindStderr),
    ] {
        if let Err(e) = dup2(slave_fd, target) {
            fail_child(report_fd, stage, e);
        }
    }
    if slave_fd > STDERR_FILENO {
        let _ = close(slave_fd);
    }

    // A missing directory should not keep the program from starting
    if let Some(cwd) = &prepared.cwd {
        let _ = chdir(cwd.as_c_str());
    }

    // SAFETY: argv and envp are NULL-terminated and point into CStrings
    // owned by `prepared`, which outlives this call
    unsafe {
        libc::execve(prepared.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    fail_child(report_fd, SetupStage::Exec, Errno::last())
}

/// Make `slave_fd` the controlling terminal; best effort
fn set_controlling_terminal(slave_fd: RawFd) {
    // TIOCSCTTY is 0x540E on Linux and 0x20007461 on BSD-derived kernels;
    // libc picks the right one per target.
    // SAFETY: TIOCSCTTY takes an integer argument and reports failure
    // through the return value
    unsafe {
        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
            // Forcing variant; its result is not checked
            libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 1);
        }
    }
}

fn fail_child(report_fd: Option<RawFd>, stage: SetupStage, errno: Errno) -> ! {
    if let Some(fd) = report_fd {
        let mut message = [0u8; SETUP_REPORT_LEN];
        message[0] = stage as u8;
        message[1..].copy_from_slice(&(errno as i32).to_ne_bytes());
        // SAFETY: write(2) is async-signal-safe and the buffer is valid for its length
        let _ = unsafe { libc::write(fd, message.as_ptr().cast(), message.len()) };
    }
    // SAFETY: _exit skips atexit handlers and stdio buffers shared with the parent
    unsafe { libc::_exit(EXEC_FAILURE_EXIT_CODE) }
}

/// A spawned child process
///
/// Dropping the handle makes one non-blocking attempt to reap the child; it
/// never blocks and never kills. Use [`ChildProcess::into_pid`] to detach.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    reaped: bool,
}

impl ChildProcess {
    fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the child to exit; see [`wait_child`]
    pub fn wait(&mut self, timeout: WaitTimeout) -> PtyResult<WaitResult> {
        let result = wait_child(self.pid, timeout)?;
        if !result.is_timed_out() {
            self.reaped = true;
        }
        Ok(result)
    }

    /// Check if the child has exited (non-blocking)
    pub fn try_wait(&mut self) -> PtyResult<Option<ExitOutcome>> {
        let outcome = poll_once(self.pid)?;
        if outcome.is_some() {
            self.reaped = true;
        }
        Ok(outcome)
    }

    /// Send a signal to the child
    ///
    /// Fails with `ESRCH` once the child has been reaped, since its pid may
    /// already belong to another process.
    pub fn signal(&self, signal: Signal) -> PtyResult<()> {
        if self.reaped {
            return Err(PtyError::Signal(Errno::ESRCH));
        }
        kill(self.pid, signal).map_err(PtyError::Signal)
    }

    /// Kill the child process
    pub fn kill(&self) -> PtyResult<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Kill and reap a child whose spawn is being given up
    fn abandon(mut self) {
        let _ = self.kill();
        let _ = self.wait(WaitTimeout::Infinite);
    }

    /// Give up ownership without reaping
    pub fn into_pid(self) -> Pid {
        let pid = self.pid;
        std::mem::forget(self);
        pid
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = poll_once(self.pid);
        }
    }
}
