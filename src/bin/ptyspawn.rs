//! ptyspawn - run a program on a fresh pseudoterminal
//!
//! Allocates a PTY pair, spawns the program as a session leader on the
//! slave and relays I/O between this terminal and the master until the
//! program exits. The exit code is the program's normalized exit code.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ptyspawn::config::Config;
use ptyspawn::pty::{self, ExitOutcome, WaitResult, WaitTimeout, WindowSize};

/// Exit code used when the wait timeout expires, as in timeout(1)
const TIMEOUT_EXIT_CODE: u8 = 124;

/// How long output keeps flowing after the child exits. A descendant that
/// still holds the slave open would otherwise keep the relay alive forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "ptyspawn", version, about = "Run a program on a fresh pseudoterminal")]
struct Cli {
    /// JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Terminal width
    #[arg(short, long)]
    cols: Option<u16>,

    /// Terminal height
    #[arg(short, long)]
    rows: Option<u16>,

    /// Working directory for the program
    #[arg(short = 'C', long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Kill the program if it runs longer than this
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Fail with the setup error instead of exit code 127
    #[arg(long)]
    report_setup_failures: bool,

    /// Program and arguments (default: $SHELL or /bin/sh)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            config.program = Some(program);
            config.args = command.collect();
        }
        if self.cols.is_some() {
            config.cols = self.cols;
        }
        if self.rows.is_some() {
            config.rows = self.rows;
        }
        if self.cwd.is_some() {
            config.cwd = self.cwd;
        }
        if self.timeout_ms.is_some() {
            config.wait_timeout_ms = self.timeout_ms;
        }
        config.report_setup_failures |= self.report_setup_failures;
    }
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    let size = config
        .window_size()
        .or_else(calling_terminal_size)
        .unwrap_or_default();

    let pair = pty::allocate_pty(Some(size))?;
    let mut child = pty::spawn_child(config.to_request(pair.slave_name()))?;
    tracing::info!(
        pid = child.pid().as_raw(),
        slave = pair.slave_name(),
        "Spawned {} ({}x{})",
        config.program(),
        size.cols,
        size.rows
    );

    let master = File::from(pair.into_master());
    let raw_mode = RawModeGuard::new().ok();

    let mut input = master.try_clone()?;
    thread::spawn(move || relay_input(&mut input));

    let mut output = master.try_clone()?;
    let (output_done, output_drained) = mpsc::channel();
    thread::spawn(move || {
        relay_output(&mut output);
        let _ = output_done.send(());
    });
    drop(master);

    let result = child.wait(config.wait_timeout())?;
    let code = match result {
        WaitResult::Exited(outcome) => {
            if !wait_drained(&output_drained, OUTPUT_DRAIN_TIMEOUT) {
                tracing::debug!("Slave still open after child exit, leaving output relay behind");
            }
            drop(raw_mode);
            tracing::info!("Child exited with {}", outcome);
            exit_code(outcome)
        },
        WaitResult::TimedOut => {
            drop(raw_mode);
            tracing::warn!("Child still running after {:?}, killing it", config.wait_timeout());
            child.kill()?;
            child.wait(WaitTimeout::Infinite)?;
            ExitCode::from(TIMEOUT_EXIT_CODE)
        },
    };
    Ok(code)
}

/// True once the output relay has finished, or if it is gone
fn wait_drained(done: &Receiver<()>, timeout: Duration) -> bool {
    match done.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

fn exit_code(outcome: ExitOutcome) -> ExitCode {
    exit_byte(outcome).map_or(ExitCode::FAILURE, ExitCode::from)
}

/// Codes outside 0..=255, i.e. an unknown status, have no byte form
fn exit_byte(outcome: ExitOutcome) -> Option<u8> {
    u8::try_from(outcome.code()).ok()
}

fn calling_terminal_size() -> Option<WindowSize> {
    pty::window_size(libc::STDIN_FILENO)
        .ok()
        .filter(|size| !size.is_empty())
}

/// Copy stdin to the master until stdin closes
fn relay_input(master: &mut File) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                if master.write_all(&buf[..n]).is_err() {
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Copy the master to stdout until every slave descriptor is closed
fn relay_output(master: &mut File) {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = stdout.flush();
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the slave side has hung up
            Err(e) => {
                tracing::debug!("Master read ended: {}", e);
                break;
            },
        }
    }
}

/// RAII guard for raw terminal mode on stdin
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn new() -> io::Result<Self> {
        use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};

        let original = termios::tcgetattr(io::stdin()).map_err(io::Error::from)?;

        let mut raw = original.clone();

        // Disable canonical mode, echo and signal keys
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);

        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw).map_err(io::Error::from)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}
