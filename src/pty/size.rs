//! Window size management for PTY

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use super::{PtyError, PtyResult};

/// Terminal geometry in character cells
///
/// Pixel dimensions are not tracked and are always sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Number of rows (lines)
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// True if either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }

    /// Create from libc winsize structure, dropping the pixel fields
    pub fn from_winsize(ws: libc::winsize) -> Self {
        Self {
            cols: ws.ws_col,
            rows: ws.ws_row,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Push a new window size to the terminal driver behind `master`
///
/// The kernel delivers SIGWINCH to the foreground process group of the
/// slave when the size actually changes.
pub fn resize_pty(master: RawFd, size: WindowSize) -> PtyResult<()> {
    let ws = size.to_winsize();
    // SAFETY: TIOCSWINSZ only reads a winsize through a valid pointer; a bad
    // descriptor is reported through the return value
    let result = unsafe { libc::ioctl(master, libc::TIOCSWINSZ as _, &ws) };
    if result == -1 {
        return Err(PtyError::SetWindowSize(Errno::last()));
    }
    tracing::trace!(fd = master, cols = size.cols, rows = size.rows, "window size set");
    Ok(())
}

/// Query the window size of a terminal descriptor
pub fn window_size(fd: RawFd) -> PtyResult<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a winsize through a valid, exclusively borrowed pointer
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
    if result == -1 {
        return Err(PtyError::GetWindowSize(Errno::last()));
    }
    Ok(WindowSize::from_winsize(ws))
}
