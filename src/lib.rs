//! ptyspawn
//!
//! Spawns child processes attached to a pseudoterminal as their controlling
//! terminal, so shells, multiplexers and full-screen editors behave the same
//! as when started from a real terminal.
//!
//! - `pty`: pair allocation, child spawning, resizing and exit waiting
//! - `config`: serializable settings for the `ptyspawn` front end
//!
//! Reading and writing the master descriptor is left to the caller.

#[cfg(unix)]
pub mod config;
#[cfg(unix)]
pub mod pty;

#[cfg(unix)]
pub use pty::{
    allocate_pty, resize_pty, spawn_child, wait_child, ChildProcess, ExitOutcome, PtyError,
    PtyPair, PtyResult, SpawnRequest, WaitResult, WaitTimeout, WindowSize,
};
