//! Daemon server module for Unix socket-based communication.

mod connection;
mod core;
mod dispatch;
mod lifecycle;
mod reaper;


pub use core::{DaemonServer, RunOutcome};
pub use dispatch::Dispatcher;
