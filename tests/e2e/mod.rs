//! End-to-end tests for the escalation daemon
//!
//! Each test runs a real `DaemonServer` on a background thread with its
//! socket in a temp directory, and drives it through the public client.

pub mod client_library;
pub mod daemon_lifecycle;
pub mod escalation_flow;
pub mod helpers;
pub mod hooks;

pub use helpers::*;
