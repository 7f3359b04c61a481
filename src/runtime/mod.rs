//! Parent side drivers for container start and join.
//!
//! A container start spans three processes: this one, the bootstrap
//! helper that performs the clone/unshare/setns transitions before a
//! thread rich runtime can initialize in the child, and the final init
//! process that execs the workload. The drivers in [`process`] own the
//! parent end of that handshake.

/// Cgroup manager interface and helpers.
pub mod cgroups;
/// Container configuration exchanged with the init process.
pub mod config;
mod error;
mod exit_status;
/// Lifecycle hooks.
pub mod hooks;
/// Socket plumbing between parent and child.
pub mod ipc;
/// Network interface creation strategies.
pub mod network;
/// The process drivers.
pub mod process;
/// Sync protocol messages.
pub mod sync;

pub use error::Error;
pub use exit_status::{ExitCode, ExitStatus};

/// Process identifier.
pub type Pid = u32;
