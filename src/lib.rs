//! Bosun container process orchestration
//!
//! Bosun drives the parent side of a container start: it launches the
//! bootstrap helper that performs the namespace transitions, tracks the
//! re-parented container init process, applies cgroup membership and
//! resource limits while the parent still holds the privilege to do so,
//! and synchronizes with the child over a private socket until the
//! workload is released to exec.

#![deny(missing_docs)]
#![deny(
    clippy::all,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::unwrap_used
)]

/// The parent side runtime: process drivers, sync protocol and plumbing.
pub mod runtime;
