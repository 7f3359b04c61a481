//! Messages exchanged with the container process during start.
//!
//! The child drives the conversation: the parent reads messages until
//! EOF and answers each one. A message the active driver does not
//! expect is a fatal protocol error.

use serde::{Deserialize, Serialize};
use std::{fmt, os::unix::prelude::RawFd};

/// Sync byte telling the bootstrap helper to enter a new cgroup
/// namespace now that the parent has placed it in the right cgroup.
/// Must match the value compiled into the helper binary.
pub const CREATE_CGROUPNS: u8 = 1 << 7;

/// Message kinds of the sync protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// Child announces it wants to hand over a pty master fd.
    #[serde(rename = "procConsole")]
    Console,
    /// Parent is ready to receive the pty master.
    #[serde(rename = "procConsoleReq")]
    ConsoleReq,
    /// Parent has received the pty master.
    #[serde(rename = "procConsoleAck")]
    ConsoleAck,
    /// Child completed namespace entry and awaits cgroup settings and
    /// prestart hooks.
    #[serde(rename = "procReady")]
    Ready,
    /// Parent releases the child past the ready barrier.
    #[serde(rename = "procRun")]
    Run,
    /// Child set up its mount namespace and requests prestart hooks.
    #[serde(rename = "procHooks")]
    Hooks,
    /// Parent releases the child past the hooks barrier.
    #[serde(rename = "procResume")]
    Resume,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncKind::Console => "procConsole",
            SyncKind::ConsoleReq => "procConsoleReq",
            SyncKind::ConsoleAck => "procConsoleAck",
            SyncKind::Ready => "procReady",
            SyncKind::Run => "procRun",
            SyncKind::Hooks => "procHooks",
            SyncKind::Resume => "procResume",
        };
        write!(f, "{name}")
    }
}

/// A sync protocol message. The fd field is advisory; actual fds travel
/// as ancillary data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: SyncKind,
    /// Optional fd number announced by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<RawFd>,
}

impl From<SyncKind> for SyncMessage {
    fn from(kind: SyncKind) -> Self {
        SyncMessage { kind, fd: None }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn wire_format() {
        let json = serde_json::to_string(&SyncMessage::from(SyncKind::Ready)).unwrap();
        assert_eq!(json, "{\"type\":\"procReady\"}");
        let json = serde_json::to_string(&SyncMessage {
            kind: SyncKind::Console,
            fd: Some(5),
        })
        .unwrap();
        assert_eq!(json, "{\"type\":\"procConsole\",\"fd\":5}");
    }

    #[test]
    fn round_trip() {
        for kind in [
            SyncKind::Console,
            SyncKind::ConsoleReq,
            SyncKind::ConsoleAck,
            SyncKind::Ready,
            SyncKind::Run,
            SyncKind::Hooks,
            SyncKind::Resume,
        ] {
            let json = serde_json::to_string(&SyncMessage::from(kind)).unwrap();
            let message: SyncMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(message.kind, kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<SyncMessage>("{\"type\":\"procBogus\"}").is_err());
    }

    #[test]
    fn cgroupns_sync_byte() {
        assert_eq!(CREATE_CGROUPNS, 0x80);
    }
}
