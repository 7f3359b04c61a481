use nix::{
    libc::{EXIT_FAILURE, EXIT_SUCCESS},
    sys::{self, signal::Signal},
};
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;

/// Exit code of a process.
pub type ExitCode = i32;

/// Exit status of a container or helper process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Process exited with exit code
    Exit(ExitCode),
    /// Process was terminated by a signal
    Signalled(u8),
}

impl ExitStatus {
    /// Exit success
    pub const SUCCESS: ExitCode = EXIT_SUCCESS;
    /// Exit failure
    pub const FAILURE: ExitCode = EXIT_FAILURE;

    /// Returns true if the exit status is success
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exit(code) if *code == Self::SUCCESS)
    }
}

impl From<Signal> for ExitStatus {
    fn from(signal: Signal) -> Self {
        ExitStatus::Signalled(signal as u8)
    }
}

impl From<ExitCode> for ExitStatus {
    fn from(code: ExitCode) -> Self {
        ExitStatus::Exit(code)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => ExitStatus::Signalled(signal as u8),
            None => ExitStatus::Exit(status.code().unwrap_or(Self::FAILURE)),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exit(code) => write!(f, "Exit({code})"),
            ExitStatus::Signalled(signal) => match sys::signal::Signal::try_from(*signal as i32) {
                Ok(signal) => write!(f, "Signalled({signal})"),
                Err(_) => write!(f, "Signalled({signal})"),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn exit_code_success() {
        assert!(ExitStatus::Exit(0).success());
        assert!(!ExitStatus::Exit(1).success());
        assert!(!ExitStatus::Signalled(9).success());
    }

    #[test]
    fn from_process_exit_status() {
        let status = std::process::Command::new("true").status().unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Exit(0));
        let status = std::process::Command::new("false").status().unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Exit(1));
    }

    #[test]
    fn display() {
        assert_eq!(ExitStatus::Exit(1).to_string(), "Exit(1)");
        assert_eq!(ExitStatus::Signalled(9).to_string(), "Signalled(SIGKILL)");
    }
}
