//! Container lifecycle hooks.
//!
//! Hooks are caller supplied executables invoked at defined points of
//! the start sequence. The hook state record is serialized to the
//! hook's stdin. Hooks run sequentially; the first failure aborts the
//! sequence.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    io::{ErrorKind, Write},
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::runtime::{ExitStatus, Pid};

/// Hooks grouped by invocation point.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Hooks {
    /// Run before the container process is released to exec the
    /// workload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<Hook>,
    /// Run after the workload has started. Invoked by the outer
    /// container lifecycle, not by the process drivers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<Hook>,
}

/// A single hook executable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hook {
    /// Path of the executable.
    pub program: PathBuf,
    /// Arguments, not including the program name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment as `key=value` entries. When empty the hook inherits
    /// the parent environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// State passed to each hook on stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookState {
    /// Configuration format version.
    pub version: String,
    /// Container id.
    pub id: String,
    /// Pid of the container process.
    pub pid: Pid,
    /// Bundle directory of the container.
    #[serde(rename = "bundlePath")]
    pub bundle_path: String,
}

impl Hook {
    /// Run the hook to completion. Non zero exit is a failure.
    pub fn run(&self, state: &HookState) -> Result<()> {
        debug!(
            "Running hook {} {}",
            self.program.display(),
            self.args.iter().join(" ")
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !self.env.is_empty() {
            command.env_clear();
            command.envs(self.env.iter().filter_map(|env| env.split_once('=')));
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning hook {}", self.program.display()))?;

        // A hook is not obliged to read its stdin. Ignore the broken
        // pipe when it exits without consuming the state.
        if let Some(mut stdin) = child.stdin.take() {
            let state = serde_json::to_vec(state).context("encoding hook state")?;
            match stdin.write_all(&state) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => (),
                result => result.context("writing hook state")?,
            }
        }

        let status = child.wait().context("waiting for hook")?;
        if !status.success() {
            bail!(
                "hook {} failed with {}",
                self.program.display(),
                ExitStatus::from(status)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn state() -> HookState {
        HookState {
            version: "1.0.0".into(),
            id: "cnt-1".into(),
            pid: 4711,
            bundle_path: "/var/lib/cnt/cnt-1".into(),
        }
    }

    fn sh(script: &str) -> Hook {
        Hook {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![],
            cwd: None,
        }
    }

    #[test]
    fn success() {
        sh("exit 0").run(&state()).unwrap();
    }

    #[test]
    fn failure() {
        assert!(sh("exit 3").run(&state()).is_err());
    }

    #[test]
    fn missing_program() {
        let hook = Hook {
            program: "/nonexistent/hook".into(),
            args: vec![],
            env: vec![],
            cwd: None,
        };
        assert!(hook.run(&state()).is_err());
    }

    #[test]
    fn state_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("state");
        sh(&format!("cat > {}", out.display()))
            .run(&state())
            .unwrap();

        let written: HookState =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written.id, "cnt-1");
        assert_eq!(written.pid, 4711);
        assert_eq!(written.bundle_path, "/var/lib/cnt/cnt-1");
    }

    #[test]
    fn hook_ignoring_stdin() {
        // true exits without reading; the state write must not fail
        Hook {
            program: "/bin/true".into(),
            args: vec![],
            env: vec![],
            cwd: None,
        }
        .run(&state())
        .unwrap();
    }

    #[test]
    fn environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let mut hook = sh(&format!("printf '%s' \"$HOOK_MARK\" > {}", out.display()));
        hook.env = vec!["HOOK_MARK=mark".into(), "PATH=/bin:/usr/bin".into()];
        hook.run(&state()).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "mark");
    }
}
