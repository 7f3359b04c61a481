//! Launching the bootstrap helper binary.
//!
//! The helper performs the clone/unshare/setns dance in a small native
//! process, before a thread rich runtime could make namespace entry
//! impossible. It inherits the child end of the sync socket at a fixed
//! fd slot, reads the opaque bootstrap byte stream from it and, before
//! exiting, writes a [`PidRecord`] naming the grandchild it left
//! behind. The grandchild is created with CLONE_PARENT semantics, so it
//! is a direct, waitable child of this process.

use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd,
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs::File,
    io,
    os::unix::{
        net::UnixStream,
        prelude::{AsRawFd, OwnedFd, RawFd},
        process::CommandExt,
    },
    path::PathBuf,
    process::{Child, Command, Stdio},
};

use crate::runtime::{ipc::os_err, Pid};

/// Fd slot at which the helper finds the child end of the sync socket.
pub const SYNC_FD: RawFd = 3;
/// Fd slot of the inherited container root directory handle.
pub const ROOT_FD: RawFd = 4;
/// Environment variable naming the sync socket slot for the helper.
pub const ENV_SYNC_FD: &str = "BOSUN_SYNC_FD";
/// Environment variable naming the root directory slot for the helper.
pub const ENV_ROOT_FD: &str = "BOSUN_ROOT_FD";

/// Slot floor for parking fds while rearranging the child's fd table.
const FD_FLOOR: RawFd = 10;

/// Record the helper writes to the sync socket before exiting, naming
/// the re-parented grandchild.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PidRecord {
    /// Pid of the grandchild.
    pub pid: Pid,
}

/// Description of a bootstrap helper invocation.
#[derive(Debug)]
pub struct HelperCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl HelperCommand {
    /// A helper invocation with inherited stdio and environment.
    pub fn new(program: impl Into<PathBuf>) -> HelperCommand {
        HelperCommand {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> HelperCommand {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> HelperCommand {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Use `fd` as the helper's stdin.
    pub fn stdin(mut self, fd: OwnedFd) -> HelperCommand {
        self.stdin = Some(fd);
        self
    }

    /// Use `fd` as the helper's stdout.
    pub fn stdout(mut self, fd: OwnedFd) -> HelperCommand {
        self.stdout = Some(fd);
        self
    }

    /// Use `fd` as the helper's stderr.
    pub fn stderr(mut self, fd: OwnedFd) -> HelperCommand {
        self.stderr = Some(fd);
        self
    }

    /// Spawn the helper with `sync` at the [`SYNC_FD`] slot and, if
    /// given, `root_dir` at [`ROOT_FD`]. The caller keeps its own ends
    /// and must close the child end right after the spawn.
    pub(crate) fn spawn(
        &mut self,
        sync: &UnixStream,
        root_dir: Option<&File>,
    ) -> io::Result<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.env(ENV_SYNC_FD, SYNC_FD.to_string());

        match self.stdin.take() {
            Some(fd) => command.stdin(Stdio::from(fd)),
            None => command.stdin(Stdio::inherit()),
        };
        match self.stdout.take() {
            Some(fd) => command.stdout(Stdio::from(fd)),
            None => command.stdout(Stdio::inherit()),
        };
        match self.stderr.take() {
            Some(fd) => command.stderr(Stdio::from(fd)),
            None => command.stderr(Stdio::inherit()),
        };

        let sync_fd = sync.as_raw_fd();
        let root_fd = root_dir.map(AsRawFd::as_raw_fd);
        if root_fd.is_some() {
            command.env(ENV_ROOT_FD, ROOT_FD.to_string());
        }

        unsafe {
            command.pre_exec(move || {
                // Lift the sources clear of the target slots before
                // landing them, otherwise one dup2 could close the
                // other source. The originals are close-on-exec; the
                // parked copies are closed explicitly.
                let sync = fcntl(sync_fd, FcntlArg::F_DUPFD(FD_FLOOR)).map_err(os_err)?;
                let root = match root_fd {
                    Some(fd) => Some(fcntl(fd, FcntlArg::F_DUPFD(FD_FLOOR)).map_err(os_err)?),
                    None => None,
                };
                unistd::dup2(sync, SYNC_FD).map_err(os_err)?;
                unistd::close(sync).map_err(os_err)?;
                if let Some(root) = root {
                    unistd::dup2(root, ROOT_FD).map_err(os_err)?;
                    unistd::close(root).map_err(os_err)?;
                }
                Ok(())
            });
        }

        command.spawn()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::runtime::ipc::socket_pair;
    use std::{io::Read, os::unix::prelude::FromRawFd};

    #[test]
    fn helper_inherits_sync_socket_at_fixed_slot() {
        let (mut parent, child) = socket_pair().unwrap().into_parts();

        let mut helper = HelperCommand::new("/bin/sh")
            .arg("-c")
            .arg("printf '%s' \"$BOSUN_SYNC_FD\" >&3")
            .spawn(&child, None)
            .unwrap();
        drop(child);

        let mut announced = String::new();
        parent.read_to_string(&mut announced).unwrap();
        assert_eq!(announced, SYNC_FD.to_string());
        assert!(helper.wait().unwrap().success());
    }

    #[test]
    fn helper_inherits_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "present").unwrap();
        let root = File::open(dir.path()).unwrap();

        let (mut parent, child) = socket_pair().unwrap().into_parts();
        let mut helper = HelperCommand::new("/bin/sh")
            .arg("-c")
            // The root dir slot is a directory fd usable with *at semantics
            .arg("cat /proc/self/fd/4/marker >&3")
            .spawn(&child, Some(&root))
            .unwrap();
        drop(child);

        let mut content = String::new();
        parent.read_to_string(&mut content).unwrap();
        assert_eq!(content, "present");
        assert!(helper.wait().unwrap().success());
    }

    #[test]
    fn stdio_endpoints() {
        let (_parent, child) = socket_pair().unwrap().into_parts();
        let (stdout_read, stdout_write) = unistd::pipe().unwrap();
        let stdout_write = unsafe { OwnedFd::from_raw_fd(stdout_write) };

        let mut helper = HelperCommand::new("/bin/sh")
            .arg("-c")
            .arg("echo out")
            .stdout(stdout_write)
            .spawn(&child, None)
            .unwrap();
        drop(child);

        let mut out = String::new();
        let mut stdout = unsafe { File::from_raw_fd(stdout_read) };
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "out\n");
        assert!(helper.wait().unwrap().success());
    }
}
