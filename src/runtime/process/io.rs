//! Stdio pipe plumbing for a container process.

use nix::unistd::{self, fchown, Gid, Uid};
use std::{
    io,
    os::unix::prelude::{AsRawFd, FromRawFd, OwnedFd},
};

use super::Process;
use crate::runtime::ipc::os_err;

/// The runtime side of the container's stdio pipes.
#[derive(Debug)]
pub struct Io {
    /// Write end feeding the container's stdin.
    pub stdin: OwnedFd,
    /// Read end of the container's stdout.
    pub stdout: OwnedFd,
    /// Read end of the container's stderr.
    pub stderr: OwnedFd,
}

impl Process {
    /// Create stdio pipes for the container process. The child facing
    /// ends land on this record, the opposite ends are returned. All
    /// six fds are chowned to `uid`/`gid` so a process running as the
    /// mapped root of a user namespace can use them.
    ///
    /// Every end is owned; an error closes whatever was created.
    pub fn initialize_io(&mut self, uid: u32, gid: u32) -> io::Result<Io> {
        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;
        let (stderr_read, stderr_write) = pipe()?;

        for fd in [
            &stdin_read,
            &stdin_write,
            &stdout_read,
            &stdout_write,
            &stderr_read,
            &stderr_write,
        ] {
            fchown(
                fd.as_raw_fd(),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )
            .map_err(os_err)?;
        }

        self.stdin = Some(stdin_read);
        self.stdout = Some(stdout_write);
        self.stderr = Some(stderr_write);

        Ok(Io {
            stdin: stdin_write,
            stdout: stdout_read,
            stderr: stderr_read,
        })
    }
}

/// Opens a pipe(2) with both ends owned.
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = unistd::pipe().map_err(os_err)?;
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use std::{
        fs::File,
        io::{Read, Write},
        os::unix::fs::MetadataExt,
    };

    #[test]
    fn stdio_pipes_are_connected() {
        let mut process = Process::new();
        let uid = unistd::getuid().as_raw();
        let gid = unistd::getgid().as_raw();
        let io = process.initialize_io(uid, gid).unwrap();

        // stdin flows towards the container
        let mut writer = File::from(io.stdin);
        writer.write_all(b"input").unwrap();
        drop(writer);
        let mut buf = String::new();
        File::from(process.stdin.take().unwrap())
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "input");

        // stdout flows towards the runtime
        let mut writer = File::from(process.stdout.take().unwrap());
        writer.write_all(b"output").unwrap();
        drop(writer);
        let mut buf = String::new();
        File::from(io.stdout).read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "output");

        // stderr flows towards the runtime
        let mut writer = File::from(process.stderr.take().unwrap());
        writer.write_all(b"errors").unwrap();
        drop(writer);
        let mut buf = String::new();
        File::from(io.stderr).read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "errors");
    }

    #[test]
    fn ownership() {
        let mut process = Process::new();
        let uid = unistd::getuid().as_raw();
        let gid = unistd::getgid().as_raw();
        let io = process.initialize_io(uid, gid).unwrap();

        let metadata = File::from(io.stdout).metadata().unwrap();
        assert_eq!(metadata.uid(), uid);
        assert_eq!(metadata.gid(), gid);
    }
}
