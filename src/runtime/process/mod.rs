//! Parent side process drivers.
//!
//! [`InitProcess`] creates a container; [`SetnsProcess`] attaches an
//! additional process to a running one. Both spawn the bootstrap
//! helper, feed it the bootstrap byte stream, recover the re-parented
//! grandchild pid from the pid record and then talk the sync protocol
//! with the container process until it is released to exec.
//!
//! Drivers are single use: `start`, then any of `signal`, `wait` or
//! `terminate`. After `wait` returns the process is reaped and further
//! signalling is undefined.

mod bootstrap;
mod init;
mod io;
mod setns;

pub use bootstrap::{HelperCommand, PidRecord, ENV_ROOT_FD, ENV_SYNC_FD, ROOT_FD, SYNC_FD};
pub use init::InitProcess;
pub use io::Io;
pub use setns::SetnsProcess;

use anyhow::{anyhow, Context, Result};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd,
};
use std::{fs, os::unix::prelude::OwnedFd, sync::mpsc::SyncSender};

use crate::runtime::{
    config::Rlimit,
    error::Error,
    exit_status::ExitStatus,
    ipc::MessageStream,
    sync::{SyncKind, SyncMessage},
    Pid,
};

/// Caller facing process record.
///
/// The stdio ends are filled by [`Process::initialize_io`] and are the
/// endpoints handed to the container process. The console channel
/// receives the pty master if the container requests one; registering a
/// receiver is mandatory for such containers. The final pid is
/// deposited by the driver once the grandchild is known.
#[derive(Debug, Default)]
pub struct Process {
    /// Read end the container uses as stdin.
    pub stdin: Option<OwnedFd>,
    /// Write end the container uses as stdout.
    pub stdout: Option<OwnedFd>,
    /// Write end the container uses as stderr.
    pub stderr: Option<OwnedFd>,
    /// Channel on which a pty master sent by the container is
    /// delivered. Use a rendezvous or capacity one channel with a
    /// receiver that does not block the driver indefinitely.
    pub console: Option<SyncSender<OwnedFd>>,
    /// Pid of the final container process.
    pub pid: Option<Pid>,
}

impl Process {
    /// A process record with no stdio and no console receiver.
    pub fn new() -> Process {
        Process::default()
    }
}

/// Operations common to both process drivers.
pub trait ContainerProcess {
    /// Pid of the tracked process. After a successful [`start`] this is
    /// the final container process, not the bootstrap helper.
    ///
    /// [`start`]: ContainerProcess::start
    fn pid(&self) -> Pid;

    /// Drive the start handshake to completion.
    fn start(&mut self) -> Result<(), Error>;

    /// Reap the tracked process and return its exit status.
    fn wait(&mut self) -> Result<ExitStatus, Error>;

    /// SIGKILL the tracked process and reap it.
    fn terminate(&mut self) -> Result<(), Error>;

    /// Send `signal` to the tracked process. A value that does not name
    /// an OS signal is an error and the process is not touched.
    fn signal(&self, signal: i32) -> Result<(), Error>;

    /// Start time of the tracked process, used to identify it across
    /// checkpoint and restore.
    fn start_time(&self) -> Result<String, Error>;

    /// Symlink targets of the process's stdio fds as recorded at start.
    fn external_descriptors(&self) -> &[String];

    /// Replace the recorded stdio fd targets, used on restore paths.
    fn set_external_descriptors(&mut self, fds: Vec<String>);
}

/// Symlink targets of fds 0 to 2 of `pid`.
///
/// The workload may move its stdio with dup2 once it runs; only the
/// original targets identify the fds at checkpoint time. The snapshot
/// is taken before the child is released past the first sync point to
/// keep the race window minimal.
pub fn pipe_fds(pid: Pid) -> Result<Vec<String>> {
    let mut fds = Vec::with_capacity(3);
    for i in 0..3 {
        let path = format!("/proc/{pid}/fd/{i}");
        let target = fs::read_link(&path).with_context(|| format!("reading {path}"))?;
        fds.push(target.to_string_lossy().into_owned());
    }
    Ok(fds)
}

/// Start time of `pid`: field 22 of /proc/pid/stat.
pub fn start_time(pid: Pid) -> Result<String> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
        .with_context(|| format!("reading stat of process {pid}"))?;
    // The comm field may contain spaces and parentheses. Fields are
    // counted from the last closing parenthesis.
    let (_, rest) = stat
        .rsplit_once(')')
        .ok_or_else(|| anyhow!("malformed stat of process {}", pid))?;
    rest.split_whitespace()
        .nth(19)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing start time in stat of process {}", pid))
}

/// Write the oom score adjustment of `pid`. Zero is the kernel default
/// and is not written.
pub(crate) fn set_oom_score_adj(score: i32, pid: Pid) -> Result<()> {
    if score == 0 {
        return Ok(());
    }
    fs::write(format!("/proc/{pid}/oom_score_adj"), score.to_string())
        .with_context(|| format!("writing oom score {score} of process {pid}"))
}

/// Install `rlimits` on `pid` with prlimit(2). Raising limits is no
/// longer possible once the process enters a user namespace, so this
/// runs from the parent before the child is released.
pub(crate) fn set_rlimits(rlimits: &[Rlimit], pid: Pid) -> Result<()> {
    use crate::runtime::config::RlimitResource;

    for rlimit in rlimits {
        let resource = match rlimit.resource {
            RlimitResource::As => libc::RLIMIT_AS,
            RlimitResource::Core => libc::RLIMIT_CORE,
            RlimitResource::Cpu => libc::RLIMIT_CPU,
            RlimitResource::Data => libc::RLIMIT_DATA,
            RlimitResource::Fsize => libc::RLIMIT_FSIZE,
            RlimitResource::Locks => libc::RLIMIT_LOCKS,
            RlimitResource::Memlock => libc::RLIMIT_MEMLOCK,
            RlimitResource::Msgqueue => libc::RLIMIT_MSGQUEUE,
            RlimitResource::Nice => libc::RLIMIT_NICE,
            RlimitResource::Nofile => libc::RLIMIT_NOFILE,
            RlimitResource::Nproc => libc::RLIMIT_NPROC,
            RlimitResource::Rss => libc::RLIMIT_RSS,
            RlimitResource::Rtprio => libc::RLIMIT_RTPRIO,
            RlimitResource::Rttime => libc::RLIMIT_RTTIME,
            RlimitResource::Sigpending => libc::RLIMIT_SIGPENDING,
            RlimitResource::Stack => libc::RLIMIT_STACK,
        };
        let limit = libc::rlimit {
            rlim_cur: rlimit.soft as libc::rlim_t,
            rlim_max: rlimit.hard as libc::rlim_t,
        };
        let result = unsafe {
            libc::prlimit(pid as libc::pid_t, resource, &limit, std::ptr::null_mut())
        };
        Errno::result(result).map(drop).with_context(|| {
            format!("setting rlimit {:?} of process {}", rlimit.resource, pid)
        })?;
    }
    Ok(())
}

/// Receive the pty master announced by the child and deliver it to the
/// console channel: request, receive via ancillary data, deposit,
/// acknowledge. The ack is only written after the channel accepted the
/// fd.
pub(crate) fn handle_console(
    stream: &mut MessageStream,
    console: Option<&SyncSender<OwnedFd>>,
) -> Result<(), Error> {
    let console = console.ok_or(Error::ConsoleReceiver)?;
    stream
        .send(&SyncMessage::from(SyncKind::ConsoleReq))
        .context("writing console fd request")?;
    let master = stream
        .recv_fd()
        .context("receiving pty master from child")?;
    console.send(master).map_err(|_| Error::ConsoleReceiver)?;
    stream
        .send(&SyncMessage::from(SyncKind::ConsoleAck))
        .context("writing console fd ack")?;
    Ok(())
}

/// Reap `pid` and return its exit status.
pub(crate) fn wait_pid(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(unistd::Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => break Ok(ExitStatus::Exit(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => break Ok(ExitStatus::Signalled(signal as u8)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => break Err(e).with_context(|| format!("waiting for process {pid}")),
        }
    }
}

/// Kill and reap a bootstrap helper that may still be alive on a
/// failure path.
pub(crate) fn discard_helper(helper: &mut std::process::Child) {
    let _ = helper.kill();
    let _ = helper.wait();
}

/// Deliver a raw signal value to `pid`, validating it first.
pub(crate) fn kill_pid(pid: Pid, signal: i32) -> Result<(), Error> {
    let signal = Signal::try_from(signal).map_err(|_| Error::Signal(signal))?;
    kill(unistd::Pid::from_raw(pid as i32), signal)
        .with_context(|| format!("sending {signal} to process {pid}"))
        .map_err(Error::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::runtime::{config::RlimitResource, ipc::socket_pair};
    use std::{io::Write, process::Command, sync::mpsc, thread};

    #[test]
    fn pipe_fds_of_self() {
        let fds = pipe_fds(std::process::id()).unwrap();
        assert_eq!(fds.len(), 3);
        for target in fds {
            assert!(!target.is_empty());
        }
    }

    #[test]
    fn pipe_fds_of_unknown_process() {
        assert!(pipe_fds(4_194_301).is_err());
    }

    #[test]
    fn start_time_of_self() {
        let time = start_time(std::process::id()).unwrap();
        assert!(time.parse::<u64>().unwrap() > 0);
    }

    #[test]
    fn rlimits_of_child() {
        let child = Command::new("sleep").arg("10").spawn().unwrap();
        let pid = child.id();

        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let result = unsafe {
            libc::prlimit(
                pid as libc::pid_t,
                libc::RLIMIT_NOFILE,
                std::ptr::null(),
                &mut current,
            )
        };
        Errno::result(result).unwrap();

        set_rlimits(
            &[Rlimit {
                resource: RlimitResource::Nofile,
                soft: current.rlim_max as u64,
                hard: current.rlim_max as u64,
            }],
            pid,
        )
        .unwrap();

        let mut applied = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let result = unsafe {
            libc::prlimit(
                pid as libc::pid_t,
                libc::RLIMIT_NOFILE,
                std::ptr::null(),
                &mut applied,
            )
        };
        Errno::result(result).unwrap();
        assert_eq!(applied.rlim_cur, current.rlim_max);

        kill_pid(pid, Signal::SIGKILL as i32).unwrap();
        assert_eq!(wait_pid(pid).unwrap(), ExitStatus::Signalled(9));
    }

    #[test]
    fn oom_score_of_child() {
        let child = Command::new("sleep").arg("10").spawn().unwrap();
        let pid = child.id();

        set_oom_score_adj(100, pid).unwrap();
        let score = fs::read_to_string(format!("/proc/{pid}/oom_score_adj")).unwrap();
        assert_eq!(score.trim(), "100");

        kill_pid(pid, Signal::SIGKILL as i32).unwrap();
        wait_pid(pid).unwrap();
    }

    #[test]
    fn oom_score_zero_is_not_written() {
        // Pid without permission to write: a no op must still succeed
        set_oom_score_adj(0, 1).unwrap();
    }

    #[test]
    fn invalid_signal_value() {
        assert!(matches!(kill_pid(1, 12345), Err(Error::Signal(12345))));
        assert!(matches!(kill_pid(1, -1), Err(Error::Signal(-1))));
    }

    #[test]
    fn wait_pid_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        assert_eq!(wait_pid(child.id()).unwrap(), ExitStatus::Exit(7));
    }

    #[test]
    fn console_handoff() {
        let (parent, child) = socket_pair().unwrap().into_parts();
        let mut parent = MessageStream::new(parent);

        let peer = thread::spawn(move || {
            let mut stream = MessageStream::new(child);
            let req = stream.recv::<SyncMessage>().unwrap().unwrap();
            assert_eq!(req.kind, SyncKind::ConsoleReq);

            let mut master = memfd::MemfdOptions::default()
                .create("pty")
                .unwrap()
                .into_file();
            master.write_all(b"master").unwrap();
            stream.send_fd(&master).unwrap();

            let ack = stream.recv::<SyncMessage>().unwrap().unwrap();
            assert_eq!(ack.kind, SyncKind::ConsoleAck);
        });

        let (tx, rx) = mpsc::sync_channel(1);
        handle_console(&mut parent, Some(&tx)).unwrap();
        let master = rx.recv().unwrap();
        peer.join().unwrap();

        let metadata = std::fs::File::from(master).metadata().unwrap();
        assert_eq!(metadata.len(), 6);
    }

    #[test]
    fn console_without_receiver() {
        let (parent, _child) = socket_pair().unwrap().into_parts();
        let mut parent = MessageStream::new(parent);
        assert!(matches!(
            handle_console(&mut parent, None),
            Err(Error::ConsoleReceiver)
        ));
    }
}
