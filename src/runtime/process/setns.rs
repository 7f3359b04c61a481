//! Attaching an additional process to a running container.

use anyhow::{anyhow, Context};
use log::debug;
use nix::sys::signal::Signal;
use std::io::{self, Read};

use super::{
    discard_helper, handle_console, kill_pid, set_oom_score_adj, set_rlimits, wait_pid,
    ContainerProcess, HelperCommand, PidRecord, Process,
};
use crate::runtime::{
    cgroups,
    config::InitConfig,
    error::Error,
    exit_status::ExitStatus,
    ipc::{socket_pair, MessageStream, SocketPair},
    sync::{SyncKind, SyncMessage},
    Pid,
};

/// Driver attaching an additional process to a running container.
///
/// The bootstrap helper enters the target container's namespaces and
/// leaves a grandchild behind. The parent places that grandchild into
/// the container's cgroups and installs its limits before it proceeds,
/// since both require privileges lost inside the user namespace.
pub struct SetnsProcess {
    command: HelperCommand,
    pair: Option<SocketPair>,
    bootstrap: Box<dyn Read + Send>,
    config: InitConfig,
    process: Process,
    fds: Vec<String>,
    pid: Pid,
}

impl SetnsProcess {
    /// A driver for joining the container described by `config`.
    ///
    /// `bootstrap` is the opaque byte stream for the helper named by
    /// `command`; its format is the helper's contract. The cgroup paths
    /// of `config` name the cgroups the joining process is placed in.
    pub fn new(
        command: HelperCommand,
        bootstrap: Box<dyn Read + Send>,
        config: InitConfig,
        process: Process,
    ) -> io::Result<SetnsProcess> {
        let pair = socket_pair()?;
        Ok(SetnsProcess {
            command,
            pair: Some(pair),
            bootstrap,
            config,
            process,
            fds: Vec::new(),
            pid: 0,
        })
    }

    /// The caller facing process record.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Mutable access to the process record.
    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }
}

impl ContainerProcess for SetnsProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn start(&mut self) -> Result<(), Error> {
        let pair = self
            .pair
            .take()
            .ok_or_else(|| anyhow!("process already started"))?;
        let (parent, child) = pair.into_parts();
        let mut helper = self
            .command
            .spawn(&child, None)
            .map_err(|e| anyhow::Error::new(e).context("starting setns helper"))?;
        drop(child);
        self.pid = helper.id();
        let mut stream = MessageStream::new(parent);

        debug!("Streaming bootstrap data to setns helper {}", helper.id());
        if let Err(e) = io::copy(&mut self.bootstrap, &mut stream) {
            discard_helper(&mut helper);
            return Err(anyhow::Error::new(e)
                .context("copying bootstrap data to pipe")
                .into());
        }

        // The helper forks the joining process and exits; the pid
        // record is buffered in the socket until read below.
        let status = helper.wait().context("waiting on setns helper to finish")?;
        if !status.success() {
            return Err(Error::Helper(status.into()));
        }
        let record = match stream.recv::<PidRecord>() {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Error::Protocol(
                    "missing pid record from setns helper".into(),
                ))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("reading pid from init pipe")
                    .into())
            }
        };
        debug!("Tracking joining process {}", record.pid);
        self.pid = record.pid;
        self.process.pid = Some(record.pid);

        // Membership and limits while the parent still has privilege
        cgroups::enter_pid(&self.config.config.cgroup_paths, record.pid)
            .with_context(|| format!("adding pid {} to cgroups", record.pid))?;
        set_oom_score_adj(self.config.config.oom_score_adj, record.pid)
            .context("setting oom score")?;
        set_rlimits(&self.config.rlimits, record.pid).context("setting rlimits for process")?;

        stream.send(&self.config).context("writing config to pipe")?;

        // Only console traffic is valid for a joining process
        let result = loop {
            match stream.recv::<SyncMessage>() {
                Ok(Some(message)) => match message.kind {
                    SyncKind::Console => {
                        if let Err(e) = handle_console(&mut stream, self.process.console.as_ref()) {
                            break Err(e);
                        }
                    }
                    kind => {
                        break Err(Error::Protocol(format!(
                            "unexpected {kind} from joining process"
                        )))
                    }
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::Protocol(e.to_string())),
            }
        };

        stream
            .shutdown_write()
            .context("calling shutdown on init pipe")?;
        // After the shutdown the child observes EOF, exits and can be
        // reaped.
        if let Err(e) = result {
            let _ = wait_pid(self.pid);
            return Err(e);
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<ExitStatus, Error> {
        if self.pid == 0 {
            return Err(anyhow!("process not started").into());
        }
        wait_pid(self.pid).map_err(Error::from)
    }

    fn terminate(&mut self) -> Result<(), Error> {
        if self.pid == 0 {
            return Ok(());
        }
        let killed = kill_pid(self.pid, Signal::SIGKILL as i32);
        let waited = self.wait();
        killed.and(waited.map(drop))
    }

    fn signal(&self, signal: i32) -> Result<(), Error> {
        if self.pid == 0 {
            return Err(anyhow!("process not started").into());
        }
        kill_pid(self.pid, signal)
    }

    fn start_time(&self) -> Result<String, Error> {
        super::start_time(self.pid).map_err(Error::from)
    }

    fn external_descriptors(&self) -> &[String] {
        &self.fds
    }

    fn set_external_descriptors(&mut self, fds: Vec<String>) {
        self.fds = fds;
    }
}
