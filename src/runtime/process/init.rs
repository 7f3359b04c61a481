//! Creating a container.

use anyhow::{anyhow, Context};
use log::{debug, warn};
use nix::sys::signal::Signal;
use std::{
    fs::File,
    io::{self, Read, Write},
    process::Child,
};

use super::{
    discard_helper, handle_console, kill_pid, pipe_fds, set_oom_score_adj, set_rlimits, wait_pid,
    ContainerProcess, HelperCommand, PidRecord, Process,
};
use crate::runtime::{
    cgroups::{self, CgroupManager},
    config::{InitConfig, NamespaceType},
    error::Error,
    exit_status::ExitStatus,
    hooks::HookState,
    ipc::{socket_pair, MessageStream, SocketPair},
    network::Registry,
    sync::{SyncKind, SyncMessage, CREATE_CGROUPNS},
    Pid,
};

/// Driver creating a container.
///
/// The start sequence is strictly ordered: spawn the helper, stream the
/// bootstrap data, learn the grandchild pid, snapshot its stdio fd
/// targets, apply cgroups, optionally release the helper into a new
/// cgroup namespace, reap the helper, create network interfaces, send
/// the configuration and then run the sync dispatcher until the child
/// is released to exec the workload.
pub struct InitProcess {
    command: HelperCommand,
    pair: Option<SocketPair>,
    bootstrap: Box<dyn Read + Send>,
    config: InitConfig,
    id: String,
    manager: Box<dyn CgroupManager>,
    networks: Registry,
    process: Process,
    fds: Vec<String>,
    share_pidns: bool,
    root_dir: Option<File>,
    pid: Pid,
}

impl InitProcess {
    /// A driver creating the container `id` described by `config`.
    pub fn new(
        command: HelperCommand,
        bootstrap: Box<dyn Read + Send>,
        config: InitConfig,
        id: impl Into<String>,
        manager: Box<dyn CgroupManager>,
        process: Process,
    ) -> io::Result<InitProcess> {
        let pair = socket_pair()?;
        Ok(InitProcess {
            command,
            pair: Some(pair),
            bootstrap,
            config,
            id: id.into(),
            manager,
            networks: Registry::default(),
            process,
            fds: Vec::new(),
            share_pidns: false,
            root_dir: None,
            pid: 0,
        })
    }

    /// Hold the container root directory open across the spawn so the
    /// helper inherits it. The parent drops its handle right after the
    /// spawn.
    pub fn root_dir(mut self, dir: File) -> InitProcess {
        self.root_dir = Some(dir);
        self
    }

    /// The container shares the host pid namespace. On exit of the init
    /// process the kernel then reparents instead of killing, so `wait`
    /// sweeps the container cgroup.
    pub fn share_pidns(mut self, share: bool) -> InitProcess {
        self.share_pidns = share;
        self
    }

    /// Replace the network strategy registry.
    pub fn networks(mut self, registry: Registry) -> InitProcess {
        self.networks = registry;
        self
    }

    /// The caller facing process record.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// Mutable access to the process record.
    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    /// Everything after a successful cgroup apply. A failure in here
    /// destroys the container cgroups on the way out.
    fn finish(&mut self, helper: &mut Child, stream: &mut MessageStream) -> Result<(), Error> {
        let namespaces = &self.config.config.namespaces;

        // Tell the helper to enter a new cgroup namespace now that the
        // parent has placed it in the right cgroup.
        if namespaces.contains(NamespaceType::Cgroup)
            && namespaces.path_of(NamespaceType::Cgroup).is_none()
        {
            debug!("Releasing helper into a new cgroup namespace");
            if let Err(e) = stream.write_all(&[CREATE_CGROUPNS]) {
                discard_helper(helper);
                return Err(anyhow::Error::new(e)
                    .context("sending synchronization value to init process")
                    .into());
            }
        }

        // The helper exits once its namespace work is done
        let status = helper
            .wait()
            .context("waiting for our first child to exit")?;
        if !status.success() {
            return Err(Error::Helper(status.into()));
        }

        self.create_network_interfaces()?;

        stream
            .send(&self.config)
            .context("sending config to init process")?;

        let mut sent_run = false;
        let mut sent_resume = false;
        let result = self.dispatch(stream, &mut sent_run, &mut sent_resume);

        if !sent_run {
            let cause = result.err().unwrap_or_else(|| {
                Error::Protocol("channel closed before the ready handshake".into())
            });
            return Err(Error::Init(Box::new(cause)));
        }
        if self.config.config.namespaces.contains(NamespaceType::Mount) && !sent_resume {
            return Err(Error::HookSync);
        }
        stream
            .shutdown_write()
            .context("shutting down init pipe")?;
        // After the shutdown the child observes EOF, exits and can be
        // reaped.
        if let Err(e) = result {
            let _ = self.reap();
            return Err(e);
        }
        Ok(())
    }

    /// Read sync messages until the child closes its end.
    fn dispatch(
        &mut self,
        stream: &mut MessageStream,
        sent_run: &mut bool,
        sent_resume: &mut bool,
    ) -> Result<(), Error> {
        loop {
            let message = match stream.recv::<SyncMessage>() {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::Protocol(e.to_string())),
            };
            match message.kind {
                SyncKind::Console => handle_console(stream, self.process.console.as_ref())?,
                SyncKind::Ready => {
                    debug!("Container process {} is ready", self.pid);
                    self.manager
                        .set(&self.config.config)
                        .context("setting cgroup config for ready process")?;
                    set_oom_score_adj(self.config.config.oom_score_adj, self.pid)
                        .context("setting oom score for ready process")?;
                    // Raising limits is impossible once the child is in
                    // its user namespace.
                    set_rlimits(&self.config.rlimits, self.pid)
                        .context("setting rlimits for ready process")?;
                    // With a new mount namespace the hooks run at the
                    // hooks barrier instead, once the mounts are
                    // visible.
                    if !self.config.config.namespaces.contains(NamespaceType::Mount) {
                        self.run_prestart_hooks()?;
                    }
                    stream
                        .send(&SyncMessage::from(SyncKind::Run))
                        .context("writing sync message run")?;
                    *sent_run = true;
                }
                SyncKind::Hooks => {
                    debug!("Container process {} requests prestart hooks", self.pid);
                    self.run_prestart_hooks()?;
                    stream
                        .send(&SyncMessage::from(SyncKind::Resume))
                        .context("writing sync message resume")?;
                    *sent_resume = true;
                }
                kind => {
                    break Err(Error::Protocol(format!(
                        "unexpected {kind} from container process"
                    )))
                }
            }
        }
    }

    /// Create the configured network interfaces, tied to the network
    /// namespace of the container process, and record the materialized
    /// interfaces in the payload sent to it.
    fn create_network_interfaces(&mut self) -> Result<(), Error> {
        let InitConfig {
            config,
            networks: materialized,
            ..
        } = &mut self.config;
        for network in &config.networks {
            debug!("Creating {} interface for process {}", network.typ, self.pid);
            let strategy = self.networks.strategy(&network.typ)?;
            let mut network = network.clone();
            strategy
                .create(&mut network, self.pid)
                .with_context(|| format!("creating {} interface", network.typ))?;
            materialized.push(network);
        }
        Ok(())
    }

    /// Run the prestart hooks in declared order; the first failure
    /// aborts the start.
    fn run_prestart_hooks(&self) -> Result<(), Error> {
        let hooks = match &self.config.config.hooks {
            Some(hooks) => hooks,
            None => return Ok(()),
        };
        let state = HookState {
            version: self.config.config.version.clone(),
            id: self.id.clone(),
            pid: self.pid,
            bundle_path: self
                .config
                .config
                .label("bundle")
                .unwrap_or_default()
                .to_string(),
        };
        for (index, hook) in hooks.prestart.iter().enumerate() {
            debug!("Running prestart hook {} of {}", index, self.id);
            hook.run(&state)
                .map_err(|source| Error::Hook { index, source })?;
        }
        Ok(())
    }

    /// Reap the init process. With a shared pid namespace the kernel
    /// does not kill the remaining container processes, so sweep the
    /// container cgroup.
    fn reap(&mut self) -> Result<ExitStatus, Error> {
        let status = wait_pid(self.pid)?;
        if self.share_pidns {
            if let Err(e) = cgroups::signal_all(&*self.manager, Signal::SIGKILL) {
                warn!("Failed to kill remaining container processes: {e:#}");
            }
        }
        Ok(status)
    }
}

impl ContainerProcess for InitProcess {
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
            .spawn(&child, self.root_dir.as_ref())
            .map_err(|e| anyhow::Error::new(e).context("starting init process command"))?;
        drop(child);
        // The helper inherited the root dir handle; the parent must not
        // pin it.
        self.root_dir = None;
        self.pid = helper.id();
        let mut stream = MessageStream::new(parent);

        debug!("Streaming bootstrap data to helper {}", helper.id());
        if let Err(e) = io::copy(&mut self.bootstrap, &mut stream) {
            discard_helper(&mut helper);
            return Err(anyhow::Error::new(e)
                .context("copying bootstrap data to pipe")
                .into());
        }

        let child_pid = match stream.recv::<PidRecord>() {
            Ok(Some(record)) => record.pid,
            Ok(None) => {
                discard_helper(&mut helper);
                return Err(Error::Protocol("missing pid record from helper".into()));
            }
            Err(e) => {
                discard_helper(&mut helper);
                return Err(anyhow::Error::new(e)
                    .context("getting the final child's pid from pipe")
                    .into());
            }
        };
        debug!("Tracking container init process {}", child_pid);
        self.pid = child_pid;
        self.process.pid = Some(child_pid);

        // Snapshot the stdio fd targets before the child gets any
        // chance to dup2 them away.
        match pipe_fds(child_pid) {
            Ok(fds) => self.fds = fds,
            Err(e) => {
                discard_helper(&mut helper);
                return Err(e
                    .context(format!("getting pipe fds for pid {child_pid}"))
                    .into());
            }
        }

        // Apply before the child may fork, so no descendant escapes the
        // cgroup.
        if let Err(e) = self.manager.apply(child_pid) {
            discard_helper(&mut helper);
            return Err(e
                .context("applying cgroup configuration for process")
                .into());
        }

        let result = self.finish(&mut helper, &mut stream);
        if result.is_err() {
            if let Err(e) = self.manager.destroy() {
                warn!("Failed to destroy cgroups: {e:#}");
            }
        }
        result
    }

    fn wait(&mut self) -> Result<ExitStatus, Error> {
        if self.pid == 0 {
            return Err(anyhow!("process not started").into());
        }
        self.reap()
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
