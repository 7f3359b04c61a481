use thiserror::Error;

use crate::runtime::exit_status::ExitStatus;

/// Errors surfaced by the process drivers.
#[derive(Error, Debug)]
pub enum Error {
    /// The bootstrap helper exited non zero or was signalled.
    #[error("bootstrap helper exited with {0}")]
    Helper(ExitStatus),
    /// The child sent a message the dispatcher does not handle, or
    /// malformed JSON.
    #[error("invalid JSON payload from child: {0}")]
    Protocol(String),
    /// The sync channel closed before the child reported ready.
    #[error("container init failed")]
    Init(#[source] Box<Error>),
    /// The child never requested prestart hooks although a new mount
    /// namespace was configured.
    #[error("could not synchronise after prestart hooks with container process")]
    HookSync,
    /// A prestart hook failed. Hooks following it were not run.
    #[error("running prestart hook {index}")]
    Hook {
        /// Position of the failed hook in the prestart list.
        index: usize,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// The signal value does not name an OS signal.
    #[error("unsupported signal {0}")]
    Signal(i32),
    /// The child announced a pty master but no console receiver is
    /// registered on the process record.
    #[error("no console receiver registered for pty master")]
    ConsoleReceiver,
    /// No strategy is registered for the network type.
    #[error("unknown network strategy {0}")]
    NetworkStrategy(String),
    /// Anything else, carrying the phase it happened in.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}
