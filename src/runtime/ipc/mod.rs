//! Socket based plumbing between the parent and the container process.
//!
//! The sync channel must be a socket and not a plain pipe: the pty
//! master is transferred out of band as ancillary data, which only
//! sockets support.

mod message_stream;
mod socket_pair;

pub use message_stream::MessageStream;
pub use socket_pair::{socket_pair, SocketPair};

/// Maps a nix::Error to a io::Error
#[inline]
pub(crate) fn os_err(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}
