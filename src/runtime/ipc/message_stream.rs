use nix::{
    cmsg_space,
    sys::socket::{
        self, recvmsg, sendmsg, shutdown, ControlMessageOwned, Shutdown, SockaddrIn6,
    },
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::{self, ErrorKind, IoSlice, IoSliceMut, Write},
    os::unix::{
        net::UnixStream,
        prelude::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    },
};

use super::os_err;

/// Newline delimited JSON message stream with fd transfer via
/// SCM_RIGHTS.
///
/// Values are decoded with a streaming deserializer that consumes
/// exactly one JSON value per receive, so ancillary data transfers can
/// interleave with the message traffic on the same socket.
#[derive(Debug)]
pub struct MessageStream(UnixStream);

impl MessageStream {
    /// Wrap a connected unix stream.
    pub fn new(inner: UnixStream) -> Self {
        Self(inner)
    }

    /// Send a JSON encoded message followed by a newline.
    pub fn send<M: Serialize>(&mut self, v: &M) -> io::Result<()> {
        serde_json::to_writer(&mut self.0, v).map_err(io::Error::from)?;
        self.0.write_all(b"\n")
    }

    /// Receive a single JSON encoded message. Returns `None` on a clean
    /// EOF; a truncated or malformed value is an error.
    pub fn recv<M: DeserializeOwned>(&mut self) -> io::Result<Option<M>> {
        let mut values = serde_json::Deserializer::from_reader(&mut self.0).into_iter::<M>();
        match values.next() {
            Some(Ok(v)) => Ok(Some(v)),
            Some(Err(e)) => Err(io::Error::new(ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }

    /// Send a file descriptor over the socket as ancillary data.
    pub fn send_fd<T: AsRawFd>(&self, fd: &T) -> io::Result<()> {
        let buf = &[0u8];
        let iov = &[IoSlice::new(buf)];
        let fds = [fd.as_raw_fd()];
        let control_message = [socket::ControlMessage::ScmRights(&fds)];
        const FLAGS: socket::MsgFlags = socket::MsgFlags::empty();

        sendmsg::<SockaddrIn6>(self.0.as_raw_fd(), iov, &control_message, FLAGS, None)
            .map_err(os_err)?;
        Ok(())
    }

    /// Receive a single file descriptor sent as ancillary data.
    pub fn recv_fd(&self) -> io::Result<OwnedFd> {
        let mut buf = [0u8];
        let iov = &mut [IoSliceMut::new(&mut buf)];
        let mut control_message_buffer = cmsg_space!([RawFd; 1]);
        const FLAGS: socket::MsgFlags = socket::MsgFlags::empty();

        let message = recvmsg::<SockaddrIn6>(
            self.0.as_raw_fd(),
            iov,
            Some(&mut control_message_buffer),
            FLAGS,
        )
        .map_err(os_err)?;

        match message.cmsgs().next() {
            Some(ControlMessageOwned::ScmRights(fds)) if fds.len() == 1 => {
                Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
            }
            Some(message) => Err(io::Error::new(
                ErrorKind::Other,
                format!("failed to receive fd: unexpected control message: {message:?}"),
            )),
            None => Err(io::Error::new(
                ErrorKind::Other,
                "failed to receive fd: missing control message",
            )),
        }
    }

    /// Half close the write direction. The peer observes EOF on its
    /// next read while this end can still receive.
    pub fn shutdown_write(&mut self) -> io::Result<()> {
        shutdown(self.0.as_raw_fd(), Shutdown::Write).map_err(os_err)
    }
}

/// Raw writes carry the bootstrap byte stream and single sync bytes that
/// are not part of the JSON traffic.
impl Write for MessageStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl AsRawFd for MessageStream {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
