use std::{io, os::unix::net::UnixStream};

/// Create a connected pair of unix sockets for the parent/child sync
/// channel.
pub fn socket_pair() -> io::Result<SocketPair> {
    let (parent, child) = UnixStream::pair()?;

    Ok(SocketPair { parent, child })
}

/// A connected socket pair. The child end is handed to the spawned
/// helper and must be closed locally right after the spawn, otherwise
/// the parent never observes EOF on its end.
#[derive(Debug)]
pub struct SocketPair {
    parent: UnixStream,
    child: UnixStream,
}

impl SocketPair {
    /// Split into the parent and child ends.
    pub fn into_parts(self) -> (UnixStream, UnixStream) {
        (self.parent, self.child)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn connected() {
        let (mut parent, mut child) = socket_pair().unwrap().into_parts();
        parent.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        child.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        child.write_all(b"pong").unwrap();
        parent.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }
}
