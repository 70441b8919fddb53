//! Single byte rendezvous between the jailed process and its id map helper.
//!
//! The primary sends exactly one [`Request`] and, unless it aborted, the
//! helper answers with exactly one [`Reply`].

use std::io;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use rustix::event::{self, PollFd, PollFlags};
use rustix::io::Errno;
use rustix::pipe::{self, PipeFlags};

use crate::helper::HelperFailure;

/// Token for "user namespace created, write my id maps".
const UNSHARED: u8 = b'#';

/// Token for "user namespace creation failed, exit without mapping".
const ABORT: u8 = b'!';

/// Token for "id maps written".
const MAPPED: u8 = b'#';

/// Primary to helper message.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Request {
    Unshared,
    Abort,
}

impl From<Request> for u8 {
    fn from(request: Request) -> Self {
        match request {
            Request::Unshared => UNSHARED,
            Request::Abort => ABORT,
        }
    }
}

impl TryFrom<u8> for Request {
    type Error = io::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            UNSHARED => Ok(Self::Unshared),
            ABORT => Ok(Self::Abort),
            byte => Err(unexpected(byte)),
        }
    }
}

/// Helper to primary message.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reply {
    Mapped,
    Failed(HelperFailure),
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Mapped => MAPPED,
            Reply::Failed(failure) => failure.into(),
        }
    }
}

impl TryFrom<u8> for Reply {
    type Error = io::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            MAPPED => Ok(Self::Mapped),
            byte => HelperFailure::try_from(byte).map(Self::Failed).map_err(|_| unexpected(byte)),
        }
    }
}

/// One side of a bidirectional byte channel.
pub trait Endpoint {
    /// Send a single byte.
    fn send(&mut self, byte: u8) -> io::Result<()>;

    /// Block until a single byte is received.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] once `timeout` has elapsed and
    /// with [`io::ErrorKind::UnexpectedEof`] if the peer is gone.
    fn recv(&mut self, timeout: Option<Duration>) -> io::Result<u8>;

    fn send_request(&mut self, request: Request) -> io::Result<()> {
        self.send(request.into())
    }

    fn recv_request(&mut self) -> io::Result<Request> {
        self.recv(None)?.try_into()
    }

    fn send_reply(&mut self, reply: Reply) -> io::Result<()> {
        self.send(reply.into())
    }

    fn recv_reply(&mut self, timeout: Option<Duration>) -> io::Result<Reply> {
        self.recv(timeout)?.try_into()
    }
}

/// Endpoint backed by two unidirectional pipes.
pub struct PipeEndpoint {
    read: OwnedFd,
    write: OwnedFd,
}

/// Create connected primary and helper endpoints.
///
/// All descriptors are close-on-exec, so the setuid tools never inherit them.
pub fn pipes() -> io::Result<(PipeEndpoint, PipeEndpoint)> {
    let (helper_read, primary_write) = pipe::pipe_with(PipeFlags::CLOEXEC)?;
    let (primary_read, helper_write) = pipe::pipe_with(PipeFlags::CLOEXEC)?;

    let primary = PipeEndpoint { read: primary_read, write: primary_write };
    let helper = PipeEndpoint { read: helper_read, write: helper_write };

    Ok((primary, helper))
}

impl PipeEndpoint {
    /// Wait until the read end is readable or hung up.
    ///
    /// A deadline too far in the future to represent is no deadline at all.
    fn poll_readable(&self, timeout: Duration) -> io::Result<()> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(());
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
            let mut fds = [PollFd::new(&self.read, PollFlags::IN)];
            match event::poll(&mut fds, millis) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")),
                Ok(_) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Endpoint for PipeEndpoint {
    fn send(&mut self, byte: u8) -> io::Result<()> {
        loop {
            match rustix::io::write(&self.write, &[byte]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(io::ErrorKind::WriteZero.into()),
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn recv(&mut self, timeout: Option<Duration>) -> io::Result<u8> {
        if let Some(timeout) = timeout {
            self.poll_readable(timeout)?;
        }

        let mut byte = [0; 1];
        loop {
            match rustix::io::read(&self.read, &mut byte) {
                Ok(0) => return Err(peer_gone()),
                Ok(_) => return Ok(byte[0]),
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn unexpected(byte: u8) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected handshake token {byte:#04x}"))
}

fn peer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "handshake peer closed its channel")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_tokens() {
        assert_eq!(Reply::try_from(b'#').unwrap(), Reply::Mapped);
        for failure in [
            HelperFailure::Resolution,
            HelperFailure::Range,
            HelperFailure::MapTool,
            HelperFailure::Protocol,
        ] {
            let byte = u8::from(Reply::Failed(failure));
            assert_ne!(byte, MAPPED);
            assert_eq!(Reply::try_from(byte).unwrap(), Reply::Failed(failure));
        }
        assert_eq!(Reply::try_from(0).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn request_tokens() {
        assert_eq!(Request::try_from(b'#').unwrap(), Request::Unshared);
        assert_eq!(Request::try_from(b'!').unwrap(), Request::Abort);
        assert!(Request::try_from(b'x').is_err());
    }

    #[test]
    fn pipe_rendezvous() {
        let (mut primary, mut helper) = pipes().unwrap();

        primary.send_request(Request::Unshared).unwrap();
        assert_eq!(helper.recv_request().unwrap(), Request::Unshared);

        helper.send_reply(Reply::Failed(HelperFailure::Range)).unwrap();
        let reply = primary.recv_reply(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(reply, Reply::Failed(HelperFailure::Range));
    }

    #[test]
    fn pipe_timeout() {
        let (mut primary, _helper) = pipes().unwrap();
        let err = primary.recv(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn pipe_unrepresentable_timeout() {
        let (mut primary, mut helper) = pipes().unwrap();
        helper.send_reply(Reply::Mapped).unwrap();

        let reply = primary.recv_reply(Some(Duration::from_secs(u64::MAX))).unwrap();
        assert_eq!(reply, Reply::Mapped);

        drop(helper);
        let err = primary.recv(Some(Duration::MAX)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn pipe_peer_closed() {
        let (mut primary, helper) = pipes().unwrap();
        drop(helper);
        let err = primary.recv(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
