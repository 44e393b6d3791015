//! Per-connection client state.
//!
//! Each connection carries its framing buffers, the peer's identity
//! resolved from socket credentials, the derived access level and the
//! porto-namespace prefix used to rewrite container names.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use porto_common::{Cred, PortoError, PortoResult};

use super::wire::{decode_frame, encode_frame, Request, Response};

/// How much a client may do, in ascending power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    /// Porto is disabled for this container.
    None,
    /// Read-only calls.
    ReadOnly,
    /// Full container management.
    Normal,
    /// Root: may control any container.
    SuperUser,
    /// The daemon itself.
    Internal,
}

/// Cached identity of the peer, refreshed when the credentials change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Peer pid.
    pub pid: i32,
    /// Peer credentials.
    pub cred: Cred,
    /// Container the peer runs in.
    pub container: String,
    /// Accumulated porto-namespace prefix.
    pub namespace: String,
    /// Derived access level.
    pub access: AccessLevel,
}

/// One connected client.
pub struct ClientConn {
    /// Stable id used for waiters and weak containers.
    pub id: u64,
    stream: UnixStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    /// Cached identity; re-resolved when peer credentials change.
    pub identity: Option<Identity>,
    /// Whether this client has a deferred wait outstanding.
    pub waiting: bool,
}

impl ClientConn {
    /// Wrap an accepted connection.
    pub fn new(id: u64, stream: UnixStream) -> PortoResult<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            id,
            stream,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            identity: None,
            waiting: false,
        })
    }

    /// Raw fd for epoll registration.
    #[must_use]
    pub fn fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }

    /// Peer credentials from the socket.
    pub fn peer(&self) -> PortoResult<(i32, Cred)> {
        let creds = getsockopt(&self.stream, PeerCredentials).map_err(PortoError::from)?;
        Ok((creds.pid(), Cred::new(creds.uid(), creds.gid())))
    }

    /// Read everything available; returns false on EOF.
    ///
    /// Decoded requests accumulate in `out`.
    pub fn read_requests(&mut self, max_len: usize, out: &mut Vec<Request>) -> PortoResult<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut offset = 0;
        while let Some((request, used)) = decode_frame(&self.read_buf[offset..], max_len)? {
            out.push(request);
            offset += used;
        }
        self.read_buf.drain(..offset);
        Ok(true)
    }

    /// Queue a response for writing.
    pub fn queue_response(&mut self, response: &Response) -> PortoResult<()> {
        let frame = encode_frame(response)?;
        self.write_buf.extend_from_slice(&frame);
        self.flush()
    }

    /// Write as much of the pending output as the socket accepts.
    pub fn flush(&mut self) -> PortoResult<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(PortoError::unknown("client socket closed mid-write"));
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether output is still pending; drives EPOLLOUT interest.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ClientConn, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (ClientConn::new(1, a).unwrap(), b)
    }

    #[test]
    fn requests_arrive_across_partial_writes() {
        let (mut client, mut remote) = pair();
        let frame = encode_frame(&Request::Version).unwrap();
        let (head, tail) = frame.split_at(2);

        remote.write_all(head).unwrap();
        let mut requests = Vec::new();
        assert!(client.read_requests(1 << 20, &mut requests).unwrap());
        assert!(requests.is_empty());

        remote.write_all(tail).unwrap();
        assert!(client.read_requests(1 << 20, &mut requests).unwrap());
        assert_eq!(requests, vec![Request::Version]);
    }

    #[test]
    fn eof_is_reported() {
        let (mut client, remote) = pair();
        drop(remote);
        let mut requests = Vec::new();
        assert!(!client.read_requests(1 << 20, &mut requests).unwrap());
    }

    #[test]
    fn responses_reach_the_peer() {
        let (mut client, mut remote) = pair();
        client.queue_response(&Response::empty()).unwrap();
        assert!(!client.wants_write());

        let mut buf = vec![0u8; 256];
        let n = remote.read(&mut buf).unwrap();
        let (response, _): (Response, usize) = decode_frame(&buf[..n], 1 << 20).unwrap().unwrap();
        assert_eq!(response.error, 0);
    }

    #[test]
    fn peer_credentials_resolve() {
        let (client, _remote) = pair();
        let (pid, cred) = client.peer().unwrap();
        assert_eq!(pid, std::process::id() as i32);
        assert_eq!(cred.uid, nix::unistd::getuid().as_raw());
    }

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::None < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::Normal);
        assert!(AccessLevel::Normal < AccessLevel::SuperUser);
        assert!(AccessLevel::SuperUser < AccessLevel::Internal);
    }
}
