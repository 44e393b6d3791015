//! The epoll loop.
//!
//! The supervisor is single-threaded and cooperative; `epoll_wait` is its
//! only suspension point. The set holds the RPC listener, every client
//! socket, every live OOM eventfd and one signalfd. Signals are consumed
//! from the signalfd instead of async handlers, so no re-entrancy rules
//! apply anywhere.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use porto_common::PortoResult;

/// What a ready fd belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The RPC listener socket.
    Listener,
    /// A connected client, keyed by fd.
    Client(RawFd),
    /// A container's OOM eventfd, keyed by container id.
    Oom(u32),
    /// The signalfd.
    Signal,
    /// The exit-status pipe from the master process.
    StatusPipe,
}

impl Source {
    fn encode(self) -> u64 {
        match self {
            Self::Signal => 0,
            Self::Listener => 1 << 32,
            Self::Client(fd) => (2 << 32) | fd as u32 as u64,
            Self::Oom(id) => (3 << 32) | u64::from(id),
            Self::StatusPipe => 4 << 32,
        }
    }

    fn decode(data: u64) -> Self {
        let value = data as u32;
        match data >> 32 {
            0 => Self::Signal,
            1 => Self::Listener,
            2 => Self::Client(value as RawFd),
            4 => Self::StatusPipe,
            _ => Self::Oom(value),
        }
    }
}

/// One readiness report.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    /// Which source became ready.
    pub source: Source,
    /// Readable or hung up.
    pub readable: bool,
    /// Writable.
    pub writable: bool,
}

/// Epoll set plus the signalfd.
pub struct EpollLoop {
    epoll: Epoll,
    signal_fd: SignalFd,
}

impl EpollLoop {
    /// Create the epoll set, block the handled signals and register a
    /// signalfd for them.
    pub fn new() -> PortoResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        let mut mask = SigSet::empty();
        for signal in [
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGUSR1,
        ] {
            mask.add(signal);
        }
        mask.thread_block()?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        epoll.add(
            &signal_fd,
            EpollEvent::new(EpollFlags::EPOLLIN, Source::Signal.encode()),
        )?;

        Ok(Self { epoll, signal_fd })
    }

    /// Register a source for read readiness.
    pub fn add(&self, fd: RawFd, source: Source) -> PortoResult<()> {
        self.epoll.add(
            unsafe { BorrowedFd::borrow_raw(fd) },
            EpollEvent::new(EpollFlags::EPOLLIN, source.encode()),
        )?;
        Ok(())
    }

    /// Re-arm a source, optionally adding write readiness for clients
    /// with pending output.
    pub fn modify(&self, fd: RawFd, source: Source, want_write: bool) -> PortoResult<()> {
        let mut flags = EpollFlags::EPOLLIN;
        if want_write {
            flags |= EpollFlags::EPOLLOUT;
        }
        let mut event = EpollEvent::new(flags, source.encode());
        self.epoll
            .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event)?;
        Ok(())
    }

    /// Remove a source.
    pub fn remove(&self, fd: RawFd) -> PortoResult<()> {
        self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) })?;
        Ok(())
    }

    /// Wait for readiness, at most `timeout`.
    pub fn wait(&self, timeout: Duration) -> PortoResult<Vec<Ready>> {
        let mut events = [EpollEvent::empty(); 64];
        let millis = timeout.as_millis().min(u128::from(u16::MAX - 1)) as u16;
        let count = match self.epoll.wait(&mut events, EpollTimeout::from(millis)) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(events[..count]
            .iter()
            .map(|event| {
                let flags = event.events();
                Ready {
                    source: Source::decode(event.data()),
                    readable: flags
                        .intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                }
            })
            .collect())
    }

    /// Drain every pending signal from the signalfd.
    pub fn drain_signals(&mut self) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(Some(info)) = self.signal_fd.read_signal() {
            if let Ok(signal) = Signal::try_from(info.ssi_signo as i32) {
                signals.push(signal);
            }
        }
        signals
    }

    /// Raw fd of the signalfd, for diagnostics.
    #[must_use]
    pub fn signal_fd(&self) -> RawFd {
        self.signal_fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_encoding_roundtrip() {
        for source in [
            Source::Signal,
            Source::Listener,
            Source::Client(17),
            Source::Oom(4242),
            Source::StatusPipe,
        ] {
            assert_eq!(Source::decode(source.encode()), source);
        }
    }

    #[test]
    fn wait_times_out_on_empty_set() {
        let epoll = EpollLoop::new().unwrap();
        let ready = epoll.wait(Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn pipe_readiness_is_reported() {
        let epoll = EpollLoop::new().unwrap();
        let (reader, writer) = nix::unistd::pipe().unwrap();
        epoll.add(reader.as_raw_fd(), Source::Client(7)).unwrap();
        nix::unistd::write(&writer, b"x").unwrap();
        let ready = epoll.wait(Duration::from_millis(100)).unwrap();
        assert!(ready
            .iter()
            .any(|r| r.source == Source::Client(7) && r.readable));
    }
}
