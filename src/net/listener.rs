//! Readiness multiplexer for the network thread.
//!
//! Wraps `mio::Poll` with an always-registered [`mio::Waker`]. Any thread
//! holding a [`Notifier`] can cut a blocked [`Listener::wait`] short, which
//! is how commands queued by plugins reach the wire without waiting for the
//! next timeout.
//!
//! ```text
//!   plugin thread ──enqueue──▶ CommandQueue ──notify──▶ Waker
//!                                                          │
//!   network thread ◀───────── Listener::wait returns ◀─────┘
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::constants::EVENT_CAPACITY;

/// Token reserved for the wake-up handle.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Readiness of one registered source after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Token the source was registered with.
    pub token: Token,
    /// Bytes can be read (or EOF observed).
    pub readable: bool,
    /// The socket accepts writes, or a pending connect finished.
    pub writable: bool,
    /// The socket reported an error or the peer hung up.
    pub error: bool,
}

/// Outcome of one [`Listener::wait`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Wait {
    /// Sources that became ready, in the order the OS reported them.
    pub ready: Vec<Readiness>,
    /// Whether the wake-up handle fired.
    pub woken: bool,
}

impl Wait {
    /// True when neither a source nor the waker fired (timeout).
    pub fn is_timeout(&self) -> bool {
        self.ready.is_empty() && !self.woken
    }
}

/// Cloneable wake-up handle for a [`Listener`].
#[derive(Clone, Default)]
pub struct Notifier {
    waker: Option<Arc<Waker>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("attached", &self.waker.is_some())
            .finish()
    }
}

impl Notifier {
    /// A notifier attached to nothing. `notify` is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Force the listener's current or next wait to return.
    pub fn notify(&self) {
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake listener: {}", e);
            }
        }
    }
}

/// Set of watched transports plus the wake-up channel.
pub struct Listener {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("capacity", &self.events.capacity())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Create the poll instance and its waker.
    ///
    /// Failure here is the one unrecoverable condition of the daemon.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker,
        })
    }

    /// A handle other threads use to wake this listener.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            waker: Some(Arc::clone(&self.waker)),
        }
    }

    /// Start watching `source` under `token`.
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        debug_assert_ne!(token, WAKE_TOKEN, "token reserved for the waker");
        self.poll.registry().register(source, token, interest)
    }

    /// Change the interest set of an already registered source.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Stop watching `source`.
    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Block up to `timeout` and report which sources are ready.
    ///
    /// Returns early when the waker fires. A signal interrupting the wait is
    /// reported as an empty result, not an error.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Wait::default()),
            Err(e) => return Err(e),
        }

        let mut wait = Wait::default();
        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                wait.woken = true;
                continue;
            }
            wait.ready.push(Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            });
        }
        Ok(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_when_idle() {
        let mut listener = Listener::new().unwrap();
        let wait = listener.wait(Duration::from_millis(20)).unwrap();
        assert!(wait.is_timeout());
    }

    #[test]
    fn test_notify_from_other_thread_returns_early() {
        let mut listener = Listener::new().unwrap();
        let notifier = listener.notifier();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            notifier.notify();
        });

        let started = Instant::now();
        let wait = listener.wait(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();

        assert!(wait.woken);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let mut listener = Listener::new().unwrap();
        listener.notifier().notify();

        let started = Instant::now();
        let wait = listener.wait(Duration::from_secs(10)).unwrap();
        assert!(wait.woken);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_disabled_notifier_is_noop() {
        Notifier::disabled().notify();
    }

    #[test]
    fn test_readable_socket_is_reported() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut listener = Listener::new().unwrap();
        let mut client = mio::net::TcpStream::connect(addr).unwrap();
        listener
            .register(&mut client, Token(3), Interest::READABLE)
            .unwrap();

        let (mut peer, _) = server.accept().unwrap();
        peer.write_all(b"PING :x\r\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while Instant::now() < deadline && !seen {
            let wait = listener.wait(Duration::from_millis(100)).unwrap();
            seen = wait.ready.iter().any(|r| r.token == Token(3) && r.readable);
        }
        assert!(seen);
    }

    #[test]
    fn test_peer_close_is_reported_as_error() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut listener = Listener::new().unwrap();
        let mut client = mio::net::TcpStream::connect(addr).unwrap();
        listener
            .register(&mut client, Token(1), Interest::READABLE)
            .unwrap();

        let (peer, _) = server.accept().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut errored = false;
        while Instant::now() < deadline && !errored {
            let wait = listener.wait(Duration::from_millis(100)).unwrap();
            errored = wait.ready.iter().any(|r| r.token == Token(1) && r.error);
        }
        assert!(errored);
    }
}
