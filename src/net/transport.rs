//! Non-blocking transport sockets.
//!
//! A [`Transport`] is anything the multiplexer can register (`mio::event::Source`)
//! that also supports raw send/receive. The daemon only ever talks to the
//! trait, so a TLS transport can slot in later without touching sessions.

use std::io::{self, Read, Write};
use std::net::{Shutdown, ToSocketAddrs};

use mio::event::Source;
use mio::net::TcpStream;

/// A single duplex, non-blocking network connection.
pub trait Transport: Source + Send + std::fmt::Debug {
    /// Write as many bytes as the socket accepts without blocking.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read available bytes. `Ok(0)` means the peer closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Check whether an in-progress connect has completed.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` while still pending,
    /// and `Err` if the connection attempt failed.
    fn finish_connect(&mut self) -> io::Result<bool>;

    /// Shut the connection down. Safe to call more than once.
    fn close(&mut self);
}

/// Plain TCP transport backed by `mio::net::TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Start a non-blocking connect to `host:port`.
    ///
    /// Name resolution is synchronous; the TCP handshake is not. Poll for
    /// writability and call [`Transport::finish_connect`] to learn the outcome.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))?;

        let stream = TcpStream::connect(peer)?;
        log::debug!("Connecting to {} ({})", host, peer);
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Source for TcpTransport {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
