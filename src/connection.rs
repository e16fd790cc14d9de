// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of gelf-tracing.
//
// gelf-tracing is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// gelf-tracing is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with gelf-tracing.  If
// not, see <http://www.gnu.org/licenses/>.
//! Stream connections to the collector.
//!
//! GELF over TCP (and TLS) is a single persistent stream of messages, each terminated by a null
//! byte. Streams drop, and this module owns putting them back together: a [`Connection`] walks
//! the state machine
//!
//! ```text
//!                  connect ok                     write ok
//! Disconnected ──► Connecting ──────────► Connected ◄──────┐
//!                    ▲    │ connect err       │ write err   │
//!                    │    ▼                   ▼             │
//!                    └─ Failed ◄──────────────┘─────────────┘
//!                    (after the backoff delay)
//! ```
//!
//! and is driven exclusively by the delivery queue's consumer thread, so nothing here is
//! synchronized. How a stream is established is delegated to a [`Connector`]; this module
//! provides one for plain TCP, the [`tls`](crate::tls) module one for TLS.

use crate::error::{Error, Result};

use backtrace::Backtrace;
use tracing::{debug, info, warn};

use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

/// Default delay before the first reconnection attempt
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default ceiling on the reconnection delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Default timeout for establishing a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default timeout for a single write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a [`Connection`] is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No stream, & none attempted since creation (or since shutdown)
    Disconnected,
    /// Establishing a stream (TCP, then TLS if configured)
    Connecting,
    /// A stream is open & the last write (if any) succeeded
    Connected,
    /// The last connect or write failed; waiting out the backoff delay
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Exponential backoff: `initial`, doubling on each consecutive failure, capped at `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }
    /// Return the delay to apply after this failure & advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl std::default::Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           connectors                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Something that can establish a stream to the collector.
///
/// `connect` must return a stream that is ready for application data; for TLS that means the
/// handshake (including peer verification) is already complete, so that handshake failures
/// surface as connect failures.
pub trait Connector: Send + std::fmt::Display {
    type Stream: Write + Send;
    fn connect(&self) -> Result<Self::Stream>;
    /// Orderly close of a healthy stream; the default just drops it.
    fn shutdown(&self, _stream: &mut Self::Stream) {}
}

/// Plain TCP connections.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new<S: Into<String>>(host: S, port: u16) -> TcpConnector {
        TcpConnector {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
    pub fn host(&self) -> &str {
        &self.host
    }
    pub(crate) fn handshake_timeout(&self) -> Duration {
        self.connect_timeout
    }
    /// Resolve the destination & try each address in turn.
    pub(crate) fn open(&self) -> Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::transport)?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_write_timeout(Some(self.write_timeout))
                        .map_err(Error::transport)?;
                    stream.set_nodelay(true).map_err(Error::transport)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("Connecting to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(Error::transport(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.host),
            )
        })))
    }
}

impl std::fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;
    fn connect(&self) -> Result<TcpStream> {
        self.open()
    }
    fn shutdown(&self, stream: &mut TcpStream) {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        struct Connection                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One message on the wire: the payload & its null terminator.
fn write_frame<W: Write>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf)?;
    writer.write_all(&[0])?;
    writer.flush()
}

/// The reconnecting stream state machine.
pub struct Connection<C: Connector> {
    connector: C,
    state: ConnectionState,
    stream: Option<C::Stream>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_error: Option<String>,
    closed: bool,
    #[cfg(test)]
    history: Vec<ConnectionState>,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, backoff: Backoff) -> Connection<C> {
        Connection {
            connector,
            state: ConnectionState::Disconnected,
            stream: None,
            backoff,
            retry_at: None,
            last_error: None,
            closed: false,
            #[cfg(test)]
            history: vec![ConnectionState::Disconnected],
        }
    }
    pub fn state(&self) -> ConnectionState {
        self.state
    }
    /// A description of the most recent connect or write failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
    /// When `Failed`, the earliest time at which the next connection attempt will be made.
    pub fn next_attempt(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Failed => self.retry_at,
            _ => None,
        }
    }
    /// Establish a stream now, unless one is open or we're waiting out a backoff delay.
    pub fn connect(&mut self) -> Result<()> {
        self.connect_at(Instant::now())
    }
    /// Write one null-terminated frame, (re)connecting first if need be.
    ///
    /// A write failure tears down the stream & returns [`Error::ConnectionLost`]; while waiting
    /// to reconnect, or if the reconnection attempt fails, this returns
    /// [`Error::NotConnected`]. In both cases `buf` was not handed to the OS.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.send_at(buf, Instant::now())
    }
    /// Close the stream (politely, if it's healthy); all subsequent sends will fail with
    /// [`Error::Closed`].
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.connector.shutdown(&mut stream);
        }
        if !self.closed {
            info!("Connection to {} closed", self.connector);
        }
        self.closed = true;
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    pub(crate) fn connect_at(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::Closed {
                back: Backtrace::new(),
            });
        }
        if self.stream.is_some() {
            return Ok(());
        }
        if let (ConnectionState::Failed, Some(retry_at)) = (self.state, self.retry_at) {
            if now < retry_at {
                return Err(Error::NotConnected {
                    retry_in: retry_at - now,
                    back: Backtrace::new(),
                });
            }
        }
        self.set_state(ConnectionState::Connecting);
        match self.connector.connect() {
            Ok(stream) => {
                self.stream = Some(stream);
                self.retry_at = None;
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.connector);
                Ok(())
            }
            Err(err) => {
                let delay = self.fail(err.to_string(), now);
                warn!(
                    "Couldn't connect to {} ({}); retrying in {:?}",
                    self.connector, err, delay
                );
                Err(Error::NotConnected {
                    retry_in: delay,
                    back: Backtrace::new(),
                })
            }
        }
    }

    pub(crate) fn send_at(&mut self, buf: &[u8], now: Instant) -> Result<()> {
        self.connect_at(now)?;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(Error::NotConnected {
                    retry_in: Duration::ZERO,
                    back: Backtrace::new(),
                })
            }
        };
        match write_frame(stream, buf) {
            Ok(()) => {
                self.backoff.reset();
                Ok(())
            }
            Err(err) => {
                self.stream = None;
                let delay = self.fail(err.to_string(), now);
                warn!(
                    "Lost connection to {} ({}); reconnecting in {:?}",
                    self.connector, err, delay
                );
                Err(Error::ConnectionLost {
                    source: err,
                    back: Backtrace::new(),
                })
            }
        }
    }

    fn fail(&mut self, reason: String, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        self.last_error = Some(reason);
        self.set_state(ConnectionState::Failed);
        delay
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state != self.state {
            debug!("{}: {} => {}", self.connector, self.state, state);
        }
        self.state = state;
        #[cfg(test)]
        self.history.push(state);
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.connector.shutdown(&mut stream);
        }
    }
}


#[cfg(test)]
mod test {

    use super::scripted::{Outcome, ScriptedConnector};
    use super::*;

    use std::io::Read;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn backoff() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), secs(1));
    }

    #[test]
    fn reconnects_with_backoff() {
        use ConnectionState::*;

        // Accept one frame, then refuse three times, then accept again.
        let (connector, wire) = ScriptedConnector::new(&[
            Outcome::Accept(1),
            Outcome::Refuse,
            Outcome::Refuse,
            Outcome::Refuse,
        ]);
        let mut conn = Connection::new(connector, Backoff::default());
        assert_eq!(conn.state(), Disconnected);

        let t0 = Instant::now();
        conn.send_at(b"one", t0).unwrap();
        assert_eq!(conn.state(), Connected);

        // The stream breaks on the second frame: 1s delay
        match conn.send_at(b"two", t0) {
            Err(Error::ConnectionLost { .. }) => (),
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(conn.state(), Failed);
        assert_eq!(conn.next_attempt(), Some(t0 + secs(1)));
        assert!(conn.last_error().is_some());

        // Inside the delay, no attempt is made at all
        match conn.send_at(b"two", t0 + Duration::from_millis(500)) {
            Err(Error::NotConnected { retry_in, .. }) => {
                assert_eq!(retry_in, Duration::from_millis(500))
            }
            other => panic!("expected NotConnected, got {:?}", other),
        }
        assert_eq!(conn.connector.attempts(), 1);

        // Each refusal doubles the delay
        let mut now = t0 + secs(1);
        for expected in [2, 4, 8] {
            let err = conn.send_at(b"two", now).unwrap_err();
            assert!(err.is_retryable());
            assert_eq!(conn.state(), Failed);
            assert_eq!(conn.next_attempt(), Some(now + secs(expected)));
            now += secs(expected);
        }

        // The script is exhausted, so this attempt succeeds
        conn.send_at(b"two", now).unwrap();
        assert_eq!(conn.state(), Connected);
        assert_eq!(conn.connector.attempts(), 5);
        assert_eq!(wire.frames(), vec![b"one".to_vec(), b"two".to_vec()]);

        // & the successful write reset the backoff
        assert_eq!(conn.backoff.next_delay(), secs(1));

        let mut seen = conn.history.clone();
        seen.dedup();
        assert_eq!(
            &seen[..4],
            &[Disconnected, Connecting, Connected, Failed][..]
        );
        assert_eq!(&seen[seen.len() - 3..], &[Failed, Connecting, Connected][..]);
    }

    #[test]
    fn backoff_caps() {
        let refusals = vec![Outcome::Refuse; 10];
        let (connector, _wire) = ScriptedConnector::new(&refusals);
        let mut conn = Connection::new(connector, Backoff::default());
        let mut now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..10 {
            conn.connect_at(now).unwrap_err();
            let delay = conn.next_attempt().unwrap() - now;
            delays.push(delay.as_secs());
            now += delay;
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn closed() {
        let (connector, _wire) = ScriptedConnector::new(&[]);
        let mut conn = Connection::new(connector, Backoff::default());
        conn.send(b"hi").unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        match conn.send(b"hi") {
            Err(Error::Closed { .. }) => (),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn tcp_framing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut conn = Connection::new(
            TcpConnector::new("127.0.0.1", port),
            Backoff::default(),
        );
        conn.send(b"{\"a\":1}").unwrap();
        conn.send(b"{\"b\":2}").unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        conn.close();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"{\"a\":1}\0{\"b\":2}\0");
    }
}
