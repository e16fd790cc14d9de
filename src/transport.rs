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
//! The GELF transport layer.
//!
//! This module defines the [`Transport`] trait that the delivery queue's consumer drives, along
//! with its two implementations: [`UdpTransport`], which chunks payloads into datagrams, and
//! [`StreamTransport`], which frames payloads onto a reconnecting TCP or TLS stream.
//!
//! # Examples
//!
//! To send GELF messages over UDP to a collector listening on port 12201 on localhost:
//!
//! ```rust,no_run
//! use gelf_tracing::{chunk::Chunker, transport::{Transport, UdpTransport}};
//! let mut transpo = UdpTransport::new("localhost", 12201, Chunker::default());
//! transpo.send(br#"{"version":"1.1","host":"h","short_message":"hi","level":6}"#).unwrap();
//! ```
//!
//! Over TCP:
//!
//! ```rust
//! use gelf_tracing::{connection::{Backoff, ConnectionState, TcpConnector},
//!                    transport::TcpTransport};
//! let transpo = TcpTransport::new(TcpConnector::new("graylog.domain.io", 12201),
//!                                 Backoff::default());
//! // No I/O is performed until the first send
//! assert_eq!(transpo.state(), ConnectionState::Disconnected);
//! ```

use crate::{
    chunk::{Chunker, Split},
    connection::{Backoff, Connection, ConnectionState, Connector, TcpConnector},
    error::{Error, Result},
    tls::TlsConnector,
};

use bytes::BytesMut;
use tracing::{debug, warn};

use std::{
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Instant,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      transport mechanisms                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Operations all transport layers must support.
///
/// A transport is owned by exactly one thread (the delivery queue's consumer), hence `&mut self`
/// throughout & no internal locking.
pub trait Transport: Send {
    /// Send one encoded (& possibly compressed) GELF payload.
    ///
    /// Errors for which [`Error::is_retryable`] is true mean the payload was not written & may
    /// be offered again later.
    fn send(&mut self, buf: &[u8]) -> Result<()>;
    /// Perform any set-up eagerly, so that misconfiguration is reported at startup rather
    /// than on the first message.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }
    /// If the transport is waiting out a reconnection delay, when that delay expires
    fn next_attempt(&self) -> Option<Instant> {
        None
    }
    /// Release the socket/connection; subsequent sends fail.
    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        (**self).send(buf)
    }
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }
    fn next_attempt(&self) -> Option<Instant> {
        (**self).next_attempt()
    }
    fn close(&mut self) {
        (**self).close()
    }
}

/// Sending GELF messages via UDP datagrams.
///
/// The destination is resolved (& a socket of the matching address family bound) on
/// [`open`](Transport::open) or the first send. If resolution fails it will be retried on the
/// next send; once it succeeds, the socket is kept for the transport's lifetime. Send failures
/// are reported but change nothing: datagram sockets don't disconnect.
pub struct UdpTransport {
    host: String,
    port: u16,
    chunker: Chunker,
    dest: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    scratch: BytesMut,
    closed: bool,
}

impl UdpTransport {
    /// Construct a [`Transport`] implementation via UDP to `host`:`port`; no I/O is performed.
    pub fn new<S: Into<String>>(host: S, port: u16, chunker: Chunker) -> UdpTransport {
        UdpTransport {
            host: host.into(),
            port,
            chunker,
            dest: None,
            socket: None,
            scratch: BytesMut::with_capacity(chunker.chunk_size() + crate::chunk::CHUNK_HEADER_LEN),
            closed: false,
        }
    }
    /// Construct a [`Transport`] implementation via UDP at localhost:12201
    pub fn local() -> UdpTransport {
        UdpTransport::new("localhost", 12201, Chunker::default())
    }
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }
    fn resolve(&mut self) -> Result<SocketAddr> {
        if let Some(dest) = self.dest {
            return Ok(dest);
        }
        let dest = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::transport)?
            .next()
            .ok_or_else(|| {
                Error::transport(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} resolved to no addresses", self.host),
                ))
            })?;
        let local = if dest.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        self.socket = Some(UdpSocket::bind(local).map_err(Error::transport)?);
        self.dest = Some(dest);
        debug!("Sending GELF datagrams to {} ({})", self.host, dest);
        Ok(dest)
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed {
                back: backtrace::Backtrace::new(),
            });
        }
        let dest = self.resolve()?;
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return Err(Error::config("no UDP socket")),
        };
        match self.chunker.split(buf)? {
            Split::Single(payload) => {
                socket.send_to(payload, dest).map_err(Error::transport)?;
            }
            Split::Chunked(chunks) => {
                for chunk in chunks {
                    self.scratch.clear();
                    chunk.encode(&mut self.scratch);
                    socket
                        .send_to(&self.scratch, dest)
                        .map_err(Error::transport)?;
                }
            }
        }
        Ok(())
    }
    fn open(&mut self) -> Result<()> {
        self.resolve().map(|_| ())
    }
    fn close(&mut self) {
        self.socket = None;
        self.closed = true;
    }
}

/// Sending GELF messages over a stream: each payload followed by a null byte.
pub struct StreamTransport<C: Connector> {
    conn: Connection<C>,
}

/// GELF over plain TCP
pub type TcpTransport = StreamTransport<TcpConnector>;
/// GELF over TLS
pub type TlsTransport = StreamTransport<TlsConnector>;

impl<C: Connector> StreamTransport<C> {
    pub fn new(connector: C, backoff: Backoff) -> StreamTransport<C> {
        StreamTransport {
            conn: Connection::new(connector, backoff),
        }
    }
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }
}

impl<C: Connector> Transport for StreamTransport<C> {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.conn.send(buf)
    }
    fn open(&mut self) -> Result<()> {
        self.conn.connect()
    }
    fn next_attempt(&self) -> Option<Instant> {
        self.conn.next_attempt()
    }
    fn close(&mut self) {
        if let Some(err) = self.conn.last_error() {
            if self.conn.state() == ConnectionState::Failed {
                warn!("Closing a failed connection (last error: {})", err);
            }
        }
        self.conn.close()
    }
}
