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
//! Client configuration.
//!
//! A [`Config`] is assembled with [`Config::builder`], validated once in
//! [`ConfigBuilder::build`], & thereafter only read: the client copies what it needs out of it
//! at construction time.
//!
//! ```rust
//! use gelf_tracing::{compress::Compression, config::{Config, TransportMode}};
//! use std::time::Duration;
//!
//! let config = Config::builder("graylog.domain.io")
//!     .port(12202)
//!     .compression(Compression::Gzip)
//!     .queue_capacity(4096)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.mode(), &TransportMode::Udp);
//!
//! // Compressed payloads can't be null-delimited:
//! assert!(Config::builder("graylog.domain.io")
//!     .mode(TransportMode::Tcp)
//!     .compression(Compression::Gzip)
//!     .build()
//!     .is_err());
//! ```

use crate::{
    chunk::{Chunker, DEFAULT_MAX_DATAGRAM},
    compress::Compression,
    connection::{
        Backoff, DEFAULT_CONNECT_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
        DEFAULT_WRITE_TIMEOUT,
    },
    encoder::GelfEncoder,
    error::{Error, Result},
    queue::{OverflowPolicy, QueueSettings},
    tls::TlsSettings,
};

use std::time::Duration;

/// The standard GELF port
pub const DEFAULT_PORT: u16 = 12201;

/// How messages travel to the collector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Datagrams, chunked when large
    #[default]
    Udp,
    /// A null-delimited TCP stream
    Tcp,
    /// A null-delimited stream over TLS
    Tls(TlsSettings),
}

impl TransportMode {
    pub fn is_stream(&self) -> bool {
        !matches!(self, TransportMode::Udp)
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportMode::Udp => write!(f, "udp"),
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Tls(_) => write!(f, "tls"),
        }
    }
}

/// Everything needed to construct a [`GelfClient`](crate::client::GelfClient).
#[derive(Clone, Debug)]
pub struct Config {
    host: String,
    port: u16,
    mode: TransportMode,
    origin_host: Option<String>,
    max_datagram: usize,
    compression: Compression,
    compression_fallback: bool,
    connect_timeout: Duration,
    write_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    queue: QueueSettings,
    encoder: GelfEncoder,
}

impl Config {
    /// Begin configuring a client that will ship messages to `host`.
    pub fn builder<S: Into<String>>(host: S) -> ConfigBuilder {
        ConfigBuilder {
            imp: Config {
                host: host.into(),
                port: DEFAULT_PORT,
                mode: TransportMode::Udp,
                origin_host: None,
                max_datagram: DEFAULT_MAX_DATAGRAM,
                compression: Compression::None,
                compression_fallback: true,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                write_timeout: DEFAULT_WRITE_TIMEOUT,
                initial_backoff: DEFAULT_INITIAL_BACKOFF,
                max_backoff: DEFAULT_MAX_BACKOFF,
                queue: QueueSettings::default(),
                encoder: GelfEncoder::default(),
            },
        }
    }
    /// The collector's host name or address
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn mode(&self) -> &TransportMode {
        &self.mode
    }
    /// The `host` field to stamp on messages, if not auto-detected
    pub fn origin_host(&self) -> Option<&str> {
        self.origin_host.as_deref()
    }
    pub fn max_datagram(&self) -> usize {
        self.max_datagram
    }
    pub fn compression(&self) -> Compression {
        self.compression
    }
    pub fn compression_fallback(&self) -> bool {
        self.compression_fallback
    }
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff)
    }
    pub fn queue(&self) -> &QueueSettings {
        &self.queue
    }
    pub fn encoder(&self) -> &GelfEncoder {
        &self.encoder
    }
}

pub struct ConfigBuilder {
    imp: Config,
}

impl ConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.imp.port = port;
        self
    }
    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.imp.mode = mode;
        self
    }
    /// Stamp messages with this `host` rather than the detected host name.
    pub fn origin_host<S: Into<String>>(mut self, origin_host: S) -> Self {
        self.imp.origin_host = Some(origin_host.into());
        self
    }
    /// The largest UDP datagram to send, chunk header included
    pub fn max_datagram(mut self, max_datagram: usize) -> Self {
        self.imp.max_datagram = max_datagram;
        self
    }
    pub fn compression(mut self, compression: Compression) -> Self {
        self.imp.compression = compression;
        self
    }
    /// Whether a payload that fails to compress is sent uncompressed (true) or dropped
    pub fn compression_fallback(mut self, compression_fallback: bool) -> Self {
        self.imp.compression_fallback = compression_fallback;
        self
    }
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.imp.connect_timeout = connect_timeout;
        self
    }
    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.imp.write_timeout = write_timeout;
        self
    }
    /// Reconnection delays start at `initial` & double on each consecutive failure, up to `max`
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.imp.initial_backoff = initial;
        self.imp.max_backoff = max;
        self
    }
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.imp.queue = self.imp.queue.capacity(capacity);
        self
    }
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.imp.queue = self.imp.queue.overflow(overflow);
        self
    }
    /// Hold up to `retry_capacity` messages while the connection is down; zero disables this.
    pub fn retry_buffer(mut self, retry_capacity: usize) -> Self {
        self.imp.queue = self.imp.queue.retry_capacity(retry_capacity);
        self
    }
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.imp.queue = self.imp.queue.grace(grace);
        self
    }
    pub fn encoder(mut self, encoder: GelfEncoder) -> Self {
        self.imp.encoder = encoder;
        self
    }
    pub fn build(self) -> Result<Config> {
        let cfg = self.imp;
        if cfg.host.trim().is_empty() {
            return Err(Error::config("the collector host must not be empty"));
        }
        if cfg.port == 0 {
            return Err(Error::config("the collector port must not be zero"));
        }
        Chunker::new(cfg.max_datagram)?;
        if cfg.mode.is_stream() && cfg.compression != Compression::None {
            return Err(Error::config(format!(
                "{} compression can't be used with {}: messages are null-delimited",
                cfg.compression, cfg.mode
            )));
        }
        if cfg.connect_timeout.is_zero() || cfg.write_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if cfg.initial_backoff.is_zero() || cfg.max_backoff < cfg.initial_backoff {
            return Err(Error::config(format!(
                "bad backoff bounds {:?}..{:?}",
                cfg.initial_backoff, cfg.max_backoff
            )));
        }
        cfg.queue.validate()?;
        if let TransportMode::Tls(settings) = &cfg.mode {
            settings.validate()?;
        }
        Ok(cfg)
    }
}
