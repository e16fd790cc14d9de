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
//! The producer-facing facade.
//!
//! A [`GelfClient`] ties the pipeline together: producers call [`GelfClient::submit`], which
//! encodes (& optionally compresses) the message on the calling thread & hands the bytes to the
//! delivery queue; everything from there on happens on the consumer thread.
//!
//! ```rust,no_run
//! use gelf_tracing::{client::GelfClient, config::Config, level::Level};
//!
//! let client = GelfClient::new(&Config::builder("localhost").build().unwrap()).unwrap();
//! let msg = client
//!     .message("disk almost full")
//!     .level(Level::LOG_WARNING)
//!     .field("mount", "/var")
//!     .field("pct_used", 97)
//!     .build();
//! client.submit(&msg).unwrap();
//! let report = client.shutdown();
//! assert_eq!(report.dropped, 0);
//! ```

use crate::{
    chunk::{Chunker, MAX_CHUNKS},
    compress::Compression,
    config::{Config, TransportMode},
    connection::TcpConnector,
    encoder::GelfEncoder,
    error::{Error, Result},
    message::{GelfMessage, GelfMessageBuilder, Hostname},
    queue::{self, DeliveryQueue, ShutdownReport, Worker},
    stats::{bump, Stats, StatsSnapshot},
    tls::TlsConnector,
    transport::{StreamTransport, Transport, UdpTransport},
};

use tracing::{debug, info};

use std::{sync::Arc, time::Duration};

/// Encodes messages & queues them for delivery to a GELF collector.
///
/// `GelfClient` is `Sync`; share it between producer threads by reference or in an [`Arc`].
/// Dropping it shuts the pipeline down (with the configured grace period); call
/// [`shutdown`](GelfClient::shutdown) to learn how many messages were lost in the process.
pub struct GelfClient {
    origin: Hostname,
    encoder: GelfEncoder,
    compression: Compression,
    compression_fallback: bool,
    chunker: Option<Chunker>,
    queue: DeliveryQueue,
    worker: Option<Worker>,
    grace: Duration,
    stats: Arc<Stats>,
}

impl GelfClient {
    /// Start a client per `config`; this spawns the delivery thread.
    pub fn new(config: &Config) -> Result<GelfClient> {
        let origin = match config.origin_host() {
            Some(name) => Hostname::new(name.to_string())?,
            None => Hostname::default(),
        };
        let tcp = || {
            TcpConnector::new(config.host(), config.port())
                .connect_timeout(config.connect_timeout())
                .write_timeout(config.write_timeout())
        };
        let (transport, chunker, encoder): (Box<dyn Transport>, Option<Chunker>, GelfEncoder) =
            match config.mode() {
                TransportMode::Udp => {
                    let chunker = Chunker::new(config.max_datagram())?;
                    (
                        Box::new(UdpTransport::new(config.host(), config.port(), chunker))
                            as Box<dyn Transport>,
                        Some(chunker),
                        // Truncate, rather than fail to chunk, where we can
                        config.encoder().capped_at(chunker.max_payload()),
                    )
                }
                TransportMode::Tcp => (
                    Box::new(StreamTransport::new(tcp(), config.backoff())) as Box<dyn Transport>,
                    None,
                    config.encoder().clone(),
                ),
                TransportMode::Tls(settings) => (
                    Box::new(StreamTransport::new(
                        TlsConnector::new(tcp(), settings)?,
                        config.backoff(),
                    )) as Box<dyn Transport>,
                    None,
                    config.encoder().clone(),
                ),
            };
        let stats = Arc::new(Stats::new());
        let (queue, worker) = queue::spawn(transport, config.queue(), stats.clone())?;
        info!(
            "Shipping GELF messages from {} to {}:{} over {}",
            origin,
            config.host(),
            config.port(),
            config.mode()
        );
        Ok(GelfClient {
            origin,
            encoder,
            compression: config.compression(),
            compression_fallback: config.compression_fallback(),
            chunker,
            queue,
            worker: Some(worker),
            grace: config.queue().shutdown_grace(),
            stats,
        })
    }
    /// The `host` this client stamps on messages built with [`message`](GelfClient::message)
    pub fn origin(&self) -> &Hostname {
        &self.origin
    }
    /// Start building a message from this host.
    pub fn message<S: Into<String>>(&self, short_message: S) -> GelfMessageBuilder {
        GelfMessage::builder(self.origin.as_str(), short_message)
    }
    /// Encode `msg` & queue it for delivery.
    ///
    /// Only a malformed message is reported as an error. Otherwise this returns whether the
    /// message was queued: messages that can't be made to fit the wire, or that find the queue
    /// full (or closed), are dropped & counted in [`stats`](GelfClient::stats).
    pub fn submit(&self, msg: &GelfMessage) -> Result<bool> {
        bump(&self.stats.submitted);
        let payload = match self.encoder.encode(msg) {
            Ok(payload) => payload,
            Err(err @ Error::Validation { .. }) => {
                bump(&self.stats.validation_errors);
                return Err(err);
            }
            Err(err) => {
                debug!("Dropping a message that couldn't be encoded: {}", err);
                bump(&self.stats.encode_errors);
                return Ok(false);
            }
        };
        let payload = match self.compression {
            Compression::None => payload,
            algo => match algo.compress(&payload) {
                Ok(compressed) => compressed,
                Err(err) if self.compression_fallback => {
                    debug!("{}; sending uncompressed", err);
                    bump(&self.stats.compression_fallbacks);
                    payload
                }
                Err(err) => {
                    debug!("Dropping a message that couldn't be compressed: {}", err);
                    bump(&self.stats.encode_errors);
                    return Ok(false);
                }
            },
        };
        if let Some(chunker) = &self.chunker {
            let chunks = chunker.chunk_count(payload.len());
            if chunks > MAX_CHUNKS {
                debug!(
                    "Dropping a message of {} bytes: it would need {} chunks",
                    payload.len(),
                    chunks
                );
                bump(&self.stats.encode_errors);
                return Ok(false);
            }
        }
        Ok(self.queue.submit(payload))
    }
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
    /// Stop accepting messages, drain the queue for up to the configured grace period & close
    /// the connection.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop()
    }
    fn stop(&mut self) -> ShutdownReport {
        match self.worker.take() {
            Some(worker) => worker.shutdown(self.grace),
            None => ShutdownReport::default(),
        }
    }
}

impl Drop for GelfClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::{encoder::OversizePolicy, level::Level, queue::OverflowPolicy};

    use std::net::UdpSocket;

    fn collector() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[test]
    fn validation_errors_are_reported() {
        let (_sock, port) = collector();
        let client = GelfClient::new(
            &Config::builder("127.0.0.1")
                .port(port)
                .origin_host("h1")
                .build()
                .unwrap(),
        )
        .unwrap();
        let msg = client.message("").build();
        match client.submit(&msg) {
            Err(Error::Validation { .. }) => (),
            other => panic!("expected a validation error, got {:?}", other),
        }
        let stats = client.shutdown();
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn udp_end_to_end() {
        let (sock, port) = collector();
        let client = GelfClient::new(
            &Config::builder("127.0.0.1")
                .port(port)
                .origin_host("h1")
                .build()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(client.origin().as_str(), "h1");
        let msg = client.message("boom").level(Level::LOG_ERR).build();
        assert!(client.submit(&msg).unwrap());

        let mut buf = [0u8; 8192];
        let n = sock.recv(&mut buf).unwrap();
        let obj: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(obj["host"], "h1");
        assert_eq!(obj["short_message"], "boom");
        assert_eq!(obj["level"], 3);

        client.shutdown();
    }

    #[test]
    fn compressed() {
        use std::io::Read;

        let (sock, port) = collector();
        let client = GelfClient::new(
            &Config::builder("127.0.0.1")
                .port(port)
                .origin_host("h1")
                .compression(Compression::Gzip)
                .build()
                .unwrap(),
        )
        .unwrap();
        assert!(client.submit(&client.message("squeezed").build()).unwrap());

        let mut buf = [0u8; 8192];
        let n = sock.recv(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x1f, 0x8b]);
        let mut json = String::new();
        flate2::read::GzDecoder::new(&buf[..n])
            .read_to_string(&mut json)
            .unwrap();
        assert!(json.contains("\"short_message\":\"squeezed\""));
        client.shutdown();
    }

    #[test]
    fn oversize_for_udp() {
        let (_sock, port) = collector();
        // 128 chunks of 8 bytes: the encoder's hard cap is lowered to 1024 bytes
        let client = GelfClient::new(
            &Config::builder("127.0.0.1")
                .port(port)
                .origin_host("h1")
                .max_datagram(20)
                .encoder(
                    GelfEncoder::builder()
                        .oversize_policy(OversizePolicy::Reject)
                        .build(),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
        let msg = client.message("x".repeat(200)).field("blob", "y".repeat(2000)).build();
        assert!(!client.submit(&msg).unwrap());
        assert_eq!(client.stats().encode_errors, 1);

        // Small enough to chunk:
        assert!(client.submit(&client.message("fits").build()).unwrap());
        client.shutdown();
    }

    #[test]
    fn shutdown_refuses_late_messages() {
        let (_sock, port) = collector();
        let client = GelfClient::new(
            &Config::builder("127.0.0.1")
                .port(port)
                .origin_host("h1")
                .overflow(OverflowPolicy::DropNewest)
                .build()
                .unwrap(),
        )
        .unwrap();
        for i in 0..10 {
            assert!(client.submit(&client.message(format!("msg {}", i)).build()).unwrap());
        }
        let snap = client.stats();
        assert_eq!(snap.submitted, 10);
        // Producer handles can outlive the client
        let queue = client.queue.clone();
        let stats = client.stats.clone();
        let report = client.shutdown();
        assert_eq!(report.dropped, 0);

        assert!(!queue.submit(b"late".to_vec()));
        let snap = stats.snapshot();
        assert_eq!(snap.rejected_closed, 1);
        assert_eq!(snap.enqueued, 10);
        assert_eq!(snap.sent, 10);
    }
}
