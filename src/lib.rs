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

//! A [`tracing-subscriber`] [`Layer`] implementation & transport for shipping [`tracing`]
//! [`Event`]s to a [GELF] collector (such as [Graylog]) over UDP, TCP or TLS
//!
//! [`tracing-subscriber`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/index.html
//! [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
//! [`tracing`]: https://docs.rs/tracing/0.1.35/tracing/index.html
//! [`Event`]: https://docs.rs/tracing/0.1.35/tracing/struct.Event.html
//! [GELF]: https://go2docs.graylog.org/current/getting_in_log_data/gelf.html
//! [Graylog]: https://graylog.org
//!
//! # Introduction
//!
//! GELF (the Graylog Extended Log Format) is a JSON-based, structured log format with a small
//! amount of wire protocol attached: over UDP, messages too large for one datagram are split into
//! at most 128 "chunks" that the collector reassembles; over TCP (& TLS), messages are written
//! back-to-back on a single stream, each terminated by a null byte.
//!
//! Formatting the JSON is the easy part. The harder part is getting it onto the wire without
//! hurting the application that's logging: the collector may be slow, or unreachable, or the
//! connection may drop & need to be re-established. None of that should ever block (or panic)
//! the thread that emitted the event. So this crate arranges things as a pipeline:
//!
//! ```text
//! producer threads                              consumer thread
//! ───────────────────────────────────────────   ─────────────────────────────────────────
//! Event ─► GelfMessage ─► encode ─► compress ─► queue ─► UDP chunker | TCP/TLS connection
//! ```
//!
//! - [`message`]: the GELF message model
//! - [`encoder`]: GELF JSON, field validation & size limits
//! - [`compress`]: optional gzip/zlib compression (UDP only)
//! - [`queue`]: a bounded queue with a single consumer thread that owns the transport
//! - [`chunk`] & [`transport`]: UDP chunking; null-delimited stream framing
//! - [`connection`] & [`tls`]: the reconnecting stream state machine & its TLS flavor
//! - [`client`]: ties the above together behind `submit()` & `shutdown()`
//! - [`layer`]: plugs a [`client::GelfClient`] into a [`tracing`] subscriber
//!
//! Nothing that goes wrong after a message has been encoded is reported to the producer; it is
//! counted instead (see [`stats`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use tracing::info;
//! use gelf_tracing::{config::Config, layer::Layer};
//! use tracing_subscriber::registry::Registry;
//! use tracing_subscriber::layer::SubscriberExt; // Needed to get `with()`
//!
//! // Send GELF messages via UDP to port 12201 on graylog.local
//! let config = Config::builder("graylog.local").build().unwrap();
//! let subscriber = Registry::default().with(Layer::try_new(&config).unwrap());
//! let _guard = tracing::subscriber::set_default(subscriber);
//!
//! info!(user = "jdoe", attempts = 3, "Login failed");
//! ```
//!
//! Will produce GELF messages that look something like this:
//!
//! ```text
//! {"version":"1.1","host":"hostname","short_message":"Login failed","timestamp":1656025855.123,
//!  "level":6,"_attempts":3,"_logger_name":"my_app","_thread_name":"main","_user":"jdoe"}
//! ```
//!
//! The transport, the encoding & the delivery queue are all configurable:
//!
//! ```rust,no_run
//! use gelf_tracing::{
//!     config::{Config, TransportMode},
//!     encoder::GelfEncoder,
//!     layer::Layer,
//!     queue::OverflowPolicy,
//!     tls::TlsSettings,
//! };
//! use std::time::Duration;
//!
//! let config = Config::builder("graylog.domain.io")
//!     .port(12202)
//!     .mode(TransportMode::Tls(TlsSettings::new().trust("/etc/graylog/ca.pem")))
//!     .overflow(OverflowPolicy::Block(Duration::from_millis(10)))
//!     .retry_buffer(256)
//!     .encoder(GelfEncoder::builder().static_field_specs(["env:prod", "shard:7"]).build())
//!     .build()
//!     .unwrap();
//! let layer = Layer::try_new(&config).unwrap().with_caller(true);
//! ```

pub mod chunk;
pub mod client;
pub mod compress;
pub mod config;
pub mod connection;
pub mod encoder;
pub mod error;
pub mod layer;
pub mod level;
pub mod message;
pub mod queue;
pub mod stats;
pub mod tls;
pub mod transport;
