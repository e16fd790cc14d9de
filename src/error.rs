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
//! [gelf-tracing](crate) errors

use backtrace::Backtrace;

use std::time::Duration;

/// [gelf-tracing](crate) error type
///
/// [gelf-tracing](crate) eschews libraries like [thiserror], [anyhow] & [Snafu] in favor of
/// a straightforward enumeration with a few match arms chosen on the basis what the caller will
/// need to respond.
///
/// Broadly, the variants fall into four groups:
///
/// - message problems the producer can do something about ([`Error::Validation`]), reported
///   synchronously
/// - messages that could not be made to fit the wire ([`Error::Encoding`],
///   [`Error::TooManyChunks`], [`Error::Compression`]); these are counted & logged, never handed
///   back to the thread that produced the event
/// - transport failures ([`Error::Transport`], [`Error::ConnectionLost`],
///   [`Error::NotConnected`], [`Error::Closed`], [`Error::Tls`])
/// - setup problems ([`Error::Config`], [`Error::NoHostname`])
///
/// [thiserror]: https://docs.rs/thiserror
/// [anyhow]: https://docs.rs/anyhow
/// [Snafu]: https://docs.rs/snafu/latest/snafu
#[non_exhaustive]
pub enum Error {
    /// A GELF message was malformed (missing host, empty short message, illegal field name...)
    Validation { reason: String, back: Backtrace },
    /// The encoded message exceeded the hard size cap, even after truncation
    Encoding {
        size: usize,
        limit: usize,
        back: Backtrace,
    },
    /// A payload would require more UDP chunks than the protocol permits
    TooManyChunks {
        size: usize,
        chunks: usize,
        back: Backtrace,
    },
    /// JSON serialization failed
    Json {
        source: serde_json::Error,
        back: Backtrace,
    },
    /// The compressor failed
    Compression {
        source: std::io::Error,
        back: Backtrace,
    },
    /// General transport layer error
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        back: Backtrace,
    },
    /// A write to an established stream failed; the connection has been torn down
    ConnectionLost {
        source: std::io::Error,
        back: Backtrace,
    },
    /// The stream transport is waiting out its reconnect delay
    NotConnected { retry_in: Duration, back: Backtrace },
    /// The transport has been shut down
    Closed { back: Backtrace },
    /// TLS setup or handshake failure
    Tls {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        back: Backtrace,
    },
    /// Bad configuration
    Config { reason: String, back: Backtrace },
    /// Failed to fetch hostname
    NoHostname {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        back: Backtrace,
    },
    /// An Event had no message field
    NoMessageField {
        name: &'static str,
        back: Backtrace,
    },
}

impl Error {
    pub(crate) fn validation<S: Into<String>>(reason: S) -> Error {
        Error::Validation {
            reason: reason.into(),
            back: Backtrace::new(),
        }
    }
    pub(crate) fn config<S: Into<String>>(reason: S) -> Error {
        Error::Config {
            reason: reason.into(),
            back: Backtrace::new(),
        }
    }
    pub(crate) fn transport<E>(err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport {
            source: Box::new(err),
            back: Backtrace::new(),
        }
    }
    pub(crate) fn tls<E>(err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Tls {
            source: Box::new(err),
            back: Backtrace::new(),
        }
    }
    /// True if the message that produced this error was never handed to the OS & may be
    /// offered again once the connection is re-established.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost { .. } | Error::NotConnected { .. }
        )
    }
}

impl std::fmt::Display for Error {
    // `Error` is non-exhaustive so that adding variants won't be a breaking change to our
    // callers. That means the compiler won't catch us if we miss a variant here, so we
    // always include a `_` arm.
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Validation { reason, .. } => write!(f, "Invalid GELF message: {}", reason),
            Error::Encoding { size, limit, .. } => write!(
                f,
                "Encoded GELF message is {} bytes; the limit is {}",
                size, limit
            ),
            Error::TooManyChunks { size, chunks, .. } => write!(
                f,
                "A payload of {} bytes would need {} UDP chunks (at most 128 are permitted)",
                size, chunks
            ),
            Error::Json { source, .. } => write!(f, "While serializing to JSON, got {}", source),
            Error::Compression { source, .. } => write!(f, "While compressing, got {}", source),
            Error::Transport { source, .. } => write!(f, "Transport error: {}", source),
            Error::ConnectionLost { source, .. } => {
                write!(f, "Connection to the collector lost: {}", source)
            }
            Error::NotConnected { retry_in, .. } => write!(
                f,
                "Not connected to the collector; next attempt in {:?}",
                retry_in
            ),
            Error::Closed { .. } => write!(f, "The transport has been shut down"),
            Error::Tls { source, .. } => write!(f, "TLS error: {}", source),
            Error::Config { reason, .. } => write!(f, "Bad configuration: {}", reason),
            Error::NoHostname { source, .. } => {
                write!(f, "Couldn't determine the local hostname: {}", source)
            }
            Error::NoMessageField { name, .. } => write!(
                f,
                "Event '{}' had no message field, and so was not forwarded to the collector",
                name
            ),
            _ => write!(f, "Other gelf-tracing error"),
        }
    }
}

impl std::fmt::Debug for Error {
    #[allow(unreachable_patterns)]
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Validation { back, .. }
            | Error::Encoding { back, .. }
            | Error::TooManyChunks { back, .. }
            | Error::Json { back, .. }
            | Error::Compression { back, .. }
            | Error::Transport { back, .. }
            | Error::ConnectionLost { back, .. }
            | Error::Tls { back, .. }
            | Error::Config { back, .. }
            | Error::NoHostname { back, .. }
            | Error::NoMessageField { back, .. } => write!(f, "{}\n{:#?}", self, back),
            // Routine during an outage; a backtrace here is just noise.
            Error::NotConnected { .. } | Error::Closed { .. } => write!(f, "{}", self),
            _ => write!(f, "gelf-tracing error: {}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Compression { source, .. } | Error::ConnectionLost { source, .. } => {
                Some(source)
            }
            Error::Json { source, .. } => Some(source),
            Error::Transport { source, .. }
            | Error::Tls { source, .. }
            | Error::NoHostname { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            source: err,
            back: Backtrace::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_variants() {
        let lost = Error::ConnectionLost {
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            back: Backtrace::new(),
        };
        assert!(lost.is_retryable());
        let waiting = Error::NotConnected {
            retry_in: Duration::from_secs(1),
            back: Backtrace::new(),
        };
        assert!(waiting.is_retryable());

        assert!(!Error::validation("no host").is_retryable());
        assert!(!Error::transport(std::io::Error::from(std::io::ErrorKind::Other)).is_retryable());
        assert!(!Error::Closed {
            back: Backtrace::new()
        }
        .is_retryable());
    }

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", Error::validation("host must not be empty")),
            "Invalid GELF message: host must not be empty"
        );
        assert_eq!(
            format!(
                "{}",
                Error::Encoding {
                    size: 10,
                    limit: 5,
                    back: Backtrace::new()
                }
            ),
            "Encoded GELF message is 10 bytes; the limit is 5"
        );
    }
}
