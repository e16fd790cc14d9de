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
//! GELF UDP chunking.
//!
//! A payload that fits in one datagram goes out as-is. Anything larger is split into at most
//! [`MAX_CHUNKS`] chunks, each sent in its own datagram behind a twelve byte header:
//!
//! ```text
//! +------+------+---------------------+-----+-------+-------------------+
//! | 0x1e | 0x0f | message id (8 bytes) | seq | count | payload bytes ... |
//! +------+------+---------------------+-----+-------+-------------------+
//! ```
//!
//! The receiver reassembles by message id & sequence number; losing any one chunk loses the
//! message. Message ids are random, so two messages in the collector's reassembly window could
//! in principle collide (a 1 in 2^64 chance per pair, which we accept).

use crate::error::{Error, Result};

use backtrace::Backtrace;
use bytes::{BufMut, BytesMut};

/// Magic bytes identifying a chunked GELF datagram
pub const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
/// Magic, message id, sequence number & sequence count
pub const CHUNK_HEADER_LEN: usize = 12;
/// The protocol's limit on chunks per message
pub const MAX_CHUNKS: usize = 128;
/// Default maximum datagram size
pub const DEFAULT_MAX_DATAGRAM: usize = 8192;
/// Smallest usable datagram: a header & one byte of payload
pub const MIN_DATAGRAM: usize = CHUNK_HEADER_LEN + 1;
/// Largest datagram we'll attempt
pub const MAX_DATAGRAM: usize = 65467;

pub type MessageId = [u8; 8];

/// A fresh, random message id
pub fn random_message_id() -> MessageId {
    rand::random()
}

/// One fragment of a chunked message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub message_id: MessageId,
    pub sequence_number: u8,
    pub sequence_count: u8,
    pub payload: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Append this chunk, header & all, to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(CHUNK_HEADER_LEN + self.payload.len());
        buf.put_slice(&CHUNK_MAGIC);
        buf.put_slice(&self.message_id);
        buf.put_u8(self.sequence_number);
        buf.put_u8(self.sequence_count);
        buf.put_slice(self.payload);
    }
    /// Recognize a chunked datagram; `None` if it isn't one.
    pub fn parse(datagram: &'a [u8]) -> Option<Chunk<'a>> {
        if datagram.len() < CHUNK_HEADER_LEN || datagram[..2] != CHUNK_MAGIC {
            return None;
        }
        let mut message_id = [0u8; 8];
        message_id.copy_from_slice(&datagram[2..10]);
        Some(Chunk {
            message_id,
            sequence_number: datagram[10],
            sequence_count: datagram[11],
            payload: &datagram[CHUNK_HEADER_LEN..],
        })
    }
}

/// How a payload is to be written.
pub enum Split<'a> {
    /// Small enough for one datagram, sent without a chunk header
    Single(&'a [u8]),
    /// One datagram per chunk
    Chunked(Chunks<'a>),
}

/// Iterates over the chunks of a single message, in sequence order.
pub struct Chunks<'a> {
    payload: &'a [u8],
    message_id: MessageId,
    chunk_size: usize,
    count: u8,
    next: u8,
}

impl<'a> Chunks<'a> {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;
    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.next >= self.count {
            return None;
        }
        let start = self.next as usize * self.chunk_size;
        let end = std::cmp::min(start + self.chunk_size, self.payload.len());
        let chunk = Chunk {
            message_id: self.message_id,
            sequence_number: self.next,
            sequence_count: self.count,
            payload: &self.payload[start..end],
        };
        self.next += 1;
        Some(chunk)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next) as usize;
        (left, Some(left))
    }
}

impl<'a> ExactSizeIterator for Chunks<'a> {}

/// Splits payloads for a given maximum datagram size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// `max_datagram` must lie in [`MIN_DATAGRAM`]..=[`MAX_DATAGRAM`].
    pub fn new(max_datagram: usize) -> Result<Chunker> {
        if !(MIN_DATAGRAM..=MAX_DATAGRAM).contains(&max_datagram) {
            return Err(Error::config(format!(
                "maximum datagram size must be between {} & {}; got {}",
                MIN_DATAGRAM, MAX_DATAGRAM, max_datagram
            )));
        }
        Ok(Chunker {
            chunk_size: max_datagram - CHUNK_HEADER_LEN,
        })
    }
    /// Payload bytes per chunk; also the largest payload sent unchunked
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
    /// The largest payload that can be sent at all
    pub fn max_payload(&self) -> usize {
        self.chunk_size * MAX_CHUNKS
    }
    pub fn chunk_count(&self, len: usize) -> usize {
        if len <= self.chunk_size {
            1
        } else {
            len.div_ceil(self.chunk_size)
        }
    }
    pub fn split<'a>(&self, payload: &'a [u8]) -> Result<Split<'a>> {
        self.split_with_id(payload, random_message_id())
    }
    pub fn split_with_id<'a>(&self, payload: &'a [u8], message_id: MessageId) -> Result<Split<'a>> {
        if payload.len() <= self.chunk_size {
            return Ok(Split::Single(payload));
        }
        let chunks = self.chunk_count(payload.len());
        if chunks > MAX_CHUNKS {
            return Err(Error::TooManyChunks {
                size: payload.len(),
                chunks,
                back: Backtrace::new(),
            });
        }
        Ok(Split::Chunked(Chunks {
            payload,
            message_id,
            chunk_size: self.chunk_size,
            count: chunks as u8,
            next: 0,
        }))
    }
}

impl std::default::Default for Chunker {
    fn default() -> Self {
        Chunker {
            chunk_size: DEFAULT_MAX_DATAGRAM - CHUNK_HEADER_LEN,
        }
    }
}
