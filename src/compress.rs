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
//! Optional compression of encoded payloads.
//!
//! Single-shot: the whole payload is in memory already, & GELF payloads are bounded, so there's
//! nothing to be gained from streaming.

use crate::error::{Error, Result};

use backtrace::Backtrace;
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression as Level,
};

use std::io::Write;

/// Compression algorithms understood by GELF collectors
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zlib,
}

impl Compression {
    /// Compress `buf` in one shot. [`Compression::None`] hands back a copy.
    pub fn compress(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let wrap = |err: std::io::Error| Error::Compression {
            source: err,
            back: Backtrace::new(),
        };
        match self {
            Compression::None => Ok(buf.to_vec()),
            Compression::Gzip => {
                let mut enc = GzEncoder::new(Vec::with_capacity(buf.len() / 2), Level::default());
                enc.write_all(buf).map_err(wrap)?;
                enc.finish().map_err(wrap)
            }
            Compression::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::with_capacity(buf.len() / 2), Level::default());
                enc.write_all(buf).map_err(wrap)?;
                enc.finish().map_err(wrap)
            }
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Compression::None => "none",
                Compression::Gzip => "gzip",
                Compression::Zlib => "zlib",
            }
        )
    }
}

/// Compress `buf` with `algorithm`
pub fn compress(buf: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    algorithm.compress(buf)
}
