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
//! The GELF field model.
//!
//! A [`GelfMessage`] is an immutable record built once per log event with a
//! [`GelfMessageBuilder`]. Additional fields are an explicit mapping from name to scalar
//! [`FieldValue`]; flattening richer objects into that mapping is the caller's business.

use crate::{
    error::{Error, Result},
    level::Level,
};

use backtrace::Backtrace;
use chrono::prelude::*;
use regex::Regex;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        LazyLock,
    },
};

type StdResult<T, E> = std::result::Result<T, E>;

/// GELF protocol version written to every message
pub const GELF_VERSION: &str = "1.1";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          field values                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A scalar additional-field value.
///
/// Numbers go to the wire as JSON numbers; everything else as a JSON string. There is no "null":
/// an absent value is simply not added (see [`GelfMessageBuilder::optional_field`]).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    /// Interpret a configured textual value: anything that parses as a number becomes one, the
    /// rest stays a string.
    pub fn parse(text: &str) -> FieldValue {
        if let Ok(i) = text.parse::<i64>() {
            FieldValue::Int(i)
        } else if let Ok(u) = text.parse::<u64>() {
            FieldValue::UInt(u)
        } else {
            match text.parse::<f64>() {
                // "inf", "NaN" & friends parse, but aren't numbers in JSON
                Ok(x) if x.is_finite() => FieldValue::Float(x),
                _ => FieldValue::String(text.to_owned()),
            }
        }
    }
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldValue::Int(_) | FieldValue::UInt(_) | FieldValue::Float(_)
        )
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        match self {
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::UInt(u) => write!(f, "{}", u),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<String> for FieldValue {
    fn from(x: String) -> Self {
        FieldValue::String(x)
    }
}

impl From<&str> for FieldValue {
    fn from(x: &str) -> Self {
        FieldValue::String(x.to_owned())
    }
}

impl From<i64> for FieldValue {
    fn from(x: i64) -> Self {
        FieldValue::Int(x)
    }
}

impl From<i32> for FieldValue {
    fn from(x: i32) -> Self {
        FieldValue::Int(x as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(x: u64) -> Self {
        FieldValue::UInt(x)
    }
}

impl From<u32> for FieldValue {
    fn from(x: u32) -> Self {
        FieldValue::UInt(x as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Float(x)
    }
}

impl From<bool> for FieldValue {
    fn from(x: bool) -> Self {
        FieldValue::Bool(x)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          field names                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

static FIELD_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.-]+$").unwrap());

/// Names that would collide with the protocol once prefixed (Graylog rejects `_id`).
const RESERVED_FIELD_NAMES: &[&str] = &["id", "version"];

/// Check an additional-field name (without its leading underscore).
///
/// A name must be non-empty, match `^[\w.-]+$` & not be one of the reserved names (compared
/// case-insensitively).
pub fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("additional field names must not be empty"));
    }
    if RESERVED_FIELD_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
    {
        return Err(Error::validation(format!(
            "additional field name '{}' is reserved",
            name
        )));
    }
    if !FIELD_NAME.is_match(name) {
        return Err(Error::validation(format!(
            "additional field name '{}' doesn't match {}",
            name,
            FIELD_NAME.as_str()
        )));
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           hostnames                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The originating host identifier: any non-empty string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hostname(String);

impl Hostname {
    pub fn new(name: String) -> Result<Hostname> {
        if name.trim().is_empty() {
            Err(Error::validation("host must not be empty"))
        } else {
            Ok(Hostname(name))
        }
    }
    /// Attempt to figure-out a name for this host.
    ///
    /// First try [gethostname()]; should that fail (or produce something empty) fall back to a
    /// local IP address.
    ///
    /// [gethostname()]: https://man7.org/linux/man-pages/man2/gethostname.2.html
    pub fn detect() -> Result<Hostname> {
        hostname::get()
            .map_err(|err| Error::NoHostname {
                source: Box::new(err),
                back: Backtrace::new(),
            })
            .and_then(|hn| Hostname::new(hn.to_string_lossy().into_owned()))
            .or_else(|_| {
                local_ip_address::local_ip()
                    .map_err(|err| Error::NoHostname {
                        source: Box::new(err),
                        back: Backtrace::new(),
                    })
                    .map(|ip| Hostname(ip.to_string()))
            })
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::default::Default for Hostname {
    /// [`Hostname::detect`], or "unknown" if nothing can be found.
    fn default() -> Self {
        Hostname::detect().unwrap_or_else(|_| Hostname("unknown".to_owned()))
    }
}

impl std::convert::TryFrom<String> for Hostname {
    type Error = Error;
    fn try_from(x: String) -> StdResult<Self, Self::Error> {
        Hostname::new(x)
    }
}

impl std::fmt::Display for Hostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           timestamps                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

static LAST_TIMESTAMP_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// The current time, never earlier than any value previously returned in this process.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let prev = LAST_TIMESTAMP_MICROS.fetch_max(now, Ordering::Relaxed);
    let micros = std::cmp::max(now, prev);
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        struct GelfMessage                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One GELF message.
#[derive(Clone, Debug, PartialEq)]
pub struct GelfMessage {
    host: String,
    short_message: String,
    full_message: Option<String>,
    timestamp: DateTime<Utc>,
    level: Level,
    additional_fields: BTreeMap<String, FieldValue>,
}

impl GelfMessage {
    pub fn builder<H: Into<String>, M: Into<String>>(
        host: H,
        short_message: M,
    ) -> GelfMessageBuilder {
        GelfMessageBuilder {
            imp: GelfMessage {
                host: host.into(),
                short_message: short_message.into(),
                full_message: None,
                timestamp: monotonic_now(),
                level: Level::default(),
                additional_fields: BTreeMap::new(),
            },
        }
    }
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn short_message(&self) -> &str {
        &self.short_message
    }
    pub fn full_message(&self) -> Option<&str> {
        self.full_message.as_deref()
    }
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn level(&self) -> Level {
        self.level
    }
    /// Additional fields, keyed by their name *without* the leading underscore
    pub fn additional_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.additional_fields
    }
}

pub struct GelfMessageBuilder {
    imp: GelfMessage,
}

impl GelfMessageBuilder {
    /// An empty full message is the same as none at all.
    pub fn full_message<S: Into<String>>(mut self, full_message: S) -> Self {
        let full_message = full_message.into();
        self.imp.full_message = if full_message.is_empty() {
            None
        } else {
            Some(full_message)
        };
        self
    }
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.imp.timestamp = timestamp;
        self
    }
    pub fn level(mut self, level: Level) -> Self {
        self.imp.level = level;
        self
    }
    /// Name validation is deferred to the encoder, which applies the configured policy.
    pub fn field<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.imp.additional_fields.insert(key.into(), value.into());
        self
    }
    pub fn optional_field<K: Into<String>, V: Into<FieldValue>>(
        self,
        key: K,
        value: Option<V>,
    ) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }
    pub fn build(self) -> GelfMessage {
        self.imp
    }
}
