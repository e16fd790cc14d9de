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
//! Encoding [`GelfMessage`]s to GELF JSON.
//!
//! [`GelfEncoder::encode`] is a pure function from a message to a compact, UTF-8 JSON payload:
//!
//! ```text
//! {"version":"1.1","host":"h1","short_message":"boom","timestamp":1584271169.123,"level":3,"_foo":"bar"}
//! ```
//!
//! The encoder enforces the field rules: required fields present, the short message cut to a
//! maximum length, additional-field names legal & prefixed with `_`, and the whole payload under
//! a hard cap. Size decisions here are made on the *uncompressed* payload.

use crate::{
    error::{Error, Result},
    message::{validate_field_name, FieldValue, GelfMessage, GELF_VERSION},
};

use tracing::warn;

use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
};

/// Default maximum length, in bytes, of `short_message`
pub const DEFAULT_MAX_SHORT_MESSAGE: usize = 250;
/// Default hard cap, in bytes, on an encoded payload
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// What to do with a payload that exceeds the hard cap
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OversizePolicy {
    /// Cut `full_message` (then `short_message`) until the payload fits
    Truncate,
    /// Fail with [`Error::Encoding`]
    Reject,
}

/// What to do with an additional field whose name is illegal, reserved or already taken
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Fail the whole message with [`Error::Validation`]
    Reject,
    /// Drop the field (with a warning) & carry on
    Strip,
}

/// Turns [`GelfMessage`]s into GELF JSON.
///
/// Instances are immutable once built & may be shared freely between producer threads.
#[derive(Clone, Debug)]
pub struct GelfEncoder {
    max_short_message: usize,
    max_payload: usize,
    oversize: OversizePolicy,
    invalid_fields: FieldPolicy,
    numbers_as_string: bool,
    static_fields: BTreeMap<String, FieldValue>,
}

impl std::default::Default for GelfEncoder {
    fn default() -> Self {
        GelfEncoder {
            max_short_message: DEFAULT_MAX_SHORT_MESSAGE,
            max_payload: DEFAULT_MAX_PAYLOAD,
            oversize: OversizePolicy::Truncate,
            invalid_fields: FieldPolicy::Strip,
            numbers_as_string: false,
            static_fields: BTreeMap::new(),
        }
    }
}

pub struct GelfEncoderBuilder {
    imp: GelfEncoder,
}

impl GelfEncoderBuilder {
    pub fn max_short_message(mut self, max_short_message: usize) -> Self {
        self.imp.max_short_message = max_short_message;
        self
    }
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.imp.max_payload = max_payload;
        self
    }
    pub fn oversize_policy(mut self, oversize: OversizePolicy) -> Self {
        self.imp.oversize = oversize;
        self
    }
    pub fn invalid_field_policy(mut self, invalid_fields: FieldPolicy) -> Self {
        self.imp.invalid_fields = invalid_fields;
        self
    }
    pub fn numbers_as_string(mut self, numbers_as_string: bool) -> Self {
        self.imp.numbers_as_string = numbers_as_string;
        self
    }
    /// Attach `value` under `name` to every message.
    pub fn static_field<K: Into<String>, V: Into<FieldValue>>(
        mut self,
        name: K,
        value: V,
    ) -> Result<Self> {
        self.add_static_field(name.into(), value.into())?;
        Ok(self)
    }
    /// Attach a static field given as `key:value`; the value is interpreted by
    /// [`FieldValue::parse`] so that numeric values go out as JSON numbers.
    pub fn static_field_spec(mut self, spec: &str) -> Result<Self> {
        self.add_static_field_spec(spec)?;
        Ok(self)
    }
    /// Attach each `key:value` in `specs`; entries that are malformed, illegal or duplicated are
    /// logged & skipped.
    pub fn static_field_specs<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for spec in specs {
            if let Err(err) = self.add_static_field_spec(spec.as_ref()) {
                warn!("Ignoring static field '{}': {}", spec.as_ref(), err);
            }
        }
        self
    }
    fn add_static_field(&mut self, name: String, value: FieldValue) -> Result<()> {
        validate_field_name(&name)?;
        if self.imp.static_fields.contains_key(&name) {
            return Err(Error::validation(format!(
                "static field '{}' is already defined",
                name
            )));
        }
        self.imp.static_fields.insert(name, value);
        Ok(())
    }
    fn add_static_field_spec(&mut self, spec: &str) -> Result<()> {
        match spec.split_once(':') {
            Some((key, value)) => {
                self.add_static_field(key.trim().to_string(), FieldValue::parse(value.trim()))
            }
            None => Err(Error::validation(format!(
                "static fields must be in the form key:value; got '{}'",
                spec
            ))),
        }
    }
    pub fn build(self) -> GelfEncoder {
        self.imp
    }
}

impl GelfEncoder {
    pub fn builder() -> GelfEncoderBuilder {
        GelfEncoderBuilder {
            imp: GelfEncoder::default(),
        }
    }
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
    pub fn static_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.static_fields
    }
    /// Copy of this encoder with a tighter hard cap (never a looser one).
    pub(crate) fn capped_at(&self, max_payload: usize) -> GelfEncoder {
        let mut capped = self.clone();
        capped.max_payload = std::cmp::min(self.max_payload, max_payload);
        capped
    }

    /// Encode `msg` as compact GELF JSON.
    pub fn encode(&self, msg: &GelfMessage) -> Result<Vec<u8>> {
        if msg.host().trim().is_empty() {
            return Err(Error::validation("host must not be empty"));
        }
        let mut short = truncate_utf8(msg.short_message(), self.max_short_message);
        if nothing_left(short) {
            return Err(Error::validation(if msg.short_message().is_empty() {
                "short_message must not be empty".to_string()
            } else {
                format!(
                    "short_message is empty once cut to {} bytes & stripped of carriage returns",
                    self.max_short_message
                )
            }));
        }

        let fields = self.collect_fields(msg)?;
        let mut full = msg.full_message();

        loop {
            let buf = self.write_json(msg, short, full, &fields)?;
            if buf.len() <= self.max_payload {
                return Ok(buf);
            }
            let too_big = || Error::Encoding {
                size: buf.len(),
                limit: self.max_payload,
                back: backtrace::Backtrace::new(),
            };
            if self.oversize == OversizePolicy::Reject {
                return Err(too_big());
            }
            // Each pass strictly shortens one of the two messages, so this terminates.
            let excess = buf.len() - self.max_payload;
            if let Some(text) = full {
                full = if text.len() > excess {
                    Some(truncate_utf8(text, text.len() - excess)).filter(|s| !s.is_empty())
                } else {
                    None
                };
            } else if short.len() > excess {
                short = truncate_utf8(short, short.len() - excess);
                if nothing_left(short) {
                    return Err(too_big());
                }
            } else {
                return Err(too_big());
            }
        }
    }

    /// Static fields first, then the message's own; the first definition of a name wins.
    fn collect_fields<'a>(&'a self, msg: &'a GelfMessage) -> Result<Vec<(&'a str, &'a FieldValue)>> {
        let mut seen = BTreeSet::new();
        let mut fields = Vec::with_capacity(self.static_fields.len() + msg.additional_fields().len());
        for (name, value) in self.static_fields.iter().chain(msg.additional_fields()) {
            let verdict = validate_field_name(name).and_then(|_| {
                if seen.insert(name.as_str()) {
                    Ok(())
                } else {
                    Err(Error::validation(format!(
                        "additional field '{}' is defined more than once",
                        name
                    )))
                }
            });
            match (verdict, self.invalid_fields) {
                (Ok(()), _) => fields.push((name.as_str(), value)),
                (Err(err), FieldPolicy::Reject) => return Err(err),
                (Err(err), FieldPolicy::Strip) => warn!("Dropping additional field: {}", err),
            }
        }
        Ok(fields)
    }

    fn write_json(
        &self,
        msg: &GelfMessage,
        short: &str,
        full: Option<&str>,
        fields: &[(&str, &FieldValue)],
    ) -> Result<Vec<u8>> {
        let mut obj = JsonObject::new(Vec::with_capacity(256));
        obj.string("version", GELF_VERSION)?;
        obj.string("host", msg.host())?;
        obj.string("short_message", short)?;
        if let Some(full) = full {
            obj.string("full_message", full)?;
        }
        let millis = msg.timestamp().timestamp_millis();
        obj.raw(
            "timestamp",
            &format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000)),
        );
        obj.raw("level", &u8::from(msg.level()).to_string());
        for (name, value) in fields {
            obj.additional(name, value, self.numbers_as_string)?;
        }
        Ok(obj.finish())
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// True if `s` would go out on the wire as an empty string.
fn nothing_left(s: &str) -> bool {
    s.chars().all(|c| c == '\r')
}

/// Graylog rejects carriage returns outright; everything else is left to the JSON escaper.
fn without_carriage_returns(s: &str) -> Cow<'_, str> {
    if s.contains('\r') {
        Cow::Owned(s.replace('\r', ""))
    } else {
        Cow::Borrowed(s)
    }
}

/// Incremental writer for one flat JSON object; keys come out in call order.
struct JsonObject {
    buf: Vec<u8>,
    started: bool,
}

impl JsonObject {
    fn new(mut buf: Vec<u8>) -> JsonObject {
        buf.push(b'{');
        JsonObject {
            buf,
            started: false,
        }
    }
    fn key(&mut self, key: &str) -> Result<()> {
        if self.started {
            self.buf.push(b',');
        }
        self.started = true;
        serde_json::to_writer(&mut self.buf, key)?;
        self.buf.push(b':');
        Ok(())
    }
    fn string(&mut self, key: &str, value: &str) -> Result<()> {
        self.key(key)?;
        serde_json::to_writer(&mut self.buf, without_carriage_returns(value).as_ref())?;
        Ok(())
    }
    /// `key` must need no escaping & `value` must already be valid JSON
    fn raw(&mut self, key: &str, value: &str) {
        if self.started {
            self.buf.push(b',');
        }
        self.started = true;
        self.buf.push(b'"');
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.extend_from_slice(b"\":");
        self.buf.extend_from_slice(value.as_bytes());
    }
    fn additional(&mut self, name: &str, value: &FieldValue, numbers_as_string: bool) -> Result<()> {
        let key = format!("_{}", name);
        match value {
            FieldValue::Int(_) | FieldValue::UInt(_) if numbers_as_string => {
                self.string(&key, &value.to_string())
            }
            FieldValue::Int(i) => {
                self.key(&key)?;
                Ok(serde_json::to_writer(&mut self.buf, i)?)
            }
            FieldValue::UInt(u) => {
                self.key(&key)?;
                Ok(serde_json::to_writer(&mut self.buf, u)?)
            }
            FieldValue::Float(x) if x.is_finite() && !numbers_as_string => {
                self.key(&key)?;
                Ok(serde_json::to_writer(&mut self.buf, x)?)
            }
            FieldValue::Float(_) | FieldValue::Bool(_) => self.string(&key, &value.to_string()),
            FieldValue::String(s) => self.string(&key, s),
        }
    }
    fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'}');
        self.buf
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::level::Level;

    use chrono::prelude::*;
    use serde_json::Value;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn decode(buf: &[u8]) -> serde_json::Map<String, Value> {
        match serde_json::from_slice::<Value>(buf).unwrap() {
            Value::Object(map) => map,
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn simple() {
        let msg = GelfMessage::builder("host", "short message")
            .timestamp(at(1584271169123))
            .level(Level::LOG_INFO)
            .field("foo", "bar")
            .build();
        let buf = GelfEncoder::default().encode(&msg).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            r#"{"version":"1.1","host":"host","short_message":"short message","timestamp":1584271169.123,"level":6,"_foo":"bar"}"#
        );
    }

    #[test]
    fn complete() {
        let msg = GelfMessage::builder("host", "short message")
            .full_message("full message")
            .timestamp(at(1584271169000))
            .level(Level::LOG_INFO)
            .field("foo", "bar")
            .build();
        let buf = GelfEncoder::default().encode(&msg).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            r#"{"version":"1.1","host":"host","short_message":"short message","full_message":"full message","timestamp":1584271169.000,"level":6,"_foo":"bar"}"#
        );
    }

    #[test]
    fn decodes_to_exactly_the_supplied_fields() {
        let msg = GelfMessage::builder("h1", "boom")
            .level(Level::LOG_ERR)
            .field("count", 3)
            .field("big", u64::MAX)
            .field("ratio", 0.25)
            .field("ok", true)
            .field("who", "me")
            .build();
        let obj = decode(&GelfEncoder::default().encode(&msg).unwrap());
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "_big",
                "_count",
                "_ok",
                "_ratio",
                "_who",
                "host",
                "level",
                "short_message",
                "timestamp",
                "version"
            ]
        );
        assert_eq!(obj["_count"], Value::from(3));
        assert_eq!(obj["_big"], Value::from(u64::MAX));
        assert_eq!(obj["_ratio"], Value::from(0.25));
        assert_eq!(obj["_ok"], Value::from("true"));
        assert_eq!(obj["_who"], Value::from("me"));
        assert_eq!(obj["level"], Value::from(3));
    }

    #[test]
    fn required_fields() {
        let enc = GelfEncoder::default();
        assert!(matches!(
            enc.encode(&GelfMessage::builder("", "boom").build()),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            enc.encode(&GelfMessage::builder("h1", "").build()),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn short_message_truncation() {
        let enc = GelfEncoder::default();
        let obj = decode(&enc.encode(&GelfMessage::builder("h", "a".repeat(300)).build()).unwrap());
        assert_eq!(obj["short_message"].as_str().unwrap().len(), 250);

        // Two bytes per character; an odd limit mustn't split one.
        let enc = GelfEncoder::builder().max_short_message(5).build();
        let obj = decode(&enc.encode(&GelfMessage::builder("h", "ééé").build()).unwrap());
        assert_eq!(obj["short_message"], Value::from("éé"));
    }

    #[test]
    fn short_message_never_goes_out_empty() {
        let enc = GelfEncoder::default();
        assert!(matches!(
            enc.encode(&GelfMessage::builder("h", "\r").build()),
            Err(Error::Validation { .. })
        ));
        let obj = decode(&enc.encode(&GelfMessage::builder("h", "\rboom\r").build()).unwrap());
        assert_eq!(obj["short_message"], Value::from("boom"));

        // The first character alone is over the limit
        let enc = GelfEncoder::builder().max_short_message(1).build();
        assert!(matches!(
            enc.encode(&GelfMessage::builder("h", "世界").build()),
            Err(Error::Validation { .. })
        ));
        let obj = decode(&enc.encode(&GelfMessage::builder("h", "ab").build()).unwrap());
        assert_eq!(obj["short_message"], Value::from("a"));
    }

    #[test]
    fn oversize_truncates_full_message_first() {
        let enc = GelfEncoder::builder().max_payload(200).build();
        let msg = GelfMessage::builder("h", "boom")
            .full_message("x".repeat(1000))
            .build();
        let buf = enc.encode(&msg).unwrap();
        assert!(buf.len() <= 200);
        let obj = decode(&buf);
        assert_eq!(obj["short_message"], Value::from("boom"));
        let full = obj["full_message"].as_str().unwrap();
        assert!(!full.is_empty() && full.len() < 1000);

        let enc = GelfEncoder::builder()
            .max_payload(200)
            .oversize_policy(OversizePolicy::Reject)
            .build();
        assert!(matches!(enc.encode(&msg), Err(Error::Encoding { .. })));
    }

    #[test]
    fn oversize_fields_cannot_be_truncated() {
        let enc = GelfEncoder::builder().max_payload(100).build();
        let msg = GelfMessage::builder("h", "boom")
            .field("blob", "y".repeat(500))
            .build();
        assert!(matches!(
            enc.encode(&msg),
            Err(Error::Encoding { limit: 100, .. })
        ));
    }

    #[test]
    fn invalid_field_names() {
        let msg = GelfMessage::builder("h", "boom")
            .field("id", 1)
            .field("bad name", 2)
            .field("good", 3)
            .build();
        let obj = decode(&GelfEncoder::default().encode(&msg).unwrap());
        assert!(obj.contains_key("_good"));
        assert!(!obj.contains_key("_id"));
        assert!(!obj.contains_key("_bad name"));

        let strict = GelfEncoder::builder()
            .invalid_field_policy(FieldPolicy::Reject)
            .build();
        assert!(matches!(strict.encode(&msg), Err(Error::Validation { .. })));
    }

    #[test]
    fn static_fields() {
        let enc = GelfEncoder::builder()
            .static_field_spec("app: billing")
            .unwrap()
            .static_field_spec("shard:7")
            .unwrap()
            .build();
        assert!(GelfEncoder::builder().static_field_spec("nocolon").is_err());
        assert!(GelfEncoder::builder().static_field_spec("id:1").is_err());

        // The static definition wins over the message's own.
        let msg = GelfMessage::builder("h", "boom").field("app", "other").build();
        let obj = decode(&enc.encode(&msg).unwrap());
        assert_eq!(obj["_app"], Value::from("billing"));
        assert_eq!(obj["_shard"], Value::from(7));

        let enc = GelfEncoder::builder()
            .static_field_specs(["env:prod", "bogus", "bad name:x", "env:dev", "ratio: 0.5"])
            .build();
        assert_eq!(enc.static_fields().len(), 2);
        assert_eq!(enc.static_fields()["env"], FieldValue::from("prod"));
        assert_eq!(enc.static_fields()["ratio"], FieldValue::Float(0.5));
    }

    #[test]
    fn numbers_as_string() {
        let enc = GelfEncoder::builder().numbers_as_string(true).build();
        let msg = GelfMessage::builder("h", "boom")
            .field("n", 42)
            .field("x", 1.5)
            .build();
        let obj = decode(&enc.encode(&msg).unwrap());
        assert_eq!(obj["_n"], Value::from("42"));
        assert_eq!(obj["_x"], Value::from("1.5"));
    }

    #[test]
    fn escaping() {
        let msg = GelfMessage::builder("h", "line one\r\nline \"two\"\t\u{1}")
            .field("nan", f64::NAN)
            .build();
        let buf = GelfEncoder::default().encode(&msg).unwrap();
        assert!(!buf.contains(&0u8));
        assert!(!buf.contains(&b'\r'));
        let obj = decode(&buf);
        assert_eq!(obj["short_message"], Value::from("line one\nline \"two\"\t\u{1}"));
        assert_eq!(obj["_nan"], Value::from("NaN"));
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        assert_eq!(truncate_utf8("世界", 4), "世");
        assert_eq!(truncate_utf8("世界", 2), "");
    }
}
