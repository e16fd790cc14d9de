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
//! [gelf-tracing](crate) [`Layer`] implementation.
//!
//! [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
//!
//! The [`Layer`] maps each [`Event`] to a [`GelfMessage`] & hands it to a [`GelfClient`]:
//!
//! - the first non-blank line of the `message` field becomes the short message; the whole text
//!   becomes the full message when there's more to it than that (an explicit `full_message` field
//!   takes precedence)
//! - every other field becomes an additional field, with integers, floats & booleans preserved
//! - fields recorded on the spans enclosing the event are attached as well, innermost first; the
//!   event's own fields win any name collision
//! - the event's level is mapped to a syslog severity
//! - optionally, the event's target, the current thread's name, the level's name & the
//!   event's source location are attached as `_logger_name`, `_thread_name`, `_level_name`,
//!   `_file`, `_line` & `_module_path`
//!
//! Events whose target begins with `gelf_tracing` (i.e. this crate's own diagnostics) are never
//! forwarded.

use crate::{
    client::GelfClient,
    config::Config,
    error::{Error, Result},
    level::Level,
    message::{FieldValue, GelfMessage},
};

use backtrace::Backtrace;
use tracing::{
    field::Field,
    span::{Attributes, Id, Record},
    Event, Metadata,
};
use tracing_subscriber::{layer::Context, registry::LookupSpan};

// When the tracing-log feature is enabled, use NormalizeEvent to extract file/line metadata
// from events that originated from the `log` crate. This follows the same pattern used by
// tracing-subscriber's fmt layer.
// See: https://github.com/tokio-rs/tracing/blob/master/tracing-subscriber/src/fmt/fmt_layer.rs
#[cfg(feature = "tracing-log")]
use tracing_log::NormalizeEvent;

use std::{collections::BTreeMap, sync::Arc};

/// Events from targets with this prefix are never forwarded.
const OWN_TARGET: &str = "gelf_tracing";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      struct GelfEventVisitor                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct GelfEventVisitor {
    message: Option<String>,
    full_message: Option<String>,
    fields: BTreeMap<String, FieldValue>,
}

impl GelfEventVisitor {
    fn record(&mut self, field: &Field, value: FieldValue) {
        // Metadata smuggled in by tracing-log; we take it from the normalized metadata instead.
        #[cfg(feature = "tracing-log")]
        if field.name().starts_with("log.") {
            return;
        }
        self.fields
            .entry(field.name().to_string())
            .or_insert(value);
    }
}

impl tracing::field::Visit for GelfEventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "full_message" => self.full_message = Some(value.to_string()),
            _ => self.record(field, FieldValue::from(value)),
        }
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, FieldValue::Int(value))
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, FieldValue::UInt(value))
    }
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record(field, FieldValue::Float(value))
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, FieldValue::Bool(value))
    }
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // The tracing macros "pre-format" the `message` field so that `value` refers to a
        // `std::fmt::Arguments` instance, which prints without enclosing double-quotes.
        let text = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(text),
            "full_message" => self.full_message = Some(text),
            _ => self.record(field, FieldValue::String(text)),
        }
    }
}

/// Fields recorded on a span, kept in its extensions.
struct SpanFields(BTreeMap<String, FieldValue>);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          struct Layer                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn default_level_mapping(level: &tracing::Level) -> Level {
    Level::from(level)
}

/// A [`tracing-subscriber`]-compliant [`Layer`] implementation that will send [`Event`]s to a
/// GELF collector.
///
/// [`tracing-subscriber`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/index.html
/// [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
/// [`Event`]: https://docs.rs/tracing/0.1.35/tracing/struct.Event.html
pub struct Layer {
    client: Arc<GelfClient>,
    map_level: Box<dyn Fn(&tracing::Level) -> Level + Send + Sync>,
    logger_name: bool,
    thread_name: bool,
    level_name: bool,
    caller: bool,
    span_fields: bool,
}

impl Layer {
    /// Forward events to `client`; keep a clone of the [`Arc`] to get at its statistics.
    pub fn new(client: Arc<GelfClient>) -> Layer {
        Layer {
            client,
            map_level: Box::new(default_level_mapping),
            logger_name: true,
            thread_name: true,
            level_name: false,
            caller: false,
            span_fields: true,
        }
    }
    /// Attempt to construct a [`Layer`] with its own [`GelfClient`]
    pub fn try_new(config: &Config) -> Result<Layer> {
        Ok(Layer::new(Arc::new(GelfClient::new(config)?)))
    }
    /// Override the default mapping from tracing levels to syslog severities
    pub fn map_level<F>(mut self, map_level: F) -> Self
    where
        F: Fn(&tracing::Level) -> Level + Send + Sync + 'static,
    {
        self.map_level = Box::new(map_level);
        self
    }
    /// Attach the event's target as `_logger_name` (on by default)
    pub fn with_logger_name(mut self, logger_name: bool) -> Self {
        self.logger_name = logger_name;
        self
    }
    /// Attach the name of the emitting thread, if it has one, as `_thread_name` (on by default)
    pub fn with_thread_name(mut self, thread_name: bool) -> Self {
        self.thread_name = thread_name;
        self
    }
    /// Attach the severity's name as `_level_name`
    pub fn with_level_name(mut self, level_name: bool) -> Self {
        self.level_name = level_name;
        self
    }
    /// Attach `_file`, `_line` & `_module_path`
    pub fn with_caller(mut self, caller: bool) -> Self {
        self.caller = caller;
        self
    }
    /// Attach the fields of the spans enclosing each event (on by default)
    pub fn with_span_fields(mut self, span_fields: bool) -> Self {
        self.span_fields = span_fields;
        self
    }
    pub fn client(&self) -> &Arc<GelfClient> {
        &self.client
    }

    fn to_message(
        &self,
        event: &Event<'_>,
        meta: &Metadata<'_>,
        inherited: BTreeMap<String, FieldValue>,
    ) -> Result<GelfMessage> {
        let mut visitor = GelfEventVisitor::default();
        event.record(&mut visitor);
        let text = visitor.message.ok_or(Error::NoMessageField {
            name: event.metadata().name(),
            back: Backtrace::new(),
        })?;
        let short = text
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("");
        let full = match visitor.full_message {
            Some(full) => Some(full),
            None if short.len() < text.trim_end().len() => Some(text.clone()),
            None => None,
        };

        let level = (self.map_level)(meta.level());
        let mut fields = visitor.fields;
        for (name, value) in inherited {
            fields.entry(name).or_insert(value);
        }
        let mut add = |name: &str, value: FieldValue| {
            fields.entry(name.to_string()).or_insert(value);
        };
        if self.logger_name {
            add("logger_name", meta.target().into());
        }
        if self.thread_name {
            if let Some(name) = std::thread::current().name() {
                add("thread_name", name.into());
            }
        }
        if self.level_name {
            add("level_name", level.name().into());
        }
        if self.caller {
            if let Some(file) = meta.file() {
                add("file", file.into());
            }
            if let Some(line) = meta.line() {
                add("line", line.into());
            }
            if let Some(module_path) = meta.module_path() {
                add("module_path", module_path.into());
            }
        }

        let mut builder = self.client.message(short).level(level);
        if let Some(full) = full {
            builder = builder.full_message(full);
        }
        Ok(fields
            .into_iter()
            .fold(builder, |builder, (name, value)| builder.field(name, value))
            .build())
    }
}

/// This is the Big Tuna-- the [`Layer`] implementation.
///
/// [`Layer`]: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/layer/trait.Layer.html
impl<S> tracing_subscriber::layer::Layer<S> for Layer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if !self.span_fields {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut visitor = GelfEventVisitor::default();
            attrs.record(&mut visitor);
            span.extensions_mut().insert(SpanFields(visitor.fields));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if !self.span_fields {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut visitor = GelfEventVisitor::default();
            values.record(&mut visitor);
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<SpanFields>() {
                // Later values replace earlier ones
                Some(SpanFields(fields)) => fields.extend(visitor.fields),
                None => extensions.insert(SpanFields(visitor.fields)),
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        // When the tracing-log feature is enabled, use normalized_metadata() to get
        // file/line info for events that originated from the `log` crate.
        #[cfg(feature = "tracing-log")]
        let normalized_meta = event.normalized_metadata();
        #[cfg(feature = "tracing-log")]
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        #[cfg(not(feature = "tracing-log"))]
        let meta = event.metadata();

        if meta.target().starts_with(OWN_TARGET) {
            return;
        }

        let mut inherited = BTreeMap::new();
        if self.span_fields {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                        for (name, value) in fields {
                            inherited
                                .entry(name.clone())
                                .or_insert_with(|| value.clone());
                        }
                    }
                }
            }
        }

        self.to_message(event, meta, inherited)
            .and_then(|msg| self.client.submit(&msg))
            .map(|_| ())
            .unwrap_or_else(|err| {
                ::tracing::debug!("Event not forwarded to the GELF collector: {}", err);
            })
    }
}
