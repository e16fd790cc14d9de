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
//! GELF severity levels.
//!
//! GELF borrows its `level` field from syslog: [`Level`] replicates the severity names used in
//! `<syslog.h>`. The syslog facility was deprecated in GELF 1.1 and has no counterpart here.

use crate::error::{Error, Result};

type StdResult<T, E> = std::result::Result<T, E>;

/// The eight severities defined by RFCs [5424] & [3164]. The enumeration values duplicate the
/// constants documented in the `syslog()` manual [page] & defined in `<syslog.h>`, and are what
/// is written to the wire.
///
/// [5424]: https://datatracker.ietf.org/doc/html/rfc5424
/// [3164]: https://datatracker.ietf.org/doc/html/rfc3164
/// [page]: https://man7.org/linux/man-pages/man3/syslog.3.html
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// system is unusable
    LOG_EMERG,
    /// action must be take immediately
    LOG_ALERT,
    /// critical conditions
    LOG_CRIT,
    /// error conditions
    LOG_ERR,
    /// warning conditions
    LOG_WARNING,
    /// normal, but significant condition
    LOG_NOTICE,
    /// informational message
    LOG_INFO,
    /// debug-level message
    LOG_DEBUG,
}

impl Level {
    /// The conventional lower-case name, as written to the `_level_name` field
    pub fn name(&self) -> &'static str {
        match self {
            Level::LOG_EMERG => "emergency",
            Level::LOG_ALERT => "alert",
            Level::LOG_CRIT => "critical",
            Level::LOG_ERR => "error",
            Level::LOG_WARNING => "warning",
            Level::LOG_NOTICE => "notice",
            Level::LOG_INFO => "info",
            Level::LOG_DEBUG => "debug",
        }
    }
}

impl std::default::Default for Level {
    fn default() -> Self {
        Level::LOG_INFO
    }
}

impl std::convert::From<Level> for u8 {
    fn from(level: Level) -> u8 {
        level as u8
    }
}

impl std::convert::TryFrom<u8> for Level {
    type Error = Error;
    fn try_from(x: u8) -> Result<Self> {
        Ok(match x {
            0 => Level::LOG_EMERG,
            1 => Level::LOG_ALERT,
            2 => Level::LOG_CRIT,
            3 => Level::LOG_ERR,
            4 => Level::LOG_WARNING,
            5 => Level::LOG_NOTICE,
            6 => Level::LOG_INFO,
            7 => Level::LOG_DEBUG,
            _ => {
                return Err(Error::validation(format!(
                    "{} is not a syslog severity (0-7)",
                    x
                )))
            }
        })
    }
}

impl std::convert::From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Level {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Level::LOG_DEBUG,
            tracing::Level::INFO => Level::LOG_INFO,
            tracing::Level::WARN => Level::LOG_WARNING,
            tracing::Level::ERROR => Level::LOG_ERR,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Level::LOG_EMERG => "LOG_EMERG",
                Level::LOG_ALERT => "LOG_ALERT",
                Level::LOG_CRIT => "LOG_CRIT",
                Level::LOG_ERR => "LOG_ERR",
                Level::LOG_WARNING => "LOG_WARNING",
                Level::LOG_NOTICE => "LOG_NOTICE",
                Level::LOG_INFO => "LOG_INFO",
                Level::LOG_DEBUG => "LOG_DEBUG",
            }
        )
    }
}
