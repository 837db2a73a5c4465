//! The engine's event log, configured by the `BBDUP_LOG` environment variable.
//!
//! `BBDUP_LOG=[<path|->:]<level>` where `<level>` is a number or a name:
//!
//! | level | name      | logs                                                  |
//! |-------|-----------|-------------------------------------------------------|
//! | 0     | `off`     | nothing                                               |
//! | 1     | `error`   | errors                                                |
//! | 2     | `warning` | warnings                                              |
//! | 3     | `case`    | case events: promotion outcomes, regeneration         |
//! | 4     | `block`   | block events: duplication, dispatch, fault recovery   |
//!
//! Messages are only formatted if their level is enabled.

use parking_lot::Mutex;
use std::{
    env,
    fs::File,
    io::{self, Write},
};
use strum::{EnumCount, FromRepr};
use thiserror::Error;

pub(crate) mod stats;

/// How verbose should the engine's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    Disabled,
    Error,
    Warning,
    CaseEvent,
    BlockEvent,
}

impl Verbosity {
    fn from_name(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Disabled),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "case" => Some(Self::CaseEvent),
            "block" => Some(Self::BlockEvent),
            _ => s.parse::<u8>().ok().and_then(Self::from_repr),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Disabled => "bbdup",
            Self::Error => "bbdup-error",
            Self::Warning => "bbdup-warning",
            Self::CaseEvent => "bbdup-case-event",
            Self::BlockEvent => "bbdup-block-event",
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("BBDUP_LOG must be of the form `[<path|->:]<level>`, not '{0}'")]
    Format(String),
    #[error("unknown BBDUP_LOG level '{0}' (expected 0..={max} or a level name)", max = Verbosity::COUNT - 1)]
    Level(String),
    #[error("can't open log file '{path}': {source}")]
    File { path: String, source: io::Error },
}

enum Sink {
    Stderr,
    File(Mutex<File>),
}

pub(crate) struct Log {
    level: Verbosity,
    sink: Sink,
}

impl Log {
    pub(crate) fn from_env() -> Result<Self, LogError> {
        match env::var("BBDUP_LOG") {
            Ok(s) => Self::from_spec(&s),
            Err(_) => Ok(Self {
                level: Verbosity::Error,
                sink: Sink::Stderr,
            }),
        }
    }

    /// Parse a `[<path|->:]<level>` string. A log file is truncated when opened.
    fn from_spec(s: &str) -> Result<Self, LogError> {
        let (path, level) = match s.rsplit_once(':') {
            Some((path, _)) if path.is_empty() || path.contains(':') => {
                return Err(LogError::Format(s.to_owned()));
            }
            Some((path, level)) => (Some(path), level),
            None => (None, s),
        };
        let level = Verbosity::from_name(level).ok_or_else(|| LogError::Level(level.to_owned()))?;
        let sink = match path {
            None | Some("-") => Sink::Stderr,
            Some(p) => File::create(p)
                .map(|f| Sink::File(Mutex::new(f)))
                .map_err(|source| LogError::File {
                    path: p.to_owned(),
                    source,
                })?,
        };
        Ok(Self { level, sink })
    }

    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log the message `msg` builds, if `level` is enabled.
    pub(crate) fn log<F>(&self, level: Verbosity, msg: F)
    where
        F: FnOnce() -> String,
    {
        if self.enabled(level) {
            self.emit(&format!("{}: {}", level.prefix(), msg()));
        }
    }

    /// Log the message `msg` builds about the block `tag`, if `level` is enabled.
    pub(crate) fn log_block<F>(&self, level: Verbosity, tag: u64, msg: F)
    where
        F: FnOnce() -> String,
    {
        if self.enabled(level) {
            self.emit(&format!("{}: block {tag:#x}: {}", level.prefix(), msg()));
        }
    }

    fn emit(&self, line: &str) {
        match &self.sink {
            Sink::Stderr => eprintln!("{line}"),
            Sink::File(f) => {
                // Logging must never take the engine down.
                writeln!(f.lock(), "{line}").ok();
            }
        }
    }
}
