//! telemetry.rs
//!
//! JSONL event stream for training and runtime control.
//!
//! # Environment variables
//!
//! - `QSIGNAL_TELEMETRY_MODE`: `"jsonl"` turns the stream on; anything else
//!   (or unset) leaves it off.
//! - `QSIGNAL_TELEMETRY_PATH`: file to write. Without it the stream stays off.
//! - `QSIGNAL_TELEMETRY_APPEND`: `"1"`/`"true"`/`"yes"` appends to an
//!   existing file instead of truncating it.
//!
//! # Events
//!
//! One JSON object per line, always starting with `schema_version` and
//! `event`, followed by the payload fields:
//!
//! - `episode_end`: an [`EpisodeSummary`], one per training episode
//! - `phase_change`: a [`PhaseChange`], one per agent-issued switch
//! - `session_end`: a [`SessionSummary`], one per runtime session
//!
//! The stream never fails its caller. A file that cannot be opened or
//! written turns the stream off for the rest of the process.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;

use crate::control::SessionSummary;
use crate::rl::{DecisionSource, EpisodeSummary};
use crate::types::{DiscretizedState, SimTime};

/// Current telemetry schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// A phase switch issued by an intersection agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseChange<'a> {
    pub tls_id: &'a str,
    pub from: usize,
    pub to: usize,
    pub sim_time: SimTime,
    /// Encoded state the decision was made on.
    pub state: DiscretizedState,
    pub source: Option<DecisionSource>,
}

/// Everything this crate writes to the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent<'a> {
    EpisodeEnd(&'a EpisodeSummary),
    PhaseChange(PhaseChange<'a>),
    SessionEnd(&'a SessionSummary),
}

impl TelemetryEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::EpisodeEnd(_) => "episode_end",
            TelemetryEvent::PhaseChange(_) => "phase_change",
            TelemetryEvent::SessionEnd(_) => "session_end",
        }
    }
}

/// One output line: the schema tag in front of the event.
#[derive(Serialize)]
struct Line<'e, 'a> {
    schema_version: u32,
    #[serde(flatten)]
    event: &'e TelemetryEvent<'a>,
}

/// Where the stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryConfig {
    /// None keeps the stream off.
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let jsonl = env::var("QSIGNAL_TELEMETRY_MODE")
            .map(|mode| mode.eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false);
        let path = if jsonl {
            env::var("QSIGNAL_TELEMETRY_PATH").ok().map(PathBuf::from)
        } else {
            None
        };
        let append = env::var("QSIGNAL_TELEMETRY_APPEND")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        TelemetryConfig { path, append }
    }

    /// JSONL output to an explicit path (truncating).
    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        TelemetryConfig {
            path: Some(path.into()),
            append: false,
        }
    }

    pub fn off() -> Self {
        TelemetryConfig::default()
    }
}

enum Output {
    Off,
    /// Opened on the first event so an unused sink never touches the disk.
    Pending { path: PathBuf, append: bool },
    Open(BufWriter<File>),
}

/// Typed JSONL event writer shared by the trainer and the control session.
pub struct TelemetrySink {
    output: Output,
    written: u64,
}

impl TelemetrySink {
    pub fn from_env() -> Self {
        Self::from_config(TelemetryConfig::from_env())
    }

    pub fn from_config(cfg: TelemetryConfig) -> Self {
        let output = match cfg.path {
            Some(path) => Output::Pending {
                path,
                append: cfg.append,
            },
            None => Output::Off,
        };
        TelemetrySink { output, written: 0 }
    }

    pub fn off() -> Self {
        TelemetrySink {
            output: Output::Off,
            written: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.output, Output::Off)
    }

    /// Events written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn episode_end(&mut self, episode: &EpisodeSummary) {
        self.emit(&TelemetryEvent::EpisodeEnd(episode));
    }

    pub fn phase_change(&mut self, change: PhaseChange<'_>) {
        self.emit(&TelemetryEvent::PhaseChange(change));
    }

    pub fn session_end(&mut self, summary: &SessionSummary) {
        self.emit(&TelemetryEvent::SessionEnd(summary));
    }

    pub fn emit(&mut self, event: &TelemetryEvent<'_>) {
        let writer = match self.writer() {
            Some(w) => w,
            None => return,
        };
        let line = Line {
            schema_version: SCHEMA_VERSION,
            event,
        };
        let result = serde_json::to_writer(&mut *writer, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        match result {
            Ok(()) => self.written += 1,
            Err(err) => {
                eprintln!(
                    "[telemetry] WARN: {} write failed: {}; telemetry disabled",
                    event.name(),
                    err
                );
                self.output = Output::Off;
            }
        }
    }

    fn writer(&mut self) -> Option<&mut BufWriter<File>> {
        if let Output::Pending { path, append } = &self.output {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let opened = OpenOptions::new()
                .create(true)
                .write(true)
                .append(*append)
                .truncate(!*append)
                .open(path);
            self.output = match opened {
                Ok(file) => Output::Open(BufWriter::new(file)),
                Err(err) => {
                    eprintln!(
                        "[telemetry] WARN: cannot open {}: {}; telemetry disabled",
                        path.display(),
                        err
                    );
                    Output::Off
                }
            };
        }
        match &mut self.output {
            Output::Open(writer) => Some(writer),
            _ => None,
        }
    }

    pub fn flush(&mut self) {
        if let Output::Open(writer) = &mut self.output {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}
