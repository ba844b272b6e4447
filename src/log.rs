//! Run narration.
//!
//! The engine narrates what a run is doing to standard error. How much it
//! says is a [`Verbosity`], scaled to the engine's own lifecycle rather
//! than generic severity levels:
//!
//! - `Failures`: processor faults, destroyed outputs, backend errors.
//! - `Runs`: the default. Task skipped / started / finished lines.
//! - `Scheduling`: readiness waits, worker launches, stream closes.
//! - `Traffic`: per-value stream activity. Very noisy.
//!
//! `Silent` turns everything off. The verbosity can be set in code with
//! [`set_verbosity`] or through the `WEIR_LOG` environment variable (e.g.
//! `WEIR_LOG=scheduling`), applied by [`init`]. A log file can be attached
//! with [`log_to_file`]; it receives the same lines as standard error.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock, RwLock};

use crate::error::Result;

static VERBOSITY: RwLock<Verbosity> = RwLock::new(Verbosity::Runs);
static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// How much of a run gets narrated.
///
/// Each tier includes everything below it: `Scheduling` also shows run
/// lifecycle and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Say nothing.
    Silent,
    /// Only faults: failed tasks, destroyed outputs, backend errors.
    Failures,
    /// Run lifecycle: tasks skipped, started, finished.
    Runs,
    /// Scheduling detail: readiness waits, worker launches, closes.
    Scheduling,
    /// Per-value stream traffic.
    Traffic,
}

impl Verbosity {
    /// Short tag stamped on each narrated line.
    fn tag(&self) -> &'static str {
        match self {
            Verbosity::Silent => "-",
            Verbosity::Failures => "fail",
            Verbosity::Runs => "run",
            Verbosity::Scheduling => "sched",
            Verbosity::Traffic => "stream",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verbosity::Silent => "silent",
            Verbosity::Failures => "failures",
            Verbosity::Runs => "runs",
            Verbosity::Scheduling => "scheduling",
            Verbosity::Traffic => "traffic",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "silent" => Ok(Verbosity::Silent),
            "failures" => Ok(Verbosity::Failures),
            "runs" => Ok(Verbosity::Runs),
            "scheduling" => Ok(Verbosity::Scheduling),
            "traffic" => Ok(Verbosity::Traffic),
            other => Err(format!("unknown verbosity '{}'", other)),
        }
    }
}

/// Apply the `WEIR_LOG` environment variable, if set and valid.
pub fn init() {
    if let Ok(raw) = std::env::var("WEIR_LOG") {
        if let Ok(verbosity) = raw.parse() {
            set_verbosity(verbosity);
        }
    }
}

/// Set how much of a run gets narrated.
pub fn set_verbosity(verbosity: Verbosity) {
    if let Ok(mut current) = VERBOSITY.write() {
        *current = verbosity;
    }
}

/// The current narration verbosity.
pub fn verbosity() -> Verbosity {
    VERBOSITY.read().map(|v| *v).unwrap_or(Verbosity::Runs)
}

/// Attach a log file that receives the same lines as standard error.
///
/// Can be attached once per process; later calls are ignored.
pub fn log_to_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let _ = LOG_FILE.set(Mutex::new(file));
    Ok(())
}

/// Narrate one line at the given tier. Filtered against the current
/// verbosity; prefer the `wlog!` macro family over calling this directly.
pub fn emit(tier: Verbosity, args: fmt::Arguments<'_>) {
    if tier == Verbosity::Silent || tier > verbosity() {
        return;
    }

    let line = format!(
        "{} [{}] {}",
        chrono::Utc::now().format("%H:%M:%S%.3f"),
        tier.tag(),
        args
    );

    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", line);

    if let Some(file) = LOG_FILE.get() {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Narrate run lifecycle: tasks skipped, started, finished.
#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Verbosity::Runs, format_args!($($arg)*))
    };
}

/// Narrate a fault: failed task, destroyed output, backend error.
#[macro_export]
macro_rules! wlog_fail {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Verbosity::Failures, format_args!($($arg)*))
    };
}

/// Narrate scheduling detail: readiness waits, worker launches, closes.
#[macro_export]
macro_rules! wlog_sched {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Verbosity::Scheduling, format_args!($($arg)*))
    };
}

/// Narrate per-value stream traffic.
#[macro_export]
macro_rules! wlog_stream {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::Verbosity::Traffic, format_args!($($arg)*))
    };
}
