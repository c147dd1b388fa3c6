//! Categorized logging backend.
//!
//! Backs the `log` facade with a timestamped, categorized writer:
//! every line carries a wall-clock timestamp and the subsystem
//! category (the `log` target — net, discovery, peers, proto, msg,
//! sys; anything else renders as "general").
//!
//! Output goes to stderr and, when configured, to a size-capped
//! rolling log file (one `.old` generation). The maximum level and
//! the debug-echo-to-console flag are runtime-settable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Metadata, Record};

use crate::config::SystemConfig;

static DEBUG_ECHO: AtomicBool = AtomicBool::new(false);
static FILE_SINK: Mutex<Option<FileSink>> = Mutex::new(None);
static LOGGER: LanmsgLogger = LanmsgLogger;

struct FileSink {
    file: File,
    path: String,
    written: u64,
    max_bytes: u64,
}

impl FileSink {
    fn open(path: &str, max_kb: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            file,
            path: path.to_string(),
            written,
            max_bytes: u64::from(max_kb) * 1024,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.written > self.max_bytes {
            self.rotate();
        }
        if self.file.write_all(line.as_bytes()).is_ok() {
            self.written += line.len() as u64;
        }
    }

    /// One rolling generation: current -> .old, then reopen.
    fn rotate(&mut self) {
        let old = format!("{}.old", self.path);
        let _ = std::fs::rename(&self.path, &old);
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            self.file = file;
            self.written = 0;
        }
    }
}

/// The `log::Log` implementation.
pub struct LanmsgLogger;

impl log::Log for LanmsgLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "{} {:5} [{}] {}\n",
            timestamp(),
            record.level(),
            category(record.target()),
            record.args()
        );

        // Debug lines stay out of the console unless echo is on.
        let to_console = record.level() < Level::Debug || DEBUG_ECHO.load(Ordering::Relaxed);
        if to_console {
            eprint!("{line}");
        }

        if let Ok(mut sink) = FILE_SINK.lock() {
            if let Some(sink) = sink.as_mut() {
                sink.write_line(&line);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = FILE_SINK.lock() {
            if let Some(sink) = sink.as_mut() {
                let _ = sink.file.flush();
            }
        }
    }
}

/// Install the logger. Call once from main before anything logs.
pub fn init(config: &SystemConfig) -> Result<(), log::SetLoggerError> {
    DEBUG_ECHO.store(config.debug_to_console, Ordering::Relaxed);

    if let Some(path) = &config.log_file {
        match FileSink::open(path, config.log_file_max_kb) {
            Ok(sink) => {
                if let Ok(mut slot) = FILE_SINK.lock() {
                    *slot = Some(sink);
                }
            }
            Err(e) => eprintln!("lanmsg: cannot open log file {path}: {e}"),
        }
    }

    log::set_logger(&LOGGER)?;
    log::set_max_level(config.max_log_level());
    Ok(())
}

/// Runtime toggle for echoing debug lines to the console.
pub fn set_debug_echo(on: bool) {
    DEBUG_ECHO.store(on, Ordering::Relaxed);
    log::info!(target: "sys", "debug console echo {}", if on { "on" } else { "off" });
}

/// Runtime maximum-level override.
pub fn set_max_level(level: LevelFilter) {
    log::set_max_level(level);
}

fn category(target: &str) -> &str {
    match target {
        "net" | "discovery" | "peers" | "proto" | "msg" | "sys" => target,
        _ => "general",
    }
}

/// Wall-clock HH:MM:SS.mmm (UTC). Hand-rolled from the epoch; good
/// enough for log correlation.
fn timestamp() -> heapless::String<16> {
    use core::fmt::Write;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let millis = now.subsec_millis();
    let (h, m, s) = (secs / 3600 % 24, secs / 60 % 60, secs % 60);

    let mut out = heapless::String::new();
    let _ = write!(out, "{h:02}:{m:02}:{s:02}.{millis:03}");
    out
}

// ── Tests ────────────────────────────────────────────────────
