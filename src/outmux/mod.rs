//! Child-process output multiplexing.
//!
//! Every line a unit's child process writes is tagged with the unit's
//! relative path, the stream it came from, and a timestamp. Units run
//! concurrently, so records from different units interleave; records from
//! one emit call stay contiguous. Three formats exist: `key-value` for
//! machine consumption, `pretty` for humans, and `bare` pass-through.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use console::style;

/// Output format selector, from `--log-format` / `TG_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    KeyValue,
    #[default]
    Pretty,
    /// No prefix at all; raw pass-through.
    Bare,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "key-value" => Some(Self::KeyValue),
            "pretty" => Some(Self::Pretty),
            "bare" => Some(Self::Bare),
            _ => None,
        }
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Thread-safe sink that labels and forwards child output.
pub struct OutMux {
    format: LogFormat,
    run_root: PathBuf,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl OutMux {
    pub fn new(format: LogFormat, run_root: &Path) -> Self {
        Self {
            format,
            run_root: run_root.to_path_buf(),
            sink: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Directs output somewhere other than stdout. Used by tests.
    pub fn with_sink(format: LogFormat, run_root: &Path, sink: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            run_root: run_root.to_path_buf(),
            sink: Mutex::new(sink),
        }
    }

    /// Writes one record. Embedded newlines are preserved: each physical
    /// line gets its own prefix, and the whole record is written under one
    /// lock so it is never torn apart by another unit's output.
    pub fn emit(&self, unit_dir: &Path, stream: StreamName, record: &str) {
        let unit = unit_dir
            .strip_prefix(&self.run_root)
            .unwrap_or(unit_dir)
            .display()
            .to_string();
        let unit = if unit.is_empty() { ".".to_string() } else { unit };

        let mut buffer = String::new();
        for line in record.split('\n') {
            match self.format {
                LogFormat::Bare => {
                    buffer.push_str(line);
                    buffer.push('\n');
                }
                LogFormat::KeyValue => {
                    let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                    buffer.push_str(&format!(
                        "unit={unit} stream={} time={ts} msg={line}\n",
                        stream.as_str()
                    ));
                }
                LogFormat::Pretty => {
                    let prefix = match stream {
                        StreamName::Stdout => style(format!("[{unit}]")).dim(),
                        StreamName::Stderr => style(format!("[{unit}]")).red(),
                    };
                    buffer.push_str(&format!("{prefix} {line}\n"));
                }
            }
        }

        let mut sink = self.sink.lock().unwrap();
        let _ = sink.write_all(buffer.as_bytes());
        let _ = sink.flush();
    }
}
