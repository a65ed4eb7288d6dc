//! Shared logging setup for Clipferry binaries.
//!
//! Two layers: a size-capped rolling file under the app home, and stderr.
//! `CLIPFERRY_LOG` overrides the default filter for both.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "clipferry=info,clipferry_queue=info,clipferry_extractor=info,clipferry_guards=info,clipferry_store=info";
const MAX_LOG_FILES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Initialize tracing for a binary. `verbose` widens the stderr filter to
/// match the file filter; otherwise stderr only shows warnings.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = clipferry_protocol::paths::default_logs_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_writer =
        RollingWriter::open(log_dir, app_name).context("Failed to open rolling log file")?;

    let file_filter = EnvFilter::try_from_env("CLIPFERRY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if verbose {
        EnvFilter::try_from_env("CLIPFERRY_LOG")
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Size-capped log file with numbered rotation:
/// `<name>.log` -> `<name>.log.1` -> ... -> dropped.
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<RollingState>>,
}

struct RollingState {
    dir: PathBuf,
    base: String,
    file: File,
    written: u64,
}

impl RollingWriter {
    pub fn open(dir: PathBuf, base: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let base = sanitize(base);
        let (file, written) = open_current(&dir, &base)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingState { dir, base, file, written })),
        })
    }
}

fn open_current(dir: &PathBuf, base: &str) -> io::Result<(File, u64)> {
    let path = dir.join(format!("{}.log", base));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let written = file.metadata()?.len();
    Ok((file, written))
}

impl RollingState {
    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.dir.join(format!("{}.log.{}", self.base, MAX_LOG_FILES - 1));
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = self.dir.join(format!("{}.log.{}", self.base, idx));
            if src.exists() {
                fs::rename(&src, self.dir.join(format!("{}.log.{}", self.base, idx + 1)))?;
            }
        }
        let current = self.dir.join(format!("{}.log", self.base));
        if current.exists() {
            fs::rename(&current, self.dir.join(format!("{}.log.1", self.base)))?;
        }

        let (file, written) = open_current(&self.dir, &self.base)?;
        self.file = file;
        self.written = written;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

pub struct RollingWriterGuard {
    inner: Arc<Mutex<RollingState>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RollingWriterGuard { inner: Arc::clone(&self.inner) }
    }
}

impl Write for RollingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file.flush()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
