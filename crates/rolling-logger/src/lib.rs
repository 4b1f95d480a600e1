//! Rolling File Logger
//!
//! Installs a global tracing subscriber writing to `<dir>/<app>.log`. The
//! file is archived once it grows past a size limit and only the newest
//! archives are kept. The most recent lines also stay in a ring buffer so a
//! host panel can show them without reading the file back.
//!
//! Records sent through the `log` facade (the organizer engine logs that
//! way) end up in the same sink.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::Local;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 5;
pub const DEFAULT_BUFFER_LINES: usize = 1000;

static LOGGER: OnceLock<RollingWriter> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("A global logger is already installed")]
    AlreadyInitialized,
    #[error("Logger is not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Size at which the current file is archived
    pub max_bytes: u64,
    /// Archives kept next to the current file
    pub max_files: usize,
    /// Lines kept in memory
    pub buffer_lines: usize,
    pub level: Level,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
            buffer_lines: DEFAULT_BUFFER_LINES,
            level: Level::INFO,
        }
    }
}

struct Sink {
    dir: PathBuf,
    app_name: String,
    config: LoggerConfig,
    file: File,
    written: u64,
    rotations: u32,
    recent: VecDeque<String>,
    /// Bytes after the last newline
    partial: String,
}

impl Sink {
    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.app_name))
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.written > 0 && self.written + buf.len() as u64 > self.config.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        self.remember(buf);
        Ok(())
    }

    fn remember(&mut self, buf: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(buf));
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            self.recent.push_back(line.trim_end().to_string());
            if self.recent.len() > self.config.buffer_lines {
                self.recent.pop_front();
            }
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.rotations += 1;
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let archive = self
            .dir
            .join(format!("{}-{}-{:04}.log", self.app_name, stamp, self.rotations));
        fs::rename(self.current_path(), archive)?;

        self.file = open_append(&self.current_path())?;
        self.written = 0;
        self.prune()
    }

    /// Delete the oldest archives beyond `max_files`
    fn prune(&self) -> io::Result<()> {
        let mut archives = archives_of(&self.dir, &self.app_name)?;
        archives.sort();
        let excess = archives.len().saturating_sub(self.config.max_files);
        for old in archives.into_iter().take(excess) {
            fs::remove_file(old)?;
        }
        Ok(())
    }
}

/// Cloneable handle to the rotating file and its ring buffer
#[derive(Clone)]
pub struct RollingWriter {
    sink: Arc<Mutex<Sink>>,
}

impl RollingWriter {
    pub fn open(dir: impl AsRef<Path>, app_name: &str, config: LoggerConfig) -> Result<Self, LoggerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| LoggerError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("{}.log", app_name));
        let file = open_append(&path).map_err(|source| LoggerError::Io {
            path: path.clone(),
            source,
        })?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            sink: Arc::new(Mutex::new(Sink {
                dir,
                app_name: app_name.to_string(),
                config,
                file,
                written,
                rotations: 0,
                recent: VecDeque::new(),
                partial: String::new(),
            })),
        })
    }

    /// Up to `n` of the newest lines, oldest first
    pub fn recent_lines(&self, n: usize) -> Vec<String> {
        match self.lock() {
            Ok(sink) => {
                let skip = sink.recent.len().saturating_sub(n);
                sink.recent.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.lock().ok().map(|sink| sink.current_path())
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Sink>> {
        self.sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink poisoned"))
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global logger with default limits
pub fn init_logger(dir: impl AsRef<Path>, app_name: &str) -> Result<(), LoggerError> {
    init_logger_with(dir, app_name, LoggerConfig::default())
}

pub fn init_logger_with(dir: impl AsRef<Path>, app_name: &str, config: LoggerConfig) -> Result<(), LoggerError> {
    if LOGGER.get().is_some() {
        return Err(LoggerError::AlreadyInitialized);
    }
    let level = config.level;
    let writer = RollingWriter::open(dir, app_name, config)?;

    // Also installs the `log` bridge
    tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .with_max_level(level)
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)?;

    LOGGER.set(writer).map_err(|_| LoggerError::AlreadyInitialized)?;
    log::info!("Logging to {}", app_name);
    Ok(())
}

pub fn info(message: &str) -> Result<(), LoggerError> {
    installed()?;
    tracing::info!("{}", message);
    Ok(())
}

pub fn error(message: &str) -> Result<(), LoggerError> {
    installed()?;
    tracing::error!("{}", message);
    Ok(())
}

/// Newest lines of the global logger, oldest first
pub fn recent_lines(n: usize) -> Vec<String> {
    LOGGER.get().map(|w| w.recent_lines(n)).unwrap_or_default()
}

fn installed() -> Result<&'static RollingWriter, LoggerError> {
    LOGGER.get().ok_or(LoggerError::NotInitialized)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn archives_of(dir: &Path, app_name: &str) -> io::Result<Vec<PathBuf>> {
    let prefix = format!("{}-", app_name);
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_archive = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(".log"));
        if is_archive {
            found.push(path);
        }
    }
    Ok(found)
}
