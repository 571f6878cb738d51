// Date-rotated output files shared by all workers
pub mod capture_sink;
pub mod tabular_sink;

pub use capture_sink::CaptureSink;
pub use tabular_sink::{TabularSink, TABULAR_HEADER};

use parking_lot::Mutex;
use pcap_file::DataLink;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

use crate::packet::CapturedDatagram;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to create output file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("output I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("pcap writer error: {0}")]
    Pcap(#[from] pcap_file::PcapError),
    #[error("csv writer error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to format file name: {0}")]
    Format(#[from] time::error::Format),
    #[error("payload too short for an NTP header ({0} bytes)")]
    Truncated(usize),
    #[error("output manager already closed")]
    Closed,
}

/// Persistence format, fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Raw frames in a libpcap capture file
    Capture,
    /// One CSV row per decoded NTP header
    Tabular,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Capture => "pcap",
            OutputFormat::Tabular => "csv",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcap" | "capture" => Ok(OutputFormat::Capture),
            "csv" | "tabular" => Ok(OutputFormat::Tabular),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub format: OutputFormat,
    /// Region/site identifier written into every tabular row
    pub region: String,
    pub link_type: DataLink,
    pub snaplen: u32,
}

/// Source of wall-clock time for rotation decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// System time viewed through a UTC offset fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn utc() -> Self {
        Self { offset: UtcOffset::UTC }
    }

    /// Resolve the local offset once. Must run before worker threads exist,
    /// otherwise the platform may refuse to report it.
    pub fn local() -> Self {
        match UtcOffset::current_local_offset() {
            Ok(offset) => Self { offset },
            Err(e) => {
                warn!("Could not determine local UTC offset ({}), rotating on UTC dates", e);
                Self::utc()
            }
        }
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> OffsetDateTime {
        (**self).now()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// A format-specific writer behind the active output file.
pub trait RecordSink: Send {
    fn write_record(&mut self, datagram: &CapturedDatagram) -> Result<(), OutputError>;

    /// Flush and close. Called exactly once per sink.
    fn finish(self: Box<Self>) -> Result<(), OutputError>;
}

/// Outcome of a rotation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    Current,
    Rotated { path: PathBuf },
}

impl Rotation {
    pub fn rotated(&self) -> bool {
        matches!(self, Rotation::Rotated { .. })
    }
}

struct ActiveSink {
    sink: Box<dyn RecordSink>,
    path: PathBuf,
    date: Date,
    sequence: u32,
}

#[derive(Default)]
struct ManagerState {
    active: Option<ActiveSink>,
    files_created: u64,
    closed: bool,
}

/// Owns the single open output file and rotates it when the calendar date changes.
///
/// Rotation and writes share one mutex, so a record can never land in a file
/// that another worker is in the middle of closing.
pub struct OutputManager {
    config: OutputConfig,
    clock: Box<dyn Clock>,
    state: Mutex<ManagerState>,
}

impl OutputManager {
    pub fn new(config: OutputConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Make sure the active file matches today's date, rotating if needed.
    pub fn ensure_current(&self) -> Result<Rotation, OutputError> {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state)
    }

    /// Append one record, rotating first if the date changed.
    pub fn write(&self, datagram: &CapturedDatagram) -> Result<Rotation, OutputError> {
        let mut state = self.state.lock();
        let rotation = self.rotate_if_needed(&mut state)?;

        match state.active.as_mut() {
            Some(active) => active.sink.write_record(datagram)?,
            None => return Err(OutputError::Closed),
        }

        Ok(rotation)
    }

    /// Close the active file. Later writes fail with `OutputError::Closed`.
    pub fn close(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if let Some(active) = state.active.take() {
            info!("Closing output file: {}", active.path.display());
            active.sink.finish()?;
        }
        Ok(())
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().active.as_ref().map(|a| a.path.clone())
    }

    pub fn current_sequence(&self) -> Option<u32> {
        self.state.lock().active.as_ref().map(|a| a.sequence)
    }

    pub fn files_created(&self) -> u64 {
        self.state.lock().files_created
    }

    fn rotate_if_needed(&self, state: &mut ManagerState) -> Result<Rotation, OutputError> {
        if state.closed {
            return Err(OutputError::Closed);
        }

        let now = self.clock.now();
        let today = now.date();
        if state.active.as_ref().is_some_and(|a| a.date == today) {
            return Ok(Rotation::Current);
        }

        if let Some(previous) = state.active.take() {
            debug!("Date changed, closing {}", previous.path.display());
            if let Err(e) = previous.sink.finish() {
                warn!("Failed to close {}: {}", previous.path.display(), e);
            }
        }

        let (path, sequence) = self.next_file_name(now)?;
        let sink = self.open_sink(&path)?;

        state.files_created += 1;
        state.active = Some(ActiveSink {
            sink,
            path: path.clone(),
            date: today,
            sequence,
        });

        info!("Created new {} file: {}", self.config.format, path.display());
        Ok(Rotation::Rotated { path })
    }

    /// `<prefix>-<date>.<ext>`, with a time-of-day suffix when that name is taken.
    fn next_file_name(&self, now: OffsetDateTime) -> Result<(PathBuf, u32), OutputError> {
        let date = now.format(format_description!("[year]-[month]-[day]"))?;
        let ext = self.config.format.extension();
        let base = format!("{}-{}", self.config.file_prefix, date);

        let plain = self.config.directory.join(format!("{}.{}", base, ext));
        if !plain.exists() {
            return Ok((plain, 0));
        }

        let clock = now.format(format_description!("[hour][minute][second]"))?;
        let stamped = format!("{}_{}{:06}", base, clock, now.microsecond());
        let mut candidate = self.config.directory.join(format!("{}.{}", stamped, ext));
        let mut sequence = 1;
        while candidate.exists() {
            sequence += 1;
            candidate = self
                .config
                .directory
                .join(format!("{}-{}.{}", stamped, sequence, ext));
        }

        Ok((candidate, sequence))
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn RecordSink>, OutputError> {
        Ok(match self.config.format {
            OutputFormat::Capture => Box::new(CaptureSink::create(
                path,
                self.config.link_type,
                self.config.snaplen,
            )?),
            OutputFormat::Tabular => Box::new(TabularSink::create(path, &self.config.region)?),
        })
    }
}

impl Drop for OutputManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close output on drop: {}", e);
        }
    }
}
