//! Record sources feeding the request producer.
//!
//! A source yields raw rows; validation into [`PdfRequest`]s happens in the
//! producer so that every source gets the same skipping rules.
//!
//! [`PdfRequest`]: crate::message::PdfRequest

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

/// Default location of the names file.
pub const DEFAULT_SOURCE_PATH: &str = "./names.csv";

/// Number of parsed rows buffered between the reader thread and the producer.
const ROW_BUFFER: usize = 256;

/// One raw row of the source, before validation.
pub type RawRecord = Vec<String>;

/// Stream of raw rows. An `Err` item means the source became unreadable and
/// is always the last item.
pub type RecordStream = BoxStream<'static, Result<RawRecord>>;

/// A source of input rows.
pub trait RecordSource: Send + Sync {
    /// Open the source. Fails with [`RpcError::Source`] when the source is
    /// absent or unreadable.
    fn open(&self) -> Result<RecordStream>;

    /// Human readable location, used in log messages.
    fn describe(&self) -> String;
}

/// Reads rows from a headerless comma separated file.
///
/// Fields are trimmed, empty lines are skipped and rows may have any number
/// of fields. Parsing runs on a blocking thread and streams rows through a
/// small channel, so arbitrarily large files are never held in memory.
#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    path: PathBuf,
}

impl CsvRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for CsvRecordSource {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_PATH)
    }
}

impl RecordSource for CsvRecordSource {
    fn open(&self) -> Result<RecordStream> {
        let file = File::open(&self.path)
            .map_err(|err| RpcError::Source(format!("{}: {}", self.path.display(), err)))?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_rows(reader, path, tx));

        Ok(ReceiverStream::new(rx).boxed())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn read_rows(
    mut reader: csv::Reader<File>,
    path: PathBuf,
    tx: mpsc::Sender<Result<RawRecord>>,
) {
    for row in reader.records() {
        let item = match row {
            Ok(record) => Ok(record.iter().map(str::to_string).collect()),
            Err(err) if err.is_io_error() => {
                // The rest of the file is unreachable: report it and end the
                // stream.
                warn!("Failed to read {}: {}", path.display(), err);
                let _ = tx.blocking_send(Err(RpcError::Source(format!(
                    "{}: {}",
                    path.display(),
                    err
                ))));
                return;
            }
            Err(err) => {
                debug!("Skipping undecodable row in {}: {}", path.display(), err);
                continue;
            }
        };
        if tx.blocking_send(item).is_err() {
            debug!("Record consumer went away, stop reading {}", path.display());
            return;
        }
    }
}

/// A fixed in-memory list of rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSource {
    rows: Vec<RawRecord>,
}

impl MemoryRecordSource {
    pub fn new<I, R, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RecordSource for MemoryRecordSource {
    fn open(&self) -> Result<RecordStream> {
        Ok(stream::iter(self.rows.clone().into_iter().map(Ok)).boxed())
    }

    fn describe(&self) -> String {
        format!("memory ({} rows)", self.rows.len())
    }
}
