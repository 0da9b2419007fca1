use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::Error;

/// Where the received packets are persisted.
#[derive(Default)]
pub enum CaptureFile {
    /// anonymous temporary file, a new one per run
    #[default]
    TempFile,
    /// file at this path, created (or truncated!) on each start
    Path(PathBuf),
    /// caller provided writer. Can be used for one run only as it is closed on stop.
    /// A start that fails before receiving keeps it for the next start.
    Writer(Box<dyn Write + Send>),
}

impl std::fmt::Debug for CaptureFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureFile::TempFile => write!(f, "TempFile"),
            CaptureFile::Path(p) => write!(f, "Path({})", p.display()),
            CaptureFile::Writer(_) => write!(f, "Writer"),
        }
    }
}

/// Open the sink for a new run.
///
/// A [CaptureFile::Writer] is moved out of the slot into the sink, so opening
/// it a 2nd time fails with [Error::SinkClosed].
pub(crate) fn open_capture_sink(slot: &mut Option<CaptureFile>) -> Result<CaptureSink, Error> {
    let writer: Box<dyn Write + Send> = match slot.take() {
        None => return Err(Error::SinkClosed),
        Some(CaptureFile::Writer(w)) => w,
        Some(other) => {
            let opened: Result<Box<dyn Write + Send>, Error> = match &other {
                CaptureFile::Path(path) => std::fs::File::create(path)
                    .map(|f| Box::new(f) as Box<dyn Write + Send>)
                    .map_err(Error::SinkOpen),
                _ => tempfile::tempfile()
                    .map(|f| Box::new(f) as Box<dyn Write + Send>)
                    .map_err(Error::SinkOpen),
            };
            // temp files and paths can be opened again on the next start
            *slot = Some(other);
            opened?
        }
    };
    Ok(CaptureSink {
        writer: Some(BufWriter::new(writer)),
    })
}

/// The opened capture sink of a run.
pub struct CaptureSink {
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
}

impl CaptureSink {
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.writer.as_mut() {
            Some(w) => w.write_all(data).map_err(Error::SinkWrite),
            None => Err(Error::SinkClosed),
        }
    }

    /// Flush and close. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.writer.take() {
            Some(mut w) => w.flush().map_err(Error::SinkWrite),
            None => Ok(()),
        }
    }

    /// Take the writer back out of an unused sink, e.g. after a failed start.
    ///
    /// Anything still buffered is dropped. None if the sink was closed already.
    pub(crate) fn into_inner(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take().map(|w| w.into_parts().0)
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
