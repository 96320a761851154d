//! Tracing setup.
//!
//! Console output plus an optional log file. The file destination sits
//! behind a shared slot so it can be opened, replaced or closed while
//! the subscriber keeps running; writes that land while no file is open
//! are discarded.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogSettings;

type FileSlot = Arc<Mutex<Option<File>>>;

/// Handle for retargeting the file destination after init.
pub struct LogHandle {
    file: FileSlot,
}

impl LogHandle {
    /// Point file logging at `path` (created and appended to), or close
    /// the current file when `None`.
    pub fn set_destination(&self, path: Option<&Path>) -> io::Result<()> {
        let file = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(OpenOptions::new().create(true).append(true).open(path)?)
            }
            None => None,
        };
        *self.file.lock().unwrap_or_else(PoisonError::into_inner) = file;
        Ok(())
    }
}

/// Writer feeding the file layer through the shared slot.
#[derive(Clone)]
struct LogFile(FileSlot);

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level. Safe to call more than once; later calls keep the first
/// subscriber but still return a usable handle.
pub fn init(settings: &LogSettings) -> LogHandle {
    let slot: FileSlot = Arc::new(Mutex::new(None));
    let handle = LogHandle { file: slot.clone() };
    if let Some(path) = &settings.log_file {
        if let Err(e) = handle.set_destination(Some(path)) {
            eprintln!("cannot open log file {}: {e}", path.display());
        }
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let console = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_target(settings.show_target)
            .with_thread_ids(settings.show_thread_ids)
            .with_ansi(settings.ansi_colors)
    });
    let file_layer = fmt::layer()
        .with_target(settings.show_target)
        .with_thread_ids(settings.show_thread_ids)
        .with_ansi(false)
        .with_writer(LogFile(slot));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    handle
}
