//! A minimal file-backed `log::Log` implementation.
//!
//! None of the usual sink crates (`env_logger`, `fern`, `simplelog`) were
//! pulled in elsewhere, so this installs a small sink of its own: one
//! timestamped line per record, appended to `peer_<id>/log_peer_<id>.log`.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::OffsetDateTime;

pub struct FileLogger {
    file: Mutex<File>,
}

impl FileLogger {
    /// Opens (creating if necessary) `log_peer_<id>.log` under `dir` and
    /// installs it as the global logger.
    pub fn init(dir: impl AsRef<Path>, peer_id: u32) -> std::io::Result<()> {
        let path = dir.as_ref().join(format!("log_peer_{}.log", peer_id));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let logger = Self {
            file: Mutex::new(file),
        };
        log::set_max_level(LevelFilter::Trace);
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl Log for FileLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.level() > Level::Trace && !self.enabled(record.metadata())
        {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let line = format!(
            "{} : {}\n",
            now.format(
                &time::format_description::well_known::Rfc3339
            )
            .unwrap_or_else(|_| now.to_string()),
            record.args()
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}
