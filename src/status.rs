#![forbid(unsafe_code)]

//! Append-only status log shown at the bottom of the intake page.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info, warn};

pub trait StatusLog: Send + Sync {
    fn append(&self, line: &str) -> Result<()>;

    /// The last `limit` lines, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<String>>;
}

/// Plain text file, one line per event. Never truncated.
pub struct FileStatusLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStatusLog {
    pub fn open(path: &Path) -> Result<Self> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }
}

impl StatusLog for FileStatusLog {
    fn append(&self, line: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].iter().map(|line| line.to_string()).collect())
    }
}

#[derive(Default)]
pub struct MemoryStatusLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryStatusLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl StatusLog for MemoryStatusLog {
    fn append(&self, line: &str) -> Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<String>> {
        let lines = self.lines.lock();
        let start = lines.len().saturating_sub(limit);
        Ok(lines[start..].to_vec())
    }
}

/// Stamps messages with the local time of the configured zone and mirrors
/// them into tracing. Failing to write the log never fails the caller.
#[derive(Clone)]
pub struct StatusJournal {
    log: Arc<dyn StatusLog>,
    offset: FixedOffset,
}

impl StatusJournal {
    pub fn new(log: Arc<dyn StatusLog>, offset: FixedOffset) -> Self {
        Self { log, offset }
    }

    pub fn info(&self, message: &str) {
        info!("{message}");
        self.write(message);
    }

    pub fn error(&self, message: &str) {
        error!("{message}");
        self.write(message);
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<String>> {
        self.log.recent(limit)
    }

    fn write(&self, message: &str) {
        let line = stamp(Utc::now().with_timezone(&self.offset), message);
        if let Err(err) = self.log.append(&line) {
            warn!("could not append to status log: {err:#}");
        }
    }
}

fn stamp(now: DateTime<FixedOffset>, message: &str) -> String {
    let single_line: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S %:z"), single_line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn file_log_returns_most_recent_lines() -> Result<()> {
        let dir = tempdir()?;
        let log = FileStatusLog::open(&dir.path().join("upload_status.txt"))?;
        assert!(log.recent(10)?.is_empty());
        for index in 0..12 {
            log.append(&format!("line {index}"))?;
        }
        let recent = log.recent(10)?;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.first().unwrap(), "line 2");
        assert_eq!(recent.last().unwrap(), "line 11");
        Ok(())
    }

    #[test]
    fn file_log_keeps_existing_content() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("upload_status.txt");
        fs::write(&path, "older\n")?;
        let log = FileStatusLog::open(&path)?;
        log.append("newer")?;
        assert_eq!(log.recent(5)?, vec!["older", "newer"]);
        Ok(())
    }

    #[test]
    fn stamp_prefixes_zone_time_and_flattens_newlines() {
        let offset = FixedOffset::east_opt(19800).unwrap();
        let now = offset.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        assert_eq!(
            stamp(now, "Error downloading x:\nboom\n"),
            "[2024-05-01 06:00:00 +05:30] Error downloading x: boom"
        );
    }

    #[test]
    fn journal_writes_stamped_lines() {
        let log = Arc::new(MemoryStatusLog::default());
        let journal = StatusJournal::new(log.clone(), FixedOffset::east_opt(0).unwrap());
        journal.info("Downloaded a");
        journal.error("Error uploading b");
        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Downloaded a"));
        assert!(lines[1].ends_with("] Error uploading b"));
        assert_eq!(journal.recent(1).unwrap().len(), 1);
    }
}
