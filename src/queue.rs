#![forbid(unsafe_code)]

//! Ordered list of submitted URLs that still have to be fetched.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

const URL_COLUMN: &str = "url";

/// Storage for pending URLs. Implementations keep insertion order.
pub trait UrlQueue: Send + Sync {
    /// Every pending URL, front of the queue first.
    fn pending(&self) -> Result<Vec<String>>;

    /// Appends a URL to the back of the queue.
    fn push(&self, url: &str) -> Result<()>;

    /// Drops every entry equal to a fetched URL and keeps everything else,
    /// including URLs pushed after `pending` was read.
    fn remove_fetched(&self, fetched: &[String]) -> Result<()>;
}

fn without_fetched(urls: Vec<String>, fetched: &[String]) -> Vec<String> {
    urls.into_iter()
        .filter(|url| !fetched.contains(url))
        .collect()
}

/// CSV file with a single `url` column, matching the layout the intake form
/// has always written.
pub struct CsvUrlQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvUrlQueue {
    /// Opens the queue, writing the header row when the file does not exist
    /// yet.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            write_all(path, &[])?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;

        let mut urls = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading {}", self.path.display()))?;
            if let Some(url) = record.get(0).map(str::trim)
                && !url.is_empty()
            {
                urls.push(url.to_string());
            }
        }
        Ok(urls)
    }
}

fn write_all(path: &Path, urls: &[String]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        writer.write_record([URL_COLUMN])?;
        for url in urls {
            writer.write_record([url.as_str()])?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

impl UrlQueue for CsvUrlQueue {
    fn pending(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        self.read_all()
    }

    fn push(&self, url: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record([URL_COLUMN])?;
        }
        writer
            .write_record([url])
            .with_context(|| format!("appending to {}", self.path.display()))?;
        writer.flush()?;
        Ok(())
    }

    fn remove_fetched(&self, fetched: &[String]) -> Result<()> {
        if fetched.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();
        let remaining = without_fetched(self.read_all()?, fetched);
        write_all(&self.path, &remaining)
    }
}

/// Queue kept entirely in memory, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryUrlQueue {
    urls: Mutex<Vec<String>>,
}

impl MemoryUrlQueue {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: Mutex::new(urls.into_iter().map(Into::into).collect()),
        }
    }
}

impl UrlQueue for MemoryUrlQueue {
    fn pending(&self) -> Result<Vec<String>> {
        Ok(self.urls.lock().clone())
    }

    fn push(&self, url: &str) -> Result<()> {
        self.urls.lock().push(url.to_string());
        Ok(())
    }

    fn remove_fetched(&self, fetched: &[String]) -> Result<()> {
        let mut urls = self.urls.lock();
        let current = std::mem::take(&mut *urls);
        *urls = without_fetched(current, fetched);
        Ok(())
    }
}
