#![forbid(unsafe_code)]

//! Keeps the local stock topped up from the front of the pending list.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::{
    fetcher::VideoFetcher, library::LocalLibrary, queue::UrlQueue, status::StatusJournal,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplenishReport {
    pub needed: usize,
    pub attempted: usize,
    pub fetched: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Replenisher {
    queue: Arc<dyn UrlQueue>,
    library: LocalLibrary,
    fetcher: Arc<dyn VideoFetcher>,
    journal: StatusJournal,
    target: usize,
}

impl Replenisher {
    pub fn new(
        queue: Arc<dyn UrlQueue>,
        library: LocalLibrary,
        fetcher: Arc<dyn VideoFetcher>,
        journal: StatusJournal,
        target: usize,
    ) -> Self {
        Self {
            queue,
            library,
            fetcher,
            journal,
            target,
        }
    }

    pub fn library(&self) -> &LocalLibrary {
        &self.library
    }

    pub fn journal(&self) -> &StatusJournal {
        &self.journal
    }

    /// Fetches up to `target - local count` URLs in list order. Only URLs
    /// that were fetched leave the list; failures stay at the front.
    pub fn run(&self) -> Result<ReplenishReport> {
        let have = self.library.count()?;
        let needed = self.target.saturating_sub(have);
        if needed == 0 {
            debug!("local stock is full ({have}/{})", self.target);
            return Ok(ReplenishReport::default());
        }

        let pending = self.queue.pending()?;
        if pending.is_empty() {
            self.journal.info("No URLs available to download");
            return Ok(ReplenishReport {
                needed,
                ..ReplenishReport::default()
            });
        }

        let batch: Vec<String> = pending.into_iter().take(needed).collect();
        let mut fetched = Vec::with_capacity(batch.len());
        for url in &batch {
            match self.fetcher.fetch(url, self.library.dir()) {
                Ok(video) => {
                    self.journal
                        .info(&format!("Downloaded {url} to {}", video.path.display()));
                    fetched.push(url.clone());
                }
                Err(err) => self
                    .journal
                    .error(&format!("Error downloading {url}: {err:#}")),
            }
        }

        self.queue.remove_fetched(&fetched)?;

        Ok(ReplenishReport {
            needed,
            attempted: batch.len(),
            fetched: fetched.len(),
            failed: batch.len() - fetched.len(),
        })
    }

    /// `run`, with store failures written to the status log instead of
    /// returned.
    pub fn run_logged(&self) -> Option<ReplenishReport> {
        match self.run() {
            Ok(report) => Some(report),
            Err(err) => {
                self.journal
                    .error(&format!("Error replenishing videos: {err:#}"));
                None
            }
        }
    }
}
