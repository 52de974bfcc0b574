#![forbid(unsafe_code)]

//! Alternate run mode: fetch and publish every pending URL one at a time,
//! giving up on a URL after repeated failures.

use anyhow::Result;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    fetcher::VideoFetcher, library::LocalLibrary, publisher::Publisher, queue::UrlQueue,
    status::StatusJournal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlState {
    Pending { failures: u32 },
    /// Fetched and published during the current epoch.
    Fetched,
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
pub struct ContinuousPolicy {
    pub publish_interval: Duration,
    pub retry_delay: Duration,
    pub max_failures: u32,
    pub reset_after: Duration,
    /// Whether abandoned URLs get another chance after a reset.
    pub reset_abandoned: bool,
}

/// What the loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pause {
    pub delay: Duration,
    pub reset: bool,
}

pub struct ContinuousProcessor {
    queue: Arc<dyn UrlQueue>,
    library: LocalLibrary,
    fetcher: Arc<dyn VideoFetcher>,
    publisher: Arc<dyn Publisher>,
    journal: StatusJournal,
    policy: ContinuousPolicy,
    states: HashMap<String, UrlState>,
}

impl ContinuousProcessor {
    pub fn new(
        queue: Arc<dyn UrlQueue>,
        library: LocalLibrary,
        fetcher: Arc<dyn VideoFetcher>,
        publisher: Arc<dyn Publisher>,
        journal: StatusJournal,
        policy: ContinuousPolicy,
    ) -> Self {
        Self {
            queue,
            library,
            fetcher,
            publisher,
            journal,
            policy,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, url: &str) -> Option<UrlState> {
        self.states.get(url).copied()
    }

    /// Processes the first URL still pending in this epoch.
    pub fn step(&mut self) -> Pause {
        let pending = match self.queue.pending() {
            Ok(pending) => pending,
            Err(err) => {
                self.journal
                    .error(&format!("Error reading pending URLs: {err:#}"));
                return self.pause(self.policy.retry_delay);
            }
        };

        let next = pending.into_iter().find_map(|url| {
            let state = *self
                .states
                .entry(url.clone())
                .or_insert(UrlState::Pending { failures: 0 });
            match state {
                UrlState::Pending { failures } => Some((url, failures)),
                UrlState::Fetched | UrlState::Abandoned => None,
            }
        });

        let Some((url, failures)) = next else {
            info!(
                "all known URLs processed, next pass in {}s",
                self.policy.reset_after.as_secs()
            );
            return Pause {
                delay: self.policy.reset_after,
                reset: true,
            };
        };

        match self.process(&url) {
            Ok(remote_id) => {
                self.states.insert(url.clone(), UrlState::Fetched);
                self.journal
                    .info(&format!("Uploaded {url} as video ID: {remote_id}"));
                self.pause(self.policy.publish_interval)
            }
            Err(err) => {
                let failures = failures + 1;
                if failures >= self.policy.max_failures {
                    self.states.insert(url.clone(), UrlState::Abandoned);
                    self.journal.error(&format!(
                        "Giving up on {url} after {failures} failures: {err:#}"
                    ));
                } else {
                    self.states
                        .insert(url.clone(), UrlState::Pending { failures });
                    self.journal.error(&format!(
                        "Error processing {url} (attempt {failures}): {err:#}"
                    ));
                }
                self.pause(self.policy.retry_delay)
            }
        }
    }

    /// Starts a new epoch. Fetched URLs become eligible again, abandoned
    /// ones only when the policy says so.
    pub fn reset(&mut self) {
        let reset_abandoned = self.policy.reset_abandoned;
        self.states
            .retain(|_, state| *state == UrlState::Abandoned && !reset_abandoned);
        info!("continuous mode state reset");
    }

    fn process(&self, url: &str) -> Result<String> {
        let video = self.fetcher.fetch(url, self.library.dir())?;
        self.journal
            .info(&format!("Downloaded {url} to {}", video.path.display()));
        let published = self.publisher.publish(&video)?;
        if let Err(err) = self.library.remove(&video) {
            self.journal
                .error(&format!("Error deleting {}: {err:#}", video.id));
        }
        Ok(published.remote_id)
    }

    fn pause(&self, delay: Duration) -> Pause {
        Pause {
            delay,
            reset: false,
        }
    }
}

pub async fn run_continuous(processor: ContinuousProcessor, shutdown: CancellationToken) {
    info!("continuous mode started");
    let mut processor = Some(processor);

    while let Some(mut current) = processor.take() {
        let stepped = tokio::task::spawn_blocking(move || {
            let pause = current.step();
            (current, pause)
        })
        .await;
        let (current, pause) = match stepped {
            Ok(result) => result,
            Err(err) => {
                error!("continuous step failed: {err}");
                break;
            }
        };
        processor = Some(current);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(pause.delay) => {}
        }
        if pause.reset
            && let Some(current) = processor.as_mut()
        {
            current.reset();
        }
    }

    info!("continuous mode stopped");
}
