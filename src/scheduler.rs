#![forbid(unsafe_code)]

//! Publishes one video per daily slot and refills the stock afterwards.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{publisher::Publisher, replenish::Replenisher};

/// The first slot strictly after `now`, in `now`'s offset. Once every slot
/// has passed the answer is tomorrow's earliest one.
pub fn next_publish_time(
    now: DateTime<FixedOffset>,
    slots: &[NaiveTime],
) -> DateTime<FixedOffset> {
    let offset = *now.offset();
    let today = now.date_naive();
    let mut sorted = slots.to_vec();
    sorted.sort();

    if let Some(next) = sorted
        .iter()
        .filter_map(|slot| at(offset, today, *slot))
        .find(|candidate| *candidate > now)
    {
        return next;
    }

    today
        .checked_add_days(Days::new(1))
        .zip(sorted.first())
        .and_then(|(tomorrow, slot)| at(offset, tomorrow, *slot))
        // no slots configured
        .unwrap_or_else(|| now + TimeDelta::days(1))
}

fn at(offset: FixedOffset, date: NaiveDate, time: NaiveTime) -> Option<DateTime<FixedOffset>> {
    offset.from_local_datetime(&date.and_time(time)).single()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { id: String, remote_id: String },
    /// Uploaded, but the local file could not be deleted and would be
    /// published again at the next slot.
    PublishedNotRemoved { id: String, remote_id: String },
    Failed { id: String },
    NothingToPublish,
}

pub struct Scheduler {
    replenisher: Replenisher,
    publisher: Arc<dyn Publisher>,
    slots: Vec<NaiveTime>,
    offset: FixedOffset,
}

impl Scheduler {
    pub fn new(
        replenisher: Replenisher,
        publisher: Arc<dyn Publisher>,
        slots: Vec<NaiveTime>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            replenisher,
            publisher,
            slots,
            offset,
        }
    }

    pub fn next_wake(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        next_publish_time(now.with_timezone(&self.offset), &self.slots)
    }

    /// Publishes the oldest local video. The file is deleted and the stock
    /// replenished only after a successful upload.
    pub fn publish_oldest(&self) -> PublishOutcome {
        let library = self.replenisher.library();
        let journal = self.replenisher.journal();

        let video = match library.oldest() {
            Ok(Some(video)) => video,
            Ok(None) => {
                journal.info("No videos available to upload");
                self.replenisher.run_logged();
                return PublishOutcome::NothingToPublish;
            }
            Err(err) => {
                journal.error(&format!("Error listing local videos: {err:#}"));
                return PublishOutcome::NothingToPublish;
            }
        };

        match self.publisher.publish(&video) {
            Ok(published) => {
                journal.info(&format!(
                    "Uploaded {} as video ID: {}",
                    video.id, published.remote_id
                ));
                if let Err(err) = library.remove(&video) {
                    journal.error(&format!(
                        "Error deleting {} after upload, remove it by hand or it will be uploaded again: {err:#}",
                        video.path.display()
                    ));
                    return PublishOutcome::PublishedNotRemoved {
                        id: video.id,
                        remote_id: published.remote_id,
                    };
                }
                self.replenisher.run_logged();
                PublishOutcome::Published {
                    id: video.id,
                    remote_id: published.remote_id,
                }
            }
            Err(err) => {
                journal.error(&format!("Error uploading {}: {err:#}", video.id));
                PublishOutcome::Failed { id: video.id }
            }
        }
    }
}

/// Runs until `shutdown` fires: replenish once, then sleep to each slot and
/// publish.
pub async fn run_scheduled(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    info!(
        "scheduled mode: publishing at {} ({})",
        scheduler
            .slots
            .iter()
            .map(|slot| slot.format("%H:%M").to_string())
            .collect::<Vec<_>>()
            .join(", "),
        scheduler.offset
    );

    let initial = scheduler.clone();
    if let Err(err) =
        tokio::task::spawn_blocking(move || initial.replenisher.run_logged()).await
    {
        error!("initial replenishment task failed: {err}");
    }

    loop {
        let now = Utc::now();
        let next = scheduler.next_wake(now);
        let wait = (next.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        info!("next publish at {}", next.format("%Y-%m-%d %H:%M:%S %:z"));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let worker = scheduler.clone();
        match tokio::task::spawn_blocking(move || worker.publish_oldest()).await {
            Ok(outcome) => info!("publish slot finished: {outcome:?}"),
            Err(err) => error!("publish task failed: {err}"),
        }
    }

    info!("scheduler stopped");
}
