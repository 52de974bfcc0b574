//! Fakes shared by the loop tests.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::{fs, path::Path, sync::Arc};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::{
    fetcher::VideoFetcher,
    library::{LocalVideo, VIDEO_EXTENSION},
    publisher::{PublishedVideo, Publisher},
};

/// Writes `<last path segment>.mp4`; URLs containing `broken` fail.
#[derive(Default)]
pub struct FakeFetcher {
    pub calls: Mutex<Vec<String>>,
}

impl VideoFetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<LocalVideo> {
        self.calls.lock().push(url.to_string());
        if url.contains("broken") {
            bail!("Video unavailable");
        }
        let id = url.rsplit('/').next().unwrap_or(url);
        fs::create_dir_all(dest)?;
        let path = dest.join(format!("{id}.{VIDEO_EXTENSION}"));
        fs::write(&path, b"video")?;
        LocalVideo::from_path(&path)
    }
}

/// Records published ids; fails every upload while `failing` is set.
#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<String>>,
    pub failing: Mutex<bool>,
    uploads: Option<UnboundedSender<String>>,
}

impl FakePublisher {
    /// Also sends each published id, so async tests can wait for uploads.
    pub fn notifying() -> (Arc<Self>, UnboundedReceiver<String>) {
        let (sender, receiver) = unbounded_channel();
        let publisher = Self {
            uploads: Some(sender),
            ..Self::default()
        };
        (Arc::new(publisher), receiver)
    }

    pub fn failing() -> Arc<Self> {
        let publisher = Self::default();
        *publisher.failing.lock() = true;
        Arc::new(publisher)
    }
}

impl Publisher for FakePublisher {
    fn publish(&self, video: &LocalVideo) -> Result<PublishedVideo> {
        if *self.failing.lock() {
            bail!("quota exceeded");
        }
        self.published.lock().push(video.id.clone());
        if let Some(uploads) = &self.uploads {
            let _ = uploads.send(video.id.clone());
        }
        Ok(PublishedVideo {
            remote_id: format!("yt-{}", video.id),
        })
    }
}
