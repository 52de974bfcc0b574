#![forbid(unsafe_code)]

//! Local stock of downloaded videos waiting to be published.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use walkdir::WalkDir;

pub const VIDEO_EXTENSION: &str = "mp4";

/// A fetched file named after the id the source site assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVideo {
    pub id: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl LocalVideo {
    pub fn from_path(path: &Path) -> Result<Self> {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            modified,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LocalLibrary {
    dir: PathBuf,
}

impl LocalLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Completed `.mp4` files directly inside the directory, oldest first.
    /// Ties on modification time are broken by file name so the order is
    /// stable across calls.
    pub fn videos(&self) -> Result<Vec<LocalVideo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut videos = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            if entry.path().extension().and_then(|ext| ext.to_str()) != Some(VIDEO_EXTENSION) {
                continue;
            }
            match LocalVideo::from_path(entry.path()) {
                Ok(video) => videos.push(video),
                // Another process may have removed it between listing and stat.
                Err(_) => continue,
            }
        }

        videos.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(videos)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.videos()?.len())
    }

    pub fn oldest(&self) -> Result<Option<LocalVideo>> {
        Ok(self.videos()?.into_iter().next())
    }

    pub fn remove(&self, video: &LocalVideo) -> Result<()> {
        fs::remove_file(&video.path).with_context(|| format!("deleting {}", video.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(modified).unwrap();
        path
    }

    #[test]
    fn videos_ignores_partial_and_foreign_files() -> Result<()> {
        let dir = tempdir()?;
        touch(dir.path(), "alpha.mp4", 10);
        touch(dir.path(), "beta.mp4.part", 10);
        touch(dir.path(), "notes.txt", 10);
        fs::create_dir_all(dir.path().join("nested.mp4"))?;

        let library = LocalLibrary::new(dir.path());
        let videos = library.videos()?;
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].id, "alpha");
        Ok(())
    }

    #[test]
    fn oldest_uses_modification_time() -> Result<()> {
        let dir = tempdir()?;
        touch(dir.path(), "new.mp4", 10);
        touch(dir.path(), "old.mp4", 1000);
        touch(dir.path(), "mid.mp4", 100);

        let library = LocalLibrary::new(dir.path());
        assert_eq!(library.count()?, 3);
        assert_eq!(library.oldest()?.unwrap().id, "old");
        Ok(())
    }

    #[test]
    fn remove_deletes_the_file() -> Result<()> {
        let dir = tempdir()?;
        touch(dir.path(), "alpha.mp4", 1);
        let library = LocalLibrary::new(dir.path());
        let video = library.oldest()?.unwrap();
        library.remove(&video)?;
        assert!(!video.path.exists());
        assert_eq!(library.count()?, 0);
        Ok(())
    }

    #[test]
    fn missing_directory_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let library = LocalLibrary::new(dir.path().join("absent"));
        assert_eq!(library.count()?, 0);
        assert!(library.oldest()?.is_none());
        Ok(())
    }
}
