#![forbid(unsafe_code)]

//! Downloads a single video from its source URL into the local library.

use anyhow::{Context, Result, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::debug;

use crate::library::{LocalVideo, VIDEO_EXTENSION};

pub trait VideoFetcher: Send + Sync {
    /// Downloads `url` into `dest` and returns the finished file.
    fn fetch(&self, url: &str, dest: &Path) -> Result<LocalVideo>;
}

/// Thin wrapper over the `yt-dlp` executable. Files land as `<id>.mp4`.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
    format: String,
    cookies: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            format: format!("best[ext={VIDEO_EXTENSION}]"),
            cookies: None,
        }
    }

    /// Passes `--cookies` whenever the file exists at fetch time.
    pub fn with_cookies(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies = Some(path.into());
        self
    }

    /// Runs `<program> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn command(&self, url: &str, dest: &Path) -> Command {
        let output_pattern = dest.join("%(id)s.%(ext)s");
        let mut command = Command::new(&self.program);
        command
            .arg("--format")
            .arg(&self.format)
            .arg("--output")
            .arg(output_pattern.to_string_lossy().to_string())
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:id")
            .arg("--no-progress")
            .arg("--no-warnings");

        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command
                .arg("--cookies")
                .arg(cookies.to_string_lossy().to_string());
        }

        command.arg(url);
        command
    }
}

impl VideoFetcher for YtDlpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<LocalVideo> {
        fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;

        debug!("running yt-dlp for {url}");
        let output = self
            .command(url, dest)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("running {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no error output");
            bail!("yt-dlp exited with {}: {}", output.status, reason);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(video_id) = stdout.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
            bail!("yt-dlp did not report a video id for {url}");
        };

        let path = dest.join(format!("{video_id}.{VIDEO_EXTENSION}"));
        if !path.is_file() {
            bail!(
                "yt-dlp reported {video_id} but {} does not exist",
                path.display()
            );
        }

        LocalVideo::from_path(&path)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn install_ytdlp_stub(dir: &Path) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
output=""
url=""
cookies=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --version)
      echo "2024.01.01"
      exit 0
      ;;
    --output)
      shift
      output="$1"
      ;;
    --cookies)
      shift
      cookies="$1"
      ;;
    --format|--print)
      shift
      ;;
    --*)
      ;;
    *)
      url="$1"
      ;;
  esac
  shift
done

id="${url##*/}"

if [[ "$url" == *broken* ]]; then
  echo "ERROR: [generic] $id: Video unavailable" >&2
  exit 1
fi

if [[ -n "$cookies" ]]; then
  id="${id}-cookies"
fi

if [[ "$url" != *ghost* ]]; then
  target="${output//%(id)s/$id}"
  target="${target//%(ext)s/mp4}"
  mkdir -p "$(dirname "$target")"
  echo "video" > "$target"
fi

echo "$id"
"#;
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[test]
    fn fetch_returns_downloaded_file() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;
        let dest = temp.path().join("downloaded_videos");

        let fetcher = YtDlpFetcher::new(stub);
        fetcher.ensure_available()?;
        let video = fetcher.fetch("https://youtube.test/shorts/abc123", &dest)?;
        assert_eq!(video.id, "abc123");
        assert_eq!(video.path, dest.join("abc123.mp4"));
        assert!(video.path.is_file());
        Ok(())
    }

    #[test]
    fn fetch_surfaces_ytdlp_errors() -> Result<()> {
        let temp = tempdir()?;
        let fetcher = YtDlpFetcher::new(install_ytdlp_stub(temp.path())?);
        let err = fetcher
            .fetch("https://youtube.test/shorts/broken", temp.path())
            .unwrap_err();
        assert!(err.to_string().contains("Video unavailable"));
        Ok(())
    }

    #[test]
    fn fetch_fails_when_reported_file_is_missing() -> Result<()> {
        let temp = tempdir()?;
        let fetcher = YtDlpFetcher::new(install_ytdlp_stub(temp.path())?);
        let err = fetcher
            .fetch("https://youtube.test/shorts/ghost", temp.path())
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        Ok(())
    }

    #[test]
    fn cookies_are_passed_only_when_present() -> Result<()> {
        let temp = tempdir()?;
        let cookies = temp.path().join("cookies.txt");
        let fetcher =
            YtDlpFetcher::new(install_ytdlp_stub(temp.path())?).with_cookies(cookies.clone());
        let dest = temp.path().join("out");

        assert_eq!(fetcher.fetch("https://youtube.test/a", &dest)?.id, "a");
        fs::write(&cookies, "# Netscape HTTP Cookie File\n")?;
        assert_eq!(fetcher.fetch("https://youtube.test/b", &dest)?.id, "b-cookies");
        Ok(())
    }

    #[test]
    fn missing_program_is_reported() {
        let fetcher = YtDlpFetcher::new("/definitely/not/yt-dlp");
        let err = fetcher.ensure_available().unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
