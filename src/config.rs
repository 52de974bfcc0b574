#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use chrono::{FixedOffset, NaiveTime};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::publisher::UploadMetadata;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_SECRET_KEY: &str = "mysecret123";
pub const DEFAULT_TARGET_COUNT: usize = 5;
pub const DEFAULT_PUBLISH_TIMES: &str = "06:00,17:00,19:00";
pub const DEFAULT_UTC_OFFSET: &str = "+05:30";
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_MAX_FAILURES: u32 = 3;
pub const DEFAULT_RESET_AFTER_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_OAUTH_PORT: u16 = 8080;
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DOWNLOADS_SUBDIR: &str = "downloaded_videos";
const URL_LIST_FILE: &str = "video_urls.csv";
const STATUS_LOG_FILE: &str = "upload_status.txt";
const TOKEN_CACHE_FILE: &str = "token.json";
const CLIENT_SECRETS_FILE: &str = "client_secrets.json";
const COOKIES_FILE: &str = "cookies.txt";

/// Which background loop runs next to the intake server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep a stock of local videos and publish at fixed daily slots.
    Scheduled,
    /// Fetch and publish every pending URL one after another.
    Continuous,
}

impl RunMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "schedule" => Ok(Self::Scheduled),
            "continuous" | "loop" => Ok(Self::Continuous),
            _ => bail!("unknown run mode: {value}"),
        }
    }
}

/// Fully resolved runtime configuration shared by both binaries.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub secret_key: String,
    pub mode: RunMode,
    pub target_count: usize,
    pub publish_times: Vec<NaiveTime>,
    pub utc_offset: FixedOffset,
    pub publish_interval: Duration,
    pub retry_delay: Duration,
    pub max_failures: u32,
    pub reset_after: Duration,
    pub reset_abandoned: bool,
    pub oauth_port: u16,
    pub yt_dlp: PathBuf,
    pub log_level: String,
    pub upload: UploadMetadata,
}

impl Settings {
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_root)
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }
}

/// Command-line values that win over both the environment and the env file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mode: Option<RunMode>,
    pub log_level: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .or_else(|| lookup("AUTOPILOT_DATA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("AUTOPILOT_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("AUTOPILOT_PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    let secret_key = lookup("AUTOPILOT_SECRET_KEY").unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string());
    validate_secret_key(&secret_key)?;
    let mode = match overrides.mode {
        Some(mode) => mode,
        None => lookup("AUTOPILOT_MODE")
            .map(|value| RunMode::parse(&value))
            .transpose()?
            .unwrap_or(RunMode::Scheduled),
    };
    let target_count = parsed_or(&lookup, "AUTOPILOT_TARGET_COUNT", DEFAULT_TARGET_COUNT);
    let publish_times = parse_publish_times(
        &lookup("AUTOPILOT_PUBLISH_TIMES").unwrap_or_else(|| DEFAULT_PUBLISH_TIMES.to_string()),
    )?;
    let utc_offset = parse_utc_offset(
        &lookup("AUTOPILOT_UTC_OFFSET").unwrap_or_else(|| DEFAULT_UTC_OFFSET.to_string()),
    )?;
    let publish_interval = Duration::from_secs(parsed_or(
        &lookup,
        "AUTOPILOT_PUBLISH_INTERVAL_SECS",
        DEFAULT_PUBLISH_INTERVAL_SECS,
    ));
    let retry_delay = Duration::from_secs(parsed_or(
        &lookup,
        "AUTOPILOT_RETRY_DELAY_SECS",
        DEFAULT_RETRY_DELAY_SECS,
    ));
    let max_failures = parsed_or(&lookup, "AUTOPILOT_MAX_FAILURES", DEFAULT_MAX_FAILURES).max(1);
    let reset_after = Duration::from_secs(parsed_or(
        &lookup,
        "AUTOPILOT_RESET_AFTER_SECS",
        DEFAULT_RESET_AFTER_SECS,
    ));
    let reset_abandoned = lookup("AUTOPILOT_RESET_ABANDONED")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true);
    let oauth_port = parsed_or(&lookup, "AUTOPILOT_OAUTH_PORT", DEFAULT_OAUTH_PORT);
    let yt_dlp = lookup("AUTOPILOT_YT_DLP")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));
    let log_level = overrides
        .log_level
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup("AUTOPILOT_LOG"))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    let mut upload = UploadMetadata::default();
    if let Some(title) = lookup("AUTOPILOT_UPLOAD_TITLE") {
        upload.title = title;
    }
    if let Some(description) = lookup("AUTOPILOT_UPLOAD_DESCRIPTION") {
        upload.description = description;
    }
    if let Some(tags) = lookup("AUTOPILOT_UPLOAD_TAGS") {
        upload.tags = tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(category) = lookup("AUTOPILOT_UPLOAD_CATEGORY") {
        upload.category_id = category;
    }
    if let Some(privacy) = lookup("AUTOPILOT_UPLOAD_PRIVACY") {
        upload.privacy_status = privacy;
    }

    Ok(Settings {
        data_root,
        host,
        port,
        secret_key,
        mode,
        target_count,
        publish_times,
        utc_offset,
        publish_interval,
        retry_delay,
        max_failures,
        reset_after,
        reset_abandoned,
        oauth_port,
        yt_dlp,
        log_level,
        upload,
    })
}

fn parsed_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a comma separated list of `HH:MM` slots into a sorted, deduplicated
/// list.
pub fn parse_publish_times(value: &str) -> Result<Vec<NaiveTime>> {
    let mut times = value
        .split(',')
        .map(str::trim)
        .filter(|slot| !slot.is_empty())
        .map(|slot| {
            NaiveTime::parse_from_str(slot, "%H:%M")
                .with_context(|| format!("invalid publish time {slot:?}, expected HH:MM"))
        })
        .collect::<Result<Vec<_>>>()?;
    times.sort();
    times.dedup();
    if times.is_empty() {
        bail!("at least one publish time is required");
    }
    Ok(times)
}

/// Accepts `Z`, `UTC`, `+05:30`, `-0300` or `+7`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid offset"));
    }

    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => bail!("UTC offset must start with + or -: {value:?}"),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        bail!("invalid UTC offset: {value:?}");
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>()?, 0)
    } else {
        let split = digits.len() - 2;
        (digits[..split].parse::<i32>()?, digits[split..].parse::<i32>()?)
    };
    if hours > 23 || minutes > 59 {
        bail!("UTC offset out of range: {value:?}");
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("UTC offset out of range: {value:?}"))
}

/// The key is used verbatim as a path segment of the intake URL, so it is
/// limited to characters that never need percent-encoding.
fn validate_secret_key(key: &str) -> Result<()> {
    let path_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~');
    if key.is_empty() || !key.chars().all(path_safe) {
        bail!("AUTOPILOT_SECRET_KEY may only contain letters, digits, '-', '.', '_' and '~'");
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value_raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|value| value.strip_suffix('\''))
        })
        .unwrap_or(value)
}

/// Every file and directory the autopilot reads or writes, relative to the
/// data root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub downloads: PathBuf,
    pub url_list: PathBuf,
    pub status_log: PathBuf,
    pub token_cache: PathBuf,
    pub client_secrets: PathBuf,
    pub cookies: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        let root = root.to_path_buf();
        Self {
            downloads: root.join(DOWNLOADS_SUBDIR),
            url_list: root.join(URL_LIST_FILE),
            status_log: root.join(STATUS_LOG_FILE),
            token_cache: root.join(TOKEN_CACHE_FILE),
            client_secrets: root.join(CLIENT_SECRETS_FILE),
            cookies: root.join(COOKIES_FILE),
            root,
        }
    }

    /// Creates the data root and the download directory. The queue and log
    /// files are created by their stores on open.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        fs::create_dir_all(&self.downloads)
            .with_context(|| format!("creating {}", self.downloads.display()))?;
        Ok(())
    }
}
