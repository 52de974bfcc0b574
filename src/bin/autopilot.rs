#![forbid(unsafe_code)]

//! Intake server plus the background loop that keeps videos flowing from the
//! pending list to the channel.

use anyhow::{Context, Result, anyhow, bail};
use shorts_autopilot::{
    config::{RunMode, RuntimeOverrides, Settings, resolve_settings},
    continuous::{ContinuousPolicy, ContinuousProcessor, run_continuous},
    fetcher::{VideoFetcher, YtDlpFetcher},
    library::LocalLibrary,
    logging::init_logger,
    oauth::Authorizer,
    publisher::{Publisher, YouTubePublisher, build_agent},
    queue::{CsvUrlQueue, UrlQueue},
    replenish::Replenisher,
    scheduler::{Scheduler, run_scheduled},
    security::ensure_not_root,
    status::{FileStatusLog, StatusJournal},
    web::{AppState, router},
};
use std::{env, path::PathBuf, sync::Arc};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug)]
struct AutopilotArgs {
    overrides: RuntimeOverrides,
}

impl AutopilotArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--data-root" => overrides.data_root = Some(PathBuf::from(value()?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                "--host" => overrides.host = Some(value()?),
                "--port" => {
                    let raw = value()?;
                    let port = raw
                        .parse::<u16>()
                        .with_context(|| format!("invalid --port value: {raw}"))?;
                    overrides.port = Some(port);
                }
                "--mode" => overrides.mode = Some(RunMode::parse(&value()?)?),
                "--log-level" => overrides.log_level = Some(value()?),
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(Self { overrides })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("autopilot")?;

    let AutopilotArgs { overrides } = AutopilotArgs::parse()?;
    let settings = resolve_settings(overrides)?;
    init_logger(&settings.log_level)?;

    if settings.uses_default_secret() {
        warn!("AUTOPILOT_SECRET_KEY is not set, the intake page uses the default key");
    }

    let paths = settings.paths();
    paths.prepare()?;
    info!("data root: {}", paths.root.display());

    let fetcher = YtDlpFetcher::new(&settings.yt_dlp).with_cookies(&paths.cookies);
    fetcher.ensure_available()?;

    let agent = build_agent();
    let authorizer = Authorizer::load_or_authorize(
        agent.clone(),
        &paths.client_secrets,
        &paths.token_cache,
        settings.oauth_port,
    )
    .await
    .context("authorizing uploads")?;
    let publisher: Arc<dyn Publisher> = Arc::new(YouTubePublisher::new(
        agent,
        Arc::new(authorizer),
        settings.upload.clone(),
    ));

    let queue: Arc<dyn UrlQueue> = Arc::new(CsvUrlQueue::open(&paths.url_list)?);
    let journal = StatusJournal::new(
        Arc::new(FileStatusLog::open(&paths.status_log)?),
        settings.utc_offset,
    );
    let library = LocalLibrary::new(&paths.downloads);
    let fetcher: Arc<dyn VideoFetcher> = Arc::new(fetcher);

    let shutdown = CancellationToken::new();
    let worker = spawn_worker(
        &settings,
        queue.clone(),
        library,
        fetcher,
        publisher,
        journal.clone(),
        shutdown.clone(),
    );

    let app = router(AppState::new(queue, journal, &settings.secret_key));
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("binding {}:{}", settings.host, settings.port))?;
    info!(
        "intake page listening on http://{}:{}",
        settings.host, settings.port
    );

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => server_shutdown.cancel(),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("running intake server")?;

    shutdown.cancel();
    if let Err(err) = worker.await {
        error!("background loop ended abnormally: {err}");
    }
    Ok(())
}

fn spawn_worker(
    settings: &Settings,
    queue: Arc<dyn UrlQueue>,
    library: LocalLibrary,
    fetcher: Arc<dyn VideoFetcher>,
    publisher: Arc<dyn Publisher>,
    journal: StatusJournal,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    match settings.mode {
        RunMode::Scheduled => {
            let replenisher =
                Replenisher::new(queue, library, fetcher, journal, settings.target_count);
            let scheduler = Scheduler::new(
                replenisher,
                publisher,
                settings.publish_times.clone(),
                settings.utc_offset,
            );
            tokio::spawn(run_scheduled(Arc::new(scheduler), shutdown))
        }
        RunMode::Continuous => {
            let policy = ContinuousPolicy {
                publish_interval: settings.publish_interval,
                retry_delay: settings.retry_delay,
                max_failures: settings.max_failures,
                reset_after: settings.reset_after,
                reset_abandoned: settings.reset_abandoned,
            };
            let processor =
                ContinuousProcessor::new(queue, library, fetcher, publisher, journal, policy);
            tokio::spawn(run_continuous(processor, shutdown))
        }
    }
}

async fn shutdown_signal() {
    // Without a handler the process still dies on Ctrl+C, just not gracefully.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}
