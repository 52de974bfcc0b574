#![forbid(unsafe_code)]

//! One-time OAuth consent. Stores `token.json` under the data root so the
//! autopilot can start unattended.

use anyhow::{Context, Result, anyhow, bail};
use shorts_autopilot::{
    config::{RuntimeOverrides, resolve_settings},
    logging::init_logger,
    oauth::{ClientSecrets, StoredToken, authorize_interactively},
    publisher::build_agent,
    security::ensure_not_root,
};
use std::{env, path::PathBuf};
use tracing::info;

#[derive(Debug, Default)]
struct AuthorizeArgs {
    data_root: Option<PathBuf>,
    env_path: Option<PathBuf>,
    port: Option<u16>,
    force: bool,
}

impl AuthorizeArgs {
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
        let mut parsed = Self::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if arg == "--force" {
                parsed.force = true;
                continue;
            }
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
                "--data-root" => parsed.data_root = Some(PathBuf::from(value()?)),
                "--env-file" => parsed.env_path = Some(PathBuf::from(value()?)),
                "--port" => {
                    let raw = value()?;
                    let port = raw
                        .parse::<u16>()
                        .with_context(|| format!("invalid --port value: {raw}"))?;
                    parsed.port = Some(port);
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("authorize")?;

    let args = AuthorizeArgs::parse()?;
    let settings = resolve_settings(RuntimeOverrides {
        data_root: args.data_root.clone(),
        env_path: args.env_path.clone(),
        ..RuntimeOverrides::default()
    })?;
    init_logger(&settings.log_level)?;

    let paths = settings.paths();
    paths.prepare()?;

    if !args.force && StoredToken::load(&paths.token_cache)?.is_some() {
        println!(
            "{} already exists; pass --force to authorize again.",
            paths.token_cache.display()
        );
        return Ok(());
    }

    let secrets = ClientSecrets::load(&paths.client_secrets)?;
    let port = args.port.unwrap_or(settings.oauth_port);
    let token = authorize_interactively(build_agent(), secrets, port).await?;
    token.save(&paths.token_cache)?;

    info!("stored token in {}", paths.token_cache.display());
    println!("Authorization saved to {}", paths.token_cache.display());
    Ok(())
}
