#![forbid(unsafe_code)]

//! Google OAuth for the upload scope: one interactive consent through a local
//! redirect listener, then a cached token that is refreshed on demand.

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::publisher::AccessTokenSource;

pub const UPLOAD_SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN_SECS: i64 = 60;

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The `installed` (or `web`) block of a Google Cloud `client_secrets.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading client secrets {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .ok_or_else(|| anyhow!("expected an \"installed\" or \"web\" client definition"))
    }
}

/// Token cache persisted as `token.json`. Also reads the `token`/`expiry`
/// layout written by Google's Python client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl StoredToken {
    /// A cache that cannot be parsed is treated as missing so the caller
    /// falls back to a fresh consent.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(token) => Ok(Some(token)),
                Err(err) => {
                    warn!("ignoring unreadable token cache {}: {err}", path.display());
                    Ok(None)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        let payload = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp_path, payload)?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("writing token cache {}", path.display()))?;
        Ok(())
    }

    /// True while the token stays valid for at least the expiry margin.
    /// Tokens without an expiry are trusted until the API rejects them.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) < expires_at,
            None => true,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Google omits the refresh token on refresh responses, so the previous
    /// one carries over.
    fn into_stored(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| now + ChronoDuration::seconds(secs)),
            scope: self.scope,
        }
    }
}

fn token_request(agent: &ureq::Agent, uri: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
    match agent.post(uri).send_form(form) {
        Ok(response) => response
            .into_json::<TokenResponse>()
            .context("parsing token endpoint response"),
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("token endpoint returned {status}: {}", body.trim())
        }
        Err(err) => Err(anyhow::Error::new(err)).context("contacting token endpoint"),
    }
}

fn exchange_code(
    agent: &ureq::Agent,
    secrets: &ClientSecrets,
    code: &str,
    redirect_uri: &str,
) -> Result<StoredToken> {
    let response = token_request(
        agent,
        &secrets.token_uri,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ],
    )?;
    Ok(response.into_stored(Utc::now(), None))
}

fn refresh_token(
    agent: &ureq::Agent,
    secrets: &ClientSecrets,
    refresh_token: &str,
) -> Result<StoredToken> {
    let response = token_request(
        agent,
        &secrets.token_uri,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ],
    )?;
    Ok(response.into_stored(Utc::now(), Some(refresh_token.to_string())))
}

pub fn consent_url(secrets: &ClientSecrets, redirect_uri: &str, state: &str) -> Result<String> {
    let query = serde_urlencoded::to_string([
        ("response_type", "code"),
        ("client_id", secrets.client_id.as_str()),
        ("redirect_uri", redirect_uri),
        ("scope", UPLOAD_SCOPE),
        ("access_type", "offline"),
        ("prompt", "consent"),
        ("state", state),
    ])
    .context("encoding consent URL")?;
    let separator = if secrets.auth_uri.contains('?') { '&' } else { '?' };
    Ok(format!("{}{separator}{query}", secrets.auth_uri))
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
}

async fn receive_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    if let Some(sender) = state.sender.lock().take() {
        let _ = sender.send(params);
    }
    Html("<p>Authorization received. You can close this tab.</p>")
}

fn code_from_callback(params: CallbackParams, expected_state: &str) -> Result<String> {
    if let Some(error) = params.error {
        bail!("authorization was denied: {error}");
    }
    if params.state.as_deref() != Some(expected_state) {
        bail!("authorization callback carried an unexpected state");
    }
    params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| anyhow!("authorization callback carried no code"))
}

/// Prints the consent URL, waits for Google to redirect back to
/// `http://localhost:<port>/` and exchanges the code for a token.
pub async fn authorize_interactively(
    agent: ureq::Agent,
    secrets: ClientSecrets,
    port: u16,
) -> Result<StoredToken> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding OAuth redirect listener on port {port}"))?;
    let redirect_uri = format!("http://localhost:{port}/");
    let expected_state = random_state();
    let url = consent_url(&secrets, &redirect_uri, &expected_state)?;

    info!("waiting for OAuth consent on {redirect_uri}");
    println!("Open this URL in a browser to allow uploads:");
    println!();
    println!("  {url}");
    println!();

    let (sender, receiver) = oneshot::channel();
    let (stop, stopped) = oneshot::channel::<()>();
    let app = Router::new()
        .route("/", get(receive_callback))
        .with_state(CallbackState {
            sender: Arc::new(Mutex::new(Some(sender))),
        });
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
    });

    let params = receiver
        .await
        .context("OAuth redirect listener stopped before a callback arrived")?;
    let _ = stop.send(());
    if let Err(err) = server.await {
        warn!("OAuth redirect listener did not shut down cleanly: {err}");
    }

    let code = code_from_callback(params, &expected_state)?;
    let token = tokio::task::spawn_blocking(move || {
        exchange_code(&agent, &secrets, &code, &redirect_uri)
    })
    .await
    .context("token exchange task panicked")??;
    info!("OAuth consent completed");
    Ok(token)
}

/// Hands out access tokens, refreshing and re-persisting the cache when the
/// current one is about to expire.
pub struct Authorizer {
    agent: ureq::Agent,
    secrets: ClientSecrets,
    cache_path: PathBuf,
    token: Mutex<StoredToken>,
}

impl Authorizer {
    pub fn new(
        agent: ureq::Agent,
        secrets: ClientSecrets,
        cache_path: impl Into<PathBuf>,
        token: StoredToken,
    ) -> Self {
        Self {
            agent,
            secrets,
            cache_path: cache_path.into(),
            token: Mutex::new(token),
        }
    }

    /// Reuses `token.json` when present and runs the interactive consent
    /// otherwise.
    pub async fn load_or_authorize(
        agent: ureq::Agent,
        secrets_path: &Path,
        cache_path: &Path,
        port: u16,
    ) -> Result<Self> {
        let secrets = ClientSecrets::load(secrets_path)?;
        let token = match StoredToken::load(cache_path)? {
            Some(token) => token,
            None => {
                let token = authorize_interactively(agent.clone(), secrets.clone(), port).await?;
                token.save(cache_path)?;
                token
            }
        };
        Ok(Self::new(agent, secrets, cache_path, token))
    }
}

impl AccessTokenSource for Authorizer {
    fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock();
        if token.is_fresh(Utc::now()) {
            return Ok(token.access_token.clone());
        }

        let Some(refresh) = token.refresh_token.clone() else {
            bail!(
                "access token expired and no refresh token is cached; delete {} and authorize again",
                self.cache_path.display()
            );
        };
        info!("refreshing OAuth access token");
        let refreshed = refresh_token(&self.agent, &self.secrets, &refresh)?;
        refreshed.save(&self.cache_path)?;
        *token = refreshed;
        Ok(token.access_token.clone())
    }
}
