#![forbid(unsafe_code)]

//! Uploads local videos to YouTube through the resumable upload protocol.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

use crate::library::LocalVideo;

pub const UPLOAD_ENDPOINT: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";

const MAX_ERROR_BODY: usize = 512;

/// Snippet and status fields sent with every upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy_status: String,
    pub made_for_kids: bool,
}

impl Default for UploadMetadata {
    fn default() -> Self {
        Self {
            title: "Dive into world of AI Cat".to_string(),
            description: "Automated upload of copyright-free Short video".to_string(),
            tags: ["#aicat", "#animals", "#catvideos", "#catlovers", "#tiger", "#animalvideos"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            // People & Blogs
            category_id: "22".to_string(),
            privacy_status: "public".to_string(),
            made_for_kids: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedVideo {
    pub remote_id: String,
}

pub trait Publisher: Send + Sync {
    fn publish(&self, video: &LocalVideo) -> Result<PublishedVideo>;
}

/// Anything able to hand out a currently valid OAuth bearer token.
pub trait AccessTokenSource: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("upload request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("upload session response carried no Location header")]
    MissingSession,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource<'a> {
    snippet: Snippet<'a>,
    status: VideoStatus<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snippet<'a> {
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
    category_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus<'a> {
    privacy_status: &'a str,
    self_declared_made_for_kids: bool,
}

impl<'a> From<&'a UploadMetadata> for VideoResource<'a> {
    fn from(metadata: &'a UploadMetadata) -> Self {
        Self {
            snippet: Snippet {
                title: &metadata.title,
                description: &metadata.description,
                tags: &metadata.tags,
                category_id: &metadata.category_id,
            },
            status: VideoStatus {
                privacy_status: &metadata.privacy_status,
                self_declared_made_for_kids: metadata.made_for_kids,
            },
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

/// Shared HTTP agent with connect/read timeouts; uploads of short videos
/// finish well within the read timeout.
pub fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .timeout_read(Duration::from_secs(300))
        .build()
}

pub struct YouTubePublisher {
    agent: ureq::Agent,
    tokens: Arc<dyn AccessTokenSource>,
    metadata: UploadMetadata,
    endpoint: String,
}

impl YouTubePublisher {
    pub fn new(
        agent: ureq::Agent,
        tokens: Arc<dyn AccessTokenSource>,
        metadata: UploadMetadata,
    ) -> Self {
        Self {
            agent,
            tokens,
            metadata,
            endpoint: UPLOAD_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn start_session(&self, bearer: &str, size: u64) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", bearer)
            .set("X-Upload-Content-Type", "video/*")
            .set("X-Upload-Content-Length", &size.to_string())
            .send_json(VideoResource::from(&self.metadata));
        let response = check_response(response).context("starting upload session")?;
        let location = response
            .header("Location")
            .ok_or(PublishError::MissingSession)?;
        Ok(location.to_string())
    }
}

impl Publisher for YouTubePublisher {
    fn publish(&self, video: &LocalVideo) -> Result<PublishedVideo> {
        let bearer = format!("Bearer {}", self.tokens.access_token()?);
        let file =
            File::open(&video.path).with_context(|| format!("opening {}", video.path.display()))?;
        let size = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", video.path.display()))?
            .len();

        let session = self.start_session(&bearer, size)?;
        debug!("upload session for {} opened", video.id);

        let response = self
            .agent
            .put(&session)
            .set("Authorization", &bearer)
            .set("Content-Type", "video/*")
            .set("Content-Length", &size.to_string())
            .send(file);
        let response = check_response(response).context("sending video bytes")?;
        let uploaded: UploadResponse = response
            .into_json()
            .context("parsing upload response")?;

        Ok(PublishedVideo {
            remote_id: uploaded.id,
        })
    }
}

fn check_response(result: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(status, response)) => {
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            Err(PublishError::Rejected {
                status,
                body: body.trim().to_string(),
            }
            .into())
        }
        Err(err) => Err(anyhow::Error::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::{post, put},
    };
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tempfile::tempdir;

    struct StaticToken(&'static str);

    impl AccessTokenSource for StaticToken {
        fn access_token(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Clone)]
    struct FakeYouTube {
        base: String,
        metadata: Arc<Mutex<Option<Value>>>,
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            == Some("Bearer good-token")
    }

    async fn start_session(
        State(state): State<FakeYouTube>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
        }
        *state.metadata.lock() = Some(body);
        (
            StatusCode::OK,
            [(header::LOCATION, format!("{}/session", state.base))],
        )
            .into_response()
    }

    async fn finish_upload(
        State(state): State<FakeYouTube>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        state.bytes.lock().extend_from_slice(&body);
        Json(json!({ "id": "remote42", "kind": "youtube#video" })).into_response()
    }

    async fn spawn_fake_youtube() -> FakeYouTube {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = FakeYouTube {
            base: format!("http://{addr}"),
            metadata: Arc::new(Mutex::new(None)),
            bytes: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/upload", post(start_session))
            .route("/session", put(finish_upload))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        state
    }

    fn sample_video(dir: &std::path::Path) -> LocalVideo {
        let path = dir.join("abc123.mp4");
        std::fs::write(&path, b"fake video bytes").unwrap();
        LocalVideo::from_path(&path).unwrap()
    }

    #[test]
    fn default_metadata_matches_channel_defaults() {
        let metadata = UploadMetadata::default();
        let body = serde_json::to_value(VideoResource::from(&metadata)).unwrap();
        assert_eq!(body["snippet"]["title"], "Dive into world of AI Cat");
        assert_eq!(body["snippet"]["categoryId"], "22");
        assert_eq!(body["snippet"]["tags"].as_array().unwrap().len(), 6);
        assert_eq!(body["status"]["privacyStatus"], "public");
        assert_eq!(body["status"]["selfDeclaredMadeForKids"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_runs_resumable_upload() {
        let fake = spawn_fake_youtube().await;
        let temp = tempdir().unwrap();
        let video = sample_video(temp.path());
        let publisher = YouTubePublisher::new(
            build_agent(),
            Arc::new(StaticToken("good-token")),
            UploadMetadata::default(),
        )
        .with_endpoint(format!("{}/upload", fake.base));

        let published = tokio::task::spawn_blocking(move || publisher.publish(&video))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(published.remote_id, "remote42");
        assert_eq!(fake.bytes.lock().as_slice(), b"fake video bytes");
        let metadata = fake.metadata.lock().clone().unwrap();
        assert_eq!(metadata["snippet"]["title"], "Dive into world of AI Cat");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_reports_rejections() {
        let fake = spawn_fake_youtube().await;
        let temp = tempdir().unwrap();
        let video = sample_video(temp.path());
        let publisher = YouTubePublisher::new(
            build_agent(),
            Arc::new(StaticToken("stale-token")),
            UploadMetadata::default(),
        )
        .with_endpoint(format!("{}/upload", fake.base));

        let err = tokio::task::spawn_blocking(move || publisher.publish(&video))
            .await
            .unwrap()
            .unwrap_err();

        match err.downcast_ref::<PublishError>() {
            Some(PublishError::Rejected { status, body }) => {
                assert_eq!(*status, 401);
                assert_eq!(body, "invalid credentials");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fake.bytes.lock().is_empty());
    }
}
