#![forbid(unsafe_code)]

//! Intake form: a single secret-keyed page for queueing URLs and reading the
//! latest status lines.

use axum::{
    Form, Json, Router,
    extract::{Path as AxumPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use std::{fmt::Write as _, sync::Arc};
use tracing::{info, warn};

use crate::{queue::UrlQueue, security::secret_matches, status::StatusJournal};

const RECENT_STATUS_LINES: usize = 10;

#[derive(Clone)]
pub struct AppState {
    queue: Arc<dyn UrlQueue>,
    journal: StatusJournal,
    secret_key: Arc<str>,
}

impl AppState {
    pub fn new(queue: Arc<dyn UrlQueue>, journal: StatusJournal, secret_key: &str) -> Self {
        Self {
            queue,
            journal,
            secret_key: Arc::from(secret_key),
        }
    }

    fn intake_path(&self) -> String {
        format!("/secret-add-url/{}", self.secret_key)
    }

    fn authorize(&self, key: &str) -> ApiResult<()> {
        if secret_matches(key, &self.secret_key) {
            Ok(())
        } else {
            warn!("rejected intake request with a wrong key");
            Err(ApiError::forbidden("Unauthorized"))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route(
            "/secret-add-url/{key}",
            get(show_intake).post(submit_url),
        )
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            Json(body),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct IntakeForm {
    #[serde(default)]
    url: String,
}

async fn home(State(state): State<AppState>) -> Redirect {
    Redirect::to(&state.intake_path())
}

async fn show_intake(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
) -> ApiResult<Response> {
    state.authorize(&key)?;
    Ok(render_intake(&state).await?.into_response())
}

/// Blank submissions re-render the page without touching the queue.
async fn submit_url(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
    Form(form): Form<IntakeForm>,
) -> ApiResult<Response> {
    state.authorize(&key)?;

    let url = form.url.trim().to_string();
    if url.is_empty() {
        return Ok(render_intake(&state).await?.into_response());
    }

    let queue = state.queue.clone();
    let queued = url.clone();
    tokio::task::spawn_blocking(move || queue.push(&queued))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;
    info!("queued {url}");

    Ok(Redirect::to(&state.intake_path()).into_response())
}

async fn render_intake(state: &AppState) -> ApiResult<Html<String>> {
    let queue = state.queue.clone();
    let journal = state.journal.clone();
    let (urls, status) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        Ok((queue.pending()?, journal.recent(RECENT_STATUS_LINES)?))
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))?
    .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    Ok(Html(intake_page(&urls, &status)))
}

fn intake_page(urls: &[String], status: &[String]) -> String {
    let mut html = String::from(concat!(
        "<!DOCTYPE html>\n",
        "<html lang=\"en\">\n",
        "<head>\n",
        "<meta charset=\"UTF-8\">\n",
        "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n",
        "<title>YouTube Shorts Automation</title>\n",
        "<style>\n",
        "body { font-family: sans-serif; padding: 20px; background: #f8f9fa; }\n",
        ".container { max-width: 800px; margin: 0 auto; }\n",
        ".status-box { background: #fff; padding: 15px; border-radius: 5px; }\n",
        "</style>\n",
        "</head>\n",
        "<body>\n",
        "<div class=\"container\">\n",
        "<h1>YouTube Shorts Automation</h1>\n",
        "<form method=\"POST\">\n",
        "<input type=\"text\" name=\"url\" placeholder=\"Enter YouTube Shorts URL\" required>\n",
        "<button type=\"submit\">Add URL</button>\n",
        "</form>\n",
        "<h3>Queued URLs</h3>\n",
        "<ul>\n",
    ));

    if urls.is_empty() {
        html.push_str("<li>No URLs in queue</li>\n");
    }
    for url in urls {
        let _ = writeln!(html, "<li>{}</li>", escape_html(url));
    }

    html.push_str("</ul>\n<h3>Status Updates</h3>\n<div class=\"status-box\">\n");
    if status.is_empty() {
        html.push_str("<p>No status updates yet</p>\n");
    }
    for line in status {
        let _ = writeln!(html, "<p>{}</p>", escape_html(line));
    }
    html.push_str("</div>\n</div>\n</body>\n</html>\n");
    html
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::MemoryUrlQueue, status::MemoryStatusLog};
    use axum::body::to_bytes;
    use chrono::FixedOffset;

    struct Fixture {
        queue: Arc<MemoryUrlQueue>,
        state: AppState,
    }

    fn fixture(urls: &[&str]) -> Fixture {
        let queue = Arc::new(MemoryUrlQueue::new(urls.iter().copied()));
        let journal = StatusJournal::new(
            Arc::new(MemoryStatusLog::default()),
            FixedOffset::east_opt(19800).unwrap(),
        );
        let state = AppState::new(queue.clone(), journal, "letmein");
        Fixture { queue, state }
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[tokio::test]
    async fn home_redirects_to_keyed_page() {
        let fx = fixture(&[]);
        let response = home(State(fx.state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/secret-add-url/letmein");
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden_without_mutation() {
        let fx = fixture(&["https://a.test/1"]);

        let err = show_intake(State(fx.state.clone()), AxumPath("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = submit_url(
            State(fx.state.clone()),
            AxumPath("nope".into()),
            Form(IntakeForm {
                url: "https://evil.test/x".into(),
            }),
        )
        .await
        .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_text(response).await.contains("Unauthorized"));
        assert_eq!(fx.queue.pending().unwrap(), vec!["https://a.test/1"]);
    }

    #[tokio::test]
    async fn submission_appends_trimmed_url_and_redirects() {
        let fx = fixture(&["https://a.test/1"]);
        let response = submit_url(
            State(fx.state.clone()),
            AxumPath("letmein".into()),
            Form(IntakeForm {
                url: "  https://a.test/2 \n".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/secret-add-url/letmein");
        assert_eq!(
            fx.queue.pending().unwrap(),
            vec!["https://a.test/1", "https://a.test/2"]
        );
    }

    #[tokio::test]
    async fn blank_submission_rerenders_the_page() {
        let fx = fixture(&[]);
        let response = submit_url(
            State(fx.state.clone()),
            AxumPath("letmein".into()),
            Form(IntakeForm { url: "   ".into() }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(fx.queue.pending().unwrap().is_empty());
        let body = body_text(response).await;
        assert!(body.contains("No URLs in queue"));
        assert!(body.contains("No status updates yet"));
    }

    #[tokio::test]
    async fn page_lists_queue_and_escaped_status() {
        let fx = fixture(&["https://a.test/?q=<b>"]);
        fx.state.journal.error("Error downloading x: <script>");

        let response = show_intake(State(fx.state.clone()), AxumPath("letmein".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("<li>https://a.test/?q=&lt;b&gt;</li>"));
        assert!(body.contains("Error downloading x: &lt;script&gt;"));
        assert!(!body.contains("<script>"));
    }

    #[test]
    fn status_section_shows_given_lines_in_order() {
        let status: Vec<String> = (0..3).map(|index| format!("line {index}")).collect();
        let page = intake_page(&[], &status);
        let first = page.find("line 0").unwrap();
        let last = page.find("line 2").unwrap();
        assert!(first < last);
    }
}
