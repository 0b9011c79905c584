// Web form front-end: start downloads in the background and poll their status

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::render::failure_text;
use super::AppContext;
use crate::downloader::models::{
    DownloadProgress, DownloadRequest, MaxAttempts, MediaKind, ProgressEvent, QualityRequest,
    QualityTier, ResourceLocator,
};
use crate::downloader::traits::ProgressEmitter;
use crate::downloader::utils::format_duration;
use crate::downloader::DownloadError;

pub const QUALITY_CHOICES: [&str; 4] = ["highest", "720p", "480p", "360p"];
pub const MAX_RETRIES: u32 = 10;

#[derive(Clone)]
pub struct WebState {
    app: Arc<AppContext>,
    jobs: Arc<Mutex<JobBoard>>,
    shutdown: CancellationToken,
}

impl WebState {
    pub fn new(app: Arc<AppContext>, shutdown: CancellationToken) -> Self {
        Self {
            app,
            jobs: Arc::new(Mutex::new(JobBoard::default())),
            shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebJobState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebJob {
    pub id: u64,
    pub url: String,
    pub quality: String,
    pub state: WebJobState,
    pub message: String,
    pub progress: Option<DownloadProgress>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct JobBoard {
    next_id: u64,
    jobs: Vec<WebJob>,
}

impl JobBoard {
    fn add(&mut self, url: &str, quality: String) -> u64 {
        self.next_id += 1;
        self.jobs.push(WebJob {
            id: self.next_id,
            url: url.to_string(),
            quality,
            state: WebJobState::Queued,
            message: "Queued".to_string(),
            progress: None,
            output: None,
        });
        self.next_id
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut WebJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn apply(&mut self, id: u64, event: &ProgressEvent) {
        let Some(job) = self.get_mut(id) else {
            return;
        };
        match event {
            ProgressEvent::Transfer(p) => job.progress = Some(p.clone()),
            ProgressEvent::Resolving { .. } => job.message = "Getting video info".to_string(),
            ProgressEvent::Selected { summary } => job.message = format!("Selected {}", summary),
            ProgressEvent::Retrying { attempt, error, .. } => {
                job.message = format!("Attempt {} failed: {}. Retrying", attempt, error)
            }
            ProgressEvent::Merging { .. } => job.message = "Merging audio and video".to_string(),
            ProgressEvent::Skipped { .. } => job.message = "Already downloaded".to_string(),
            ProgressEvent::Finished { .. } | ProgressEvent::EntryStarted { .. } => {}
        }
    }
}

/// Fields of the form on `/`
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadForm {
    pub url: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub quality: String,
    pub retries: Option<u32>,
}

impl DownloadForm {
    pub fn to_request(&self, app: &AppContext) -> Result<DownloadRequest, DownloadError> {
        let locator = ResourceLocator::new(self.url.as_str())?;
        let kind = if self.kind.trim().is_empty() {
            MediaKind::Video
        } else {
            self.kind.parse()?
        };
        let quality = match kind {
            // Audio always takes the best stream
            MediaKind::Audio => QualityRequest::audio(QualityTier::Best),
            MediaKind::Video => {
                let raw = if self.quality.trim().is_empty() {
                    "highest"
                } else {
                    self.quality.trim()
                };
                if !QUALITY_CHOICES.contains(&raw) {
                    return Err(DownloadError::InvalidRequest(format!(
                        "quality must be one of {}",
                        QUALITY_CHOICES.join(", ")
                    )));
                }
                QualityRequest::video(raw.parse()?)
            }
        };
        let retries = self.retries.unwrap_or(app.config.download.retries.max(1));
        if !(1..=MAX_RETRIES).contains(&retries) {
            return Err(DownloadError::InvalidRequest(format!(
                "retries must be between 1 and {}",
                MAX_RETRIES
            )));
        }

        let mut request = app.request(locator, quality, None);
        request.retry.max_attempts = MaxAttempts::from_count(retries);
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub duration: String,
    pub uploader: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match err {
            DownloadError::InvalidRequest(_) | DownloadError::NoMatchingFormat { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download", post(start_download))
        .route("/status", get(status))
        .route("/info", get(video_info))
        .with_state(state)
}

/// Serve until `shutdown` fires; running jobs are cancelled with it
pub async fn serve(app: Arc<AppContext>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let state = WebState::new(app, shutdown.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "Web form listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("running web server")?;
    Ok(())
}

async fn index(State(state): State<WebState>) -> Html<String> {
    let jobs = state.jobs.lock().await;
    Html(render_page(&jobs.jobs))
}

async fn start_download(
    State(state): State<WebState>,
    Form(form): Form<DownloadForm>,
) -> ApiResult<Redirect> {
    let request = form.to_request(&state.app)?;
    let id = state
        .jobs
        .lock()
        .await
        .add(request.locator.as_str(), request.quality.to_string());
    info!(job = id, locator = %request.locator, quality = %request.quality, "Web download queued");

    tokio::spawn(run_job(state.clone(), id, request));
    Ok(Redirect::to("/"))
}

async fn status(State(state): State<WebState>) -> Json<Vec<WebJob>> {
    Json(state.jobs.lock().await.jobs.clone())
}

async fn video_info(
    State(state): State<WebState>,
    Query(query): Query<InfoQuery>,
) -> ApiResult<Json<InfoResponse>> {
    if query.url.trim().is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let locator = ResourceLocator::new(query.url.as_str())?;
    let catalog = state
        .app
        .downloader
        .resolve(&locator, &state.app.config.request_context())
        .await?;
    Ok(Json(InfoResponse {
        duration: format_duration(catalog.duration_seconds),
        title: catalog.title,
        duration_seconds: catalog.duration_seconds,
        uploader: catalog.uploader,
    }))
}

async fn run_job(state: WebState, id: u64, request: DownloadRequest) {
    if let Some(job) = state.jobs.lock().await.get_mut(id) {
        job.state = WebJobState::Running;
        job.message = "Starting".to_string();
    }

    let (emitter, mut rx) = ProgressEmitter::channel();
    let jobs = state.jobs.clone();
    let updater = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            jobs.lock().await.apply(id, &event);
        }
    });

    let result = state
        .app
        .downloader
        .download(&request, emitter, state.shutdown.child_token())
        .await;
    let _ = updater.await;

    let mut board = state.jobs.lock().await;
    let Some(job) = board.get_mut(id) else {
        return;
    };
    match result {
        Ok(output) => {
            info!(job = id, path = %output.path.display(), "Web download finished");
            job.state = WebJobState::Completed;
            job.message = if output.skipped {
                "Already downloaded".to_string()
            } else {
                "Download complete".to_string()
            };
            job.output = Some(output.path);
        }
        Err(e) => {
            warn!(job = id, error = %e, "Web download failed");
            job.state = WebJobState::Failed;
            job.message = failure_text(&e);
        }
    }
}

fn render_page(jobs: &[WebJob]) -> String {
    let busy = jobs
        .iter()
        .any(|j| matches!(j.state, WebJobState::Queued | WebJobState::Running));
    let refresh = if busy {
        r#"<meta http-equiv="refresh" content="3">"#
    } else {
        ""
    };

    let qualities: String = QUALITY_CHOICES
        .iter()
        .map(|q| format!(r#"<option value="{q}">{q}</option>"#))
        .collect();

    let rows: String = jobs
        .iter()
        .rev()
        .map(|job| {
            let progress = job
                .progress
                .as_ref()
                .and_then(|p| p.percent())
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_default();
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:?}</td><td>{}</td><td>{}</td></tr>",
                job.id,
                escape_html(&job.url),
                escape_html(&job.quality),
                job.state,
                progress,
                escape_html(&job.message)
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>reelgrab</title>{refresh}</head>
<body>
<h1>reelgrab</h1>
<form method="post" action="/download">
  <label>URL <input type="text" name="url" size="60" required></label><br>
  <label>Type <select name="kind"><option value="video">Video</option><option value="audio">Audio</option></select></label><br>
  <label>Quality <select name="quality">{qualities}</select></label><br>
  <label>Retries <input type="number" name="retries" min="1" max="{max}" value="3"></label><br>
  <button type="submit">Download</button>
</form>
<h2>Downloads</h2>
<table>
<tr><th>#</th><th>URL</th><th>Quality</th><th>State</th><th>Progress</th><th>Message</th></tr>
{rows}
</table>
</body>
</html>
"#,
        max = MAX_RETRIES
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{catalog, muxed, FakeBackend};
    use crate::frontends::test_support::app;
    use std::time::Duration;

    fn form(url: &str, kind: &str, quality: &str, retries: Option<u32>) -> DownloadForm {
        DownloadForm {
            url: url.to_string(),
            kind: kind.to_string(),
            quality: quality.to_string(),
            retries,
        }
    }

    fn state(backend: FakeBackend, folder: &std::path::Path) -> WebState {
        let (app, _) = app(backend, folder);
        WebState::new(Arc::new(app), CancellationToken::new())
    }

    #[test]
    fn test_form_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(FakeBackend::new(), dir.path());

        let request = form("https://youtu.be/a", "video", "720p", Some(5))
            .to_request(&app)
            .unwrap();
        assert_eq!(request.quality.to_string(), "video 720p in mp4");
        assert_eq!(request.retry.max_attempts, MaxAttempts::from_count(5));

        let audio = form("https://youtu.be/a", "audio", "720p", None)
            .to_request(&app)
            .unwrap();
        assert_eq!(audio.quality, QualityRequest::audio(QualityTier::Best));

        assert!(form("", "video", "720p", None).to_request(&app).is_err());
        assert!(form("https://youtu.be/a", "video", "1080p", None)
            .to_request(&app)
            .is_err());
        assert!(form("https://youtu.be/a", "video", "720p", Some(11))
            .to_request(&app)
            .is_err());
        assert!(form("https://youtu.be/a", "clip", "720p", None)
            .to_request(&app)
            .is_err());
    }

    #[tokio::test]
    async fn test_background_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_catalog(
            "https://youtu.be/a",
            catalog("Clip", vec![muxed("18", "360p", 360, Some(500.0))]),
        );
        let state = state(backend, dir.path());

        let response = start_download(
            State(state.clone()),
            Form(form("https://youtu.be/a", "video", "highest", Some(2))),
        )
        .await;
        assert!(response.is_ok());

        let job = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let Json(jobs) = status(State(state.clone())).await;
                if jobs[0].state == WebJobState::Completed || jobs[0].state == WebJobState::Failed {
                    return jobs[0].clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(job.state, WebJobState::Completed);
        assert_eq!(job.output, Some(dir.path().join("Clip.mp4")));

        let Html(page) = index(State(state)).await;
        assert!(page.contains("Completed"));
        assert!(page.contains("https://youtu.be/a"));
    }

    #[tokio::test]
    async fn test_info_reports_title_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut clip = catalog("Clip <1>", vec![muxed("18", "360p", 360, None)]);
        clip.duration_seconds = Some(125);
        let state = state(
            FakeBackend::new().with_catalog("https://youtu.be/a", clip),
            dir.path(),
        );

        let Json(info) = video_info(
            State(state.clone()),
            Query(InfoQuery {
                url: "https://youtu.be/a".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(info.title, "Clip <1>");
        assert_eq!(info.duration, "2:05");

        let missing = video_info(
            State(state),
            Query(InfoQuery {
                url: "https://youtu.be/zzz".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_page_escapes_job_text() {
        let page = render_page(&[WebJob {
            id: 1,
            url: "https://x/?a=<b>".to_string(),
            quality: "video best".to_string(),
            state: WebJobState::Running,
            message: "Starting".to_string(),
            progress: None,
            output: None,
        }]);
        assert!(page.contains("&lt;b&gt;"));
        assert!(page.contains("http-equiv=\"refresh\""));
    }
}
