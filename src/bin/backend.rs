use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use bilicomments_tools::{
    config::{self, RuntimeConfig},
    credentials::Credential,
    error::{CrawlError, StatusUnavailable},
    fetcher::FetchConfig,
    identifier::VideoId,
    jobs::{JobState, JobStatus, JobTracker, SqliteJobStore},
    pipeline::{CrawlSettings, crawl_with_credentials},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "HTTP front end for background comment crawls")]
struct Args {
    /// KEY="value" configuration file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    tracker: JobTracker,
    settings: Arc<CrawlSettings>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: Option<&'static str>,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: None,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }

    fn bad_request(err: CrawlError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string()).with_kind(err.kind())
    }
}

impl From<StatusUnavailable> for ApiError {
    fn from(err: StatusUnavailable) -> Self {
        let status = match err {
            StatusUnavailable::UnknownJob(_) => StatusCode::NOT_FOUND,
            StatusUnavailable::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string()).with_kind(err.kind())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.kind {
            Some(kind) => serde_json::json!({ "error": self.message, "kind": kind }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bilicomments_tools=info,backend=info")),
        )
        .init();

    let args = Args::parse();
    let runtime = config::load_runtime_config_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let store = SqliteJobStore::open(&runtime.jobs_db).context("opening job store")?;
    let tracker = JobTracker::new(Arc::new(store));
    let state = AppState {
        tracker: tracker.clone(),
        settings: Arc::new(runtime.crawl_settings(FetchConfig::default())),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/crawl", post(submit_crawl))
        .route("/api/tasks", get(active_jobs))
        .route("/api/status/{id}", get(job_status))
        .route("/api/download/{id}", get(download_artifact))
        .route("/api/jobs/{id}", delete(revoke_job))
        .with_state(state);

    let addr = bind_address(&runtime)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, jobs_db = %runtime.jobs_db.display(), "API server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(tracker.clone()))
        .await
        .context("running API server");
    tracker.shutdown().await;
    served
}

fn bind_address(runtime: &RuntimeConfig) -> Result<SocketAddr> {
    let host = runtime
        .host
        .parse()
        .with_context(|| format!("parsing host {}", runtime.host))?;
    Ok(SocketAddr::new(host, runtime.port))
}

async fn shutdown_signal(tracker: JobTracker) {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!(running = tracker.running_count(), "shutting down");
    tracker.cancel_all();
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    running_jobs: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        running_jobs: state.tracker.running_count(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrawlRequest {
    bv_id: String,
    /// Session cookie for this crawl; without one the newest credential
    /// file is used.
    #[serde(default)]
    cookie: Option<Credential>,
}

impl CrawlRequest {
    fn validate(self) -> Result<(VideoId, Option<Credential>), CrawlError> {
        let video = VideoId::parse(&self.bv_id)?;
        let cookie = self.cookie.map(Credential::validate).transpose()?;
        Ok((video, cookie))
    }
}

async fn submit_crawl(
    State(state): State<AppState>,
    Json(request): Json<CrawlRequest>,
) -> ApiResult<(StatusCode, Json<JobStatus>)> {
    let (video, cookie) = request.validate().map_err(ApiError::bad_request)?;

    let settings = state.settings.clone();
    let raw_id = video.to_string();
    let id = state
        .tracker
        .submit(move |progress, cancel| async move {
            crawl_with_credentials(&settings, cookie, &raw_id, progress, cancel).await
        })
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    info!(job = %id, %video, "crawl queued");
    let status = state.tracker.status(&id.to_string()).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveJobs {
    active_jobs: Vec<JobStatus>,
}

async fn active_jobs(State(state): State<AppState>) -> ApiResult<Json<ActiveJobs>> {
    Ok(Json(ActiveJobs {
        active_jobs: state.tracker.active().await?,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(state.tracker.status(&id).await?))
}

async fn revoke_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(state.tracker.revoke(&id).await?))
}

async fn download_artifact(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let result = match state.tracker.status(&id).await?.state {
        JobState::Success { result } => result,
        other => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("job {id} is {}; no artifact", other.name()),
            ));
        }
    };

    let mut response = stream_file(PathBuf::from(&result.artifact)).await?;
    let disposition = format!("attachment; filename=\"{}_comments.json\"", result.bv_id);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("artifact not found"))?;

    let guessed = MimeGuess::from_path(&path).first();
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}
