//! One crawl end to end: validate, fetch, rebuild the tree, transcode, and
//! persist the artifact.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{BiliHttpApi, CommentApi};
use crate::artifact::{ArtifactSink, FsArtifactSink};
use crate::credentials::{Credential, load_latest_credential};
use crate::error::CrawlError;
use crate::fetcher::{FetchConfig, FetchOutcome, Fetcher};
use crate::identifier::VideoId;
use crate::jobs::ProgressSender;
use crate::transcode::transcode_forest;
use crate::tree;

/// Result attached to a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    /// Where the sink put the artifact.
    pub artifact: String,
    pub video_title: String,
    pub bv_id: String,
    pub total_comments: usize,
    pub root_comments: usize,
    /// `false` when root pagination stopped on an error and the artifact
    /// holds only what was collected before it.
    pub complete: bool,
}

/// Runs the whole crawl against `api` and hands the forest to `sink`.
///
/// The first thing reported is [`ProgressSender::started`], so a job that
/// never gets this far stays PENDING until it fails.
pub async fn run_crawl(
    api: &dyn CommentApi,
    sink: Arc<dyn ArtifactSink>,
    config: &FetchConfig,
    raw_id: &str,
    progress: ProgressSender,
    cancel: CancellationToken,
) -> Result<CrawlSummary, CrawlError> {
    progress.started();
    let video = VideoId::parse(raw_id)?;

    let FetchOutcome {
        resource,
        store,
        pages,
        complete,
    } = Fetcher::new(api, config, &progress, &cancel)
        .fetch_all(&video)
        .await?;

    progress.notify(format!("building reply tree from {} comments", store.len()));
    let forest = tree::reconstruct(store);
    let published = transcode_forest(forest.roots());

    if cancel.is_cancelled() {
        return Err(CrawlError::Cancelled);
    }
    progress.notify("writing artifact...");

    let title = resource.title.clone();
    let artifact = task::spawn_blocking(move || sink.store(&title, &published))
        .await
        .map_err(|err| CrawlError::ArtifactWriteFailed(format!("task join error: {err}")))?
        .map_err(|err| CrawlError::ArtifactWriteFailed(format!("{err:#}")))?;

    let summary = CrawlSummary {
        artifact,
        video_title: resource.title,
        bv_id: video.to_string(),
        total_comments: forest.total_count(),
        root_comments: forest.root_count(),
        complete,
    };
    info!(
        video = %summary.bv_id,
        pages,
        comments = summary.total_comments,
        roots = summary.root_comments,
        complete,
        "crawl finished"
    );
    progress.notify(format!("done: {} comments", summary.total_comments));
    Ok(summary)
}

/// What a production crawl needs besides the video id.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub api_base: String,
    pub credential_dir: PathBuf,
    pub output_root: PathBuf,
    pub fetch: FetchConfig,
}

/// Runs [`run_crawl`] against the live API and writes into `output_root`.
/// A `supplied` credential wins; otherwise the newest one in
/// `credential_dir` is loaded.
pub async fn crawl_with_credentials(
    settings: &CrawlSettings,
    supplied: Option<Credential>,
    raw_id: &str,
    progress: ProgressSender,
    cancel: CancellationToken,
) -> Result<CrawlSummary, CrawlError> {
    let credential = match supplied {
        Some(credential) => credential.validate()?,
        None => {
            let dir = settings.credential_dir.clone();
            task::spawn_blocking(move || load_latest_credential(&dir))
                .await
                .map_err(|err| {
                    CrawlError::CredentialUnavailable(format!("task join error: {err}"))
                })??
        }
    };

    let api = BiliHttpApi::new(settings.api_base.as_str(), &credential);
    let sink: Arc<dyn ArtifactSink> = Arc::new(FsArtifactSink::new(&settings.output_root));
    run_crawl(&api, sink, &settings.fetch, raw_id, progress, cancel).await
}
