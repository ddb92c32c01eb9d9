#![forbid(unsafe_code)]

//! One-shot crawl of a single video's comments into `<title>_comments.json`.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use bilicomments_tools::{
    api::DEFAULT_API_BASE,
    config::{self, EnvConfig},
    fetcher::FetchConfig,
    jobs::progress::{self, ProgressEvent},
    pipeline::{CrawlSettings, crawl_with_credentials},
};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Crawl every comment of a video into a JSON reply tree.")]
struct Args {
    /// Video identifier, e.g. BV1xx411c7mD.
    bv_id: String,
    #[arg(long = "config", value_name = "PATH", default_value = config::DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
    #[arg(
        long = "output-dir",
        value_name = "PATH",
        help = "Directory for the artifact (default OUTPUT_ROOT from the config file)"
    )]
    output_dir: Option<PathBuf>,
    #[arg(
        long = "credential-dir",
        value_name = "PATH",
        help = "Directory holding bilibili_credential_*.json files"
    )]
    credential_dir: Option<PathBuf>,
    #[arg(long = "api-base", value_name = "URL", help = "Override the API base URL")]
    api_base: Option<String>,
}

impl Args {
    /// Command-line values win over the config file, which may be absent.
    fn settings(&self, file: Option<EnvConfig>) -> Result<CrawlSettings> {
        let file = file.unwrap_or_default();
        let output_root = self
            .output_dir
            .clone()
            .or(file.output_root)
            .ok_or_else(|| anyhow!("no --output-dir given and OUTPUT_ROOT not configured"))?;
        let credential_dir = self
            .credential_dir
            .clone()
            .or(file.credential_dir)
            .unwrap_or_else(|| output_root.join("credentials"));
        let api_base = self
            .api_base
            .clone()
            .or(file.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(CrawlSettings {
            api_base,
            credential_dir,
            output_root,
            fetch: FetchConfig::default(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bilicomments_tools=info,crawl_comments=info")),
        )
        .init();

    let args = Args::parse();
    let file = config::read_env_config(&args.config)?;
    let settings = args.settings(file)?;
    info!(
        output = %settings.output_root.display(),
        credentials = %settings.credential_dir.display(),
        "starting crawl"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "failed to install Ctrl+C handler");
                return;
            }
            warn!("interrupted; stopping after the current request");
            cancel.cancel();
        }
    });

    let (sender, mut events) = progress::channel();
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ProgressEvent::Message(text) = event {
                info!("{text}");
            }
        }
    });

    let outcome = crawl_with_credentials(&settings, None, &args.bv_id, sender, cancel).await;
    reporter.await.context("progress reporter failed")?;

    let summary = outcome.map_err(|err| anyhow!("{} ({})", err, err.kind()))?;
    if !summary.complete {
        warn!("root pagination stopped early; the artifact is partial");
    }
    println!(
        "{} comments ({} threads) from \"{}\" written to {}",
        summary.total_comments, summary.root_comments, summary.video_title, summary.artifact
    );
    Ok(())
}
