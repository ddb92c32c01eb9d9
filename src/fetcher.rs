//! Sequential paginated fetch of a video's whole comment corpus.
//!
//! Root pages are requested in ascending order; each root comment's reply
//! sub-thread is drained before the next root comment is looked at. Every
//! request is followed by a random pause so the shared session never bursts.
//! Cancellation is observed between requests and interrupts pauses.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{CommentApi, ResourceHandle};
use crate::comment::CommentStore;
use crate::error::CrawlError;
use crate::identifier::VideoId;
use crate::jobs::ProgressSender;

/// Inclusive window a random pause is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub min: Duration,
    pub max: Duration,
}

impl DelayWindow {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub const fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub root_delay: DelayWindow,
    pub reply_delay: DelayWindow,
    pub reply_page_size: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            root_delay: DelayWindow::new(Duration::from_millis(1000), Duration::from_millis(2500)),
            reply_delay: DelayWindow::new(Duration::from_millis(500), Duration::from_millis(1000)),
            reply_page_size: 10,
        }
    }
}

impl FetchConfig {
    /// No pauses at all; for tests and local fakes.
    pub fn immediate() -> Self {
        Self {
            root_delay: DelayWindow::none(),
            reply_delay: DelayWindow::none(),
            ..Self::default()
        }
    }
}

/// What a finished (possibly truncated) fetch hands to reconstruction.
#[derive(Debug)]
pub struct FetchOutcome {
    pub resource: ResourceHandle,
    pub store: CommentStore,
    /// Root pages that returned items.
    pub pages: u32,
    /// `false` when root pagination stopped on an error.
    pub complete: bool,
}

pub struct Fetcher<'a> {
    api: &'a dyn CommentApi,
    config: &'a FetchConfig,
    progress: &'a ProgressSender,
    cancel: &'a CancellationToken,
}

impl<'a> Fetcher<'a> {
    pub fn new(
        api: &'a dyn CommentApi,
        config: &'a FetchConfig,
        progress: &'a ProgressSender,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            api,
            config,
            progress,
            cancel,
        }
    }

    pub async fn fetch_all(&self, video: &VideoId) -> Result<FetchOutcome, CrawlError> {
        self.checkpoint()?;
        let resource = self.api.resolve_resource(video).await.map_err(|err| {
            CrawlError::RemotePageFetchFailed(format!("resolving {video}: {err}"))
        })?;
        info!(%video, aid = resource.aid, title = %resource.title, "resolved video");
        self.progress.notify("fetching comments...");

        let mut store = CommentStore::new();
        let mut pages = 0u32;
        let mut complete = true;
        let mut page = 1u32;

        loop {
            self.checkpoint()?;
            let root_page = match self.api.fetch_root_page(&resource, page).await {
                Ok(root_page) => root_page,
                Err(err) if store.is_empty() => {
                    return Err(CrawlError::RemotePageFetchFailed(format!(
                        "root page {page} of {video}: {err}"
                    )));
                }
                Err(err) => {
                    warn!(
                        %video,
                        page,
                        error = %err,
                        collected = store.len(),
                        "root page failed; keeping partial result"
                    );
                    complete = false;
                    break;
                }
            };

            // An empty page ends pagination; the server's own page counter
            // is only advisory.
            if root_page.items.is_empty() {
                if root_page.has_more {
                    debug!(%video, page, "empty root page while the server reports more");
                }
                info!(%video, pages, "no more root comments");
                break;
            }
            if !root_page.has_more {
                debug!(%video, page, "server reports last root page; checking the next anyway");
            }

            for root in root_page.items {
                let root_id = root.id;
                let has_replies = root.reply_count > 0;
                store.insert(root);
                if has_replies {
                    self.drain_replies(&resource, root_id, &mut store).await?;
                }
            }

            pages += 1;
            self.progress.notify(format!(
                "fetched page {pages} ({} comments so far)",
                store.len()
            ));

            page += 1;
            self.pause(self.config.root_delay).await?;
        }

        info!(%video, pages, comments = store.len(), complete, "fetch finished");
        if store.is_empty() {
            return Err(CrawlError::EmptyResult(video.to_string()));
        }
        Ok(FetchOutcome {
            resource,
            store,
            pages,
            complete,
        })
    }

    /// Pages through one root comment's replies. Errors abandon the
    /// sub-thread and keep whatever was already inserted.
    async fn drain_replies(
        &self,
        resource: &ResourceHandle,
        root_id: i64,
        store: &mut CommentStore,
    ) -> Result<(), CrawlError> {
        let mut fetched: u64 = 0;
        let mut page = 1u32;

        loop {
            self.checkpoint()?;
            let reply_page = match self
                .api
                .fetch_reply_page(resource, root_id, page, self.config.reply_page_size)
                .await
            {
                Ok(reply_page) => reply_page,
                Err(err) => {
                    warn!(root = root_id, page, error = %err, "abandoning reply sub-thread");
                    return Ok(());
                }
            };

            if reply_page.items.is_empty() {
                return Ok(());
            }

            fetched += reply_page.items.len() as u64;
            for reply in reply_page.items {
                store.insert(reply);
            }

            if fetched >= reply_page.total_count {
                return Ok(());
            }

            page += 1;
            self.pause(self.config.reply_delay).await?;
        }
    }

    fn checkpoint(&self) -> Result<(), CrawlError> {
        if self.cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        Ok(())
    }

    async fn pause(&self, window: DelayWindow) -> Result<(), CrawlError> {
        let delay = window.sample();
        if delay.is_zero() {
            return self.checkpoint();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CrawlError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
