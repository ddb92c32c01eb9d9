//! Background crawl jobs: submission, state tracking, and status queries.
//!
//! Every submitted job gets two tokio tasks. The worker runs the crawl and
//! reports through a [`ProgressSender`]; the driver drains that mailbox into
//! the [`JobStore`] and, once the worker finishes, records SUCCESS or
//! FAILURE. The driver is the only writer for its job apart from revoke.

pub mod progress;
pub mod state;
pub mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{self, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::{CrawlError, JobError, StatusUnavailable};
use crate::pipeline::CrawlSummary;

pub use progress::{ProgressEvent, ProgressSender};
pub use state::{JobId, JobRecord, JobState, JobStatus};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore, Transition};

pub const PANIC_KIND: &str = "Panic";

type Running = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    running: Running,
    tasks: TaskTracker,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            running: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
        }
    }

    /// Records a PENDING job and starts `work` in the background.
    pub async fn submit<F, Fut>(&self, work: F) -> Result<JobId>
    where
        F: FnOnce(ProgressSender, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<CrawlSummary, CrawlError>> + Send + 'static,
    {
        let record = JobRecord::new(JobId::new());
        let id = record.id;
        on_store(&self.store, move |store| store.insert(&record))
            .await
            .context("recording new job")?;

        let cancel = CancellationToken::new();
        self.running.lock().insert(id, cancel.clone());

        let (sender, mailbox) = progress::channel();
        let worker = self.tasks.spawn(work(sender, cancel));
        self.tasks.spawn(drive(
            Arc::clone(&self.store),
            Arc::clone(&self.running),
            id,
            mailbox,
            worker,
        ));

        info!(job = %id, "job submitted");
        Ok(id)
    }

    pub async fn status(&self, raw_id: &str) -> Result<JobStatus, StatusUnavailable> {
        let id = parse_job_id(raw_id)?;
        self.load(id).await
    }

    /// Marks the job REVOKED and cancels its crawl. Revoking a finished job
    /// leaves it as it was.
    pub async fn revoke(&self, raw_id: &str) -> Result<JobStatus, StatusUnavailable> {
        let id = parse_job_id(raw_id)?;
        match self.write(id, JobState::Revoked).await? {
            Transition::Applied => {
                if let Some(cancel) = self.running.lock().get(&id) {
                    cancel.cancel();
                }
                info!(job = %id, "job revoked");
            }
            Transition::Rejected => info!(job = %id, "job already finished; not revoked"),
            Transition::Missing => return Err(StatusUnavailable::UnknownJob(raw_id.to_owned())),
        }
        self.load(id).await
    }

    /// Moves a job that is still in flight into RETRY; the next pickup
    /// reports STARTED again.
    pub async fn mark_retry(&self, raw_id: &str) -> Result<JobStatus, StatusUnavailable> {
        let id = parse_job_id(raw_id)?;
        if self.write(id, JobState::Retry).await? == Transition::Missing {
            return Err(StatusUnavailable::UnknownJob(raw_id.to_owned()));
        }
        self.load(id).await
    }

    /// Cancels every job still running. Their drivers record the outcome.
    pub fn cancel_all(&self) {
        let running = self.running.lock();
        for (id, cancel) in running.iter() {
            info!(job = %id, "cancelling job");
            cancel.cancel();
        }
    }

    /// Cancels every running job and waits until each driver has written
    /// its terminal state.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.tasks.close();
        self.tasks.wait().await;
        info!("all job drivers finished");
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Statuses of the jobs currently in flight, oldest first.
    pub async fn active(&self) -> Result<Vec<JobStatus>, StatusUnavailable> {
        let ids: Vec<JobId> = self.running.lock().keys().copied().collect();
        let mut records = on_store(&self.store, move |store| {
            let mut records = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(record) = store.get(id)? {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
        .map_err(|err| StatusUnavailable::Backend(format!("{err:#}")))?;

        records.sort_by_key(|record| record.created_at);
        Ok(records.into_iter().map(JobStatus::from).collect())
    }

    async fn load(&self, id: JobId) -> Result<JobStatus, StatusUnavailable> {
        on_store(&self.store, move |store| store.get(&id))
            .await
            .map_err(|err| StatusUnavailable::Backend(format!("{err:#}")))?
            .map(JobStatus::from)
            .ok_or_else(|| StatusUnavailable::UnknownJob(id.to_string()))
    }

    async fn write(&self, id: JobId, next: JobState) -> Result<Transition, StatusUnavailable> {
        on_store(&self.store, move |store| store.transition(&id, next, None))
            .await
            .map_err(|err| StatusUnavailable::Backend(format!("{err:#}")))
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, StatusUnavailable> {
    raw.parse()
        .map_err(|_| StatusUnavailable::UnknownJob(raw.to_owned()))
}

/// Runs a blocking store call on the blocking pool.
async fn on_store<T, F>(store: &Arc<dyn JobStore>, f: F) -> Result<T>
where
    F: FnOnce(&dyn JobStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    task::spawn_blocking(move || f(store.as_ref()))
        .await
        .context("job store task join error")?
}

async fn drive(
    store: Arc<dyn JobStore>,
    running: Running,
    id: JobId,
    mut mailbox: UnboundedReceiver<ProgressEvent>,
    worker: JoinHandle<Result<CrawlSummary, CrawlError>>,
) {
    // The mailbox closes once the worker drops its sender, so every progress
    // event is recorded before the terminal state.
    while let Some(event) = mailbox.recv().await {
        let (next, text) = match event {
            ProgressEvent::Started => (JobState::Started, None),
            ProgressEvent::Message(text) => (JobState::Progress, Some(text)),
        };
        record(&store, id, next, text).await;
    }

    let terminal = match worker.await {
        Ok(Ok(summary)) => {
            info!(
                job = %id,
                artifact = %summary.artifact,
                comments = summary.total_comments,
                "job succeeded"
            );
            JobState::Success { result: summary }
        }
        Ok(Err(err)) => {
            warn!(job = %id, kind = err.kind(), error = %err, "job failed");
            JobState::Failure {
                error: JobError::from(err),
            }
        }
        Err(join) => {
            let error = classify_join_error(join);
            error!(job = %id, kind = %error.kind, message = %error.message, "job task aborted");
            JobState::Failure { error }
        }
    };
    record(&store, id, terminal, None).await;
    running.lock().remove(&id);
}

async fn record(store: &Arc<dyn JobStore>, id: JobId, next: JobState, text: Option<String>) {
    let name = next.name();
    match on_store(store, move |store| store.transition(&id, next, text)).await {
        Ok(Transition::Applied | Transition::Rejected) => {}
        Ok(Transition::Missing) => warn!(job = %id, state = name, "job record disappeared"),
        Err(err) => {
            let reason = format!("{err:#}");
            error!(job = %id, state = name, error = %reason, "failed to record job state");
        }
    }
}

fn classify_join_error(join: JoinError) -> JobError {
    if !join.is_panic() {
        return JobError::new(CrawlError::Cancelled.kind(), "crawl task was aborted");
    }
    let payload = join.into_panic();
    let message = if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "crawl task panicked".to_owned()
    };
    JobError::new(PANIC_KIND, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RecordingStore {
        inner: MemoryJobStore,
        history: Mutex<Vec<&'static str>>,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryJobStore::new(),
                history: Mutex::new(Vec::new()),
            })
        }

        fn history(&self) -> Vec<&'static str> {
            self.history.lock().clone()
        }
    }

    impl JobStore for RecordingStore {
        fn insert(&self, record: &JobRecord) -> Result<()> {
            self.history.lock().push(record.state.name());
            self.inner.insert(record)
        }

        fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
            self.inner.get(id)
        }

        fn transition(
            &self,
            id: &JobId,
            next: JobState,
            progress_text: Option<String>,
        ) -> Result<Transition> {
            let name = next.name();
            let outcome = self.inner.transition(id, next, progress_text)?;
            if outcome == Transition::Applied {
                self.history.lock().push(name);
            }
            Ok(outcome)
        }
    }

    struct UnreachableStore;

    impl JobStore for UnreachableStore {
        fn insert(&self, _record: &JobRecord) -> Result<()> {
            Ok(())
        }

        fn get(&self, _id: &JobId) -> Result<Option<JobRecord>> {
            anyhow::bail!("connection refused")
        }

        fn transition(&self, _: &JobId, _: JobState, _: Option<String>) -> Result<Transition> {
            anyhow::bail!("connection refused")
        }
    }

    fn summary() -> CrawlSummary {
        CrawlSummary {
            artifact: "/out/t_comments.json".into(),
            video_title: "t".into(),
            bv_id: "BV1xx411c7mD".into(),
            total_comments: 1,
            root_comments: 1,
            complete: true,
        }
    }

    async fn settle(tracker: &JobTracker, id: JobId) -> JobStatus {
        for _ in 0..400 {
            let status = tracker.status(&id.to_string()).await.unwrap();
            if status.state.is_terminal() && tracker.running_count() == 0 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never settled");
    }

    #[tokio::test]
    async fn pending_goes_straight_to_success_without_progress() {
        let store = RecordingStore::new();
        let tracker = JobTracker::new(store.clone());
        let id = tracker
            .submit(|_progress, _cancel| async { Ok(summary()) })
            .await
            .unwrap();

        let status = settle(&tracker, id).await;
        assert_eq!(status.state, JobState::Success { result: summary() });
        assert_eq!(store.history(), vec!["PENDING", "SUCCESS"]);
    }

    #[tokio::test]
    async fn progress_is_recorded_before_the_result() {
        let store = RecordingStore::new();
        let tracker = JobTracker::new(store.clone());
        let id = tracker
            .submit(|progress, _cancel| async move {
                progress.started();
                progress.notify("page 1");
                progress.notify("page 2");
                Ok(summary())
            })
            .await
            .unwrap();

        let status = settle(&tracker, id).await;
        assert_eq!(status.progress_text.as_deref(), Some("page 2"));
        assert_eq!(
            store.history(),
            vec!["PENDING", "STARTED", "PROGRESS", "PROGRESS", "SUCCESS"]
        );
    }

    #[tokio::test]
    async fn failure_carries_kind_and_message() {
        let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
        let id = tracker
            .submit(|_progress, _cancel| async {
                Err::<CrawlSummary, _>(CrawlError::EmptyResult("BV1xx411c7mD".into()))
            })
            .await
            .unwrap();

        match settle(&tracker, id).await.state {
            JobState::Failure { error } => {
                assert_eq!(error.kind, "EmptyResult");
                assert!(!error.message.is_empty());
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
        let id = tracker
            .submit(|_progress, _cancel| async {
                if true {
                    panic!("parser exploded");
                }
                Ok(summary())
            })
            .await
            .unwrap();

        match settle(&tracker, id).await.state {
            JobState::Failure { error } => {
                assert_eq!(error.kind, PANIC_KIND);
                assert_eq!(error.message, "parser exploded");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_unavailable() {
        let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
        let err = tracker.status(&JobId::new().to_string()).await.unwrap_err();
        assert!(matches!(err, StatusUnavailable::UnknownJob(_)));
        let err = tracker.status("not-a-job").await.unwrap_err();
        assert!(matches!(err, StatusUnavailable::UnknownJob(_)));
        let err = tracker.revoke("not-a-job").await.unwrap_err();
        assert_eq!(err.kind(), "StatusUnavailable");
    }

    #[tokio::test]
    async fn unreachable_store_is_not_reported_as_pending() {
        let tracker = JobTracker::new(Arc::new(UnreachableStore));
        let err = tracker.status(&JobId::new().to_string()).await.unwrap_err();
        assert!(matches!(err, StatusUnavailable::Backend(_)));
    }

    #[tokio::test]
    async fn revoke_cancels_the_crawl_and_sticks() {
        let store = RecordingStore::new();
        let tracker = JobTracker::new(store.clone());
        let id = tracker
            .submit(|progress, cancel| async move {
                progress.started();
                cancel.cancelled().await;
                Err::<CrawlSummary, _>(CrawlError::Cancelled)
            })
            .await
            .unwrap();

        let status = tracker.revoke(&id.to_string()).await.unwrap();
        assert_eq!(status.state, JobState::Revoked);

        let status = settle(&tracker, id).await;
        assert_eq!(status.state, JobState::Revoked);
        assert_eq!(store.history().last(), Some(&"REVOKED"));
    }

    #[tokio::test]
    async fn retry_marks_in_flight_jobs_only() {
        let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let id = tracker
            .submit(|_progress, _cancel| async move {
                let _ = gate.await;
                Ok(summary())
            })
            .await
            .unwrap();

        let status = tracker.mark_retry(&id.to_string()).await.unwrap();
        assert_eq!(status.state, JobState::Retry);

        release.send(()).unwrap();
        let status = settle(&tracker, id).await;
        assert_eq!(status.state.name(), "SUCCESS");
        let status = tracker.mark_retry(&id.to_string()).await.unwrap();
        assert_eq!(status.state.name(), "SUCCESS");
    }

    #[tokio::test]
    async fn shutdown_waits_for_drivers_to_record_the_outcome() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.db");
        let tracker = JobTracker::new(Arc::new(SqliteJobStore::open(&path)?));
        let id = tracker
            .submit(|progress, cancel| async move {
                progress.started();
                progress.notify("fetched page 1");
                cancel.cancelled().await;
                Err::<CrawlSummary, _>(CrawlError::Cancelled)
            })
            .await?;

        tracker.shutdown().await;
        assert_eq!(tracker.running_count(), 0);
        drop(tracker);

        let reopened = SqliteJobStore::open(&path)?;
        let record = reopened.get(&id)?.unwrap();
        match record.state {
            JobState::Failure { error } => assert_eq!(error.kind, "Cancelled"),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(record.progress_text.as_deref(), Some("fetched page 1"));
        Ok(())
    }

    #[tokio::test]
    async fn active_lists_only_jobs_in_flight() {
        let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let waiting = tracker
            .submit(|progress, _cancel| async move {
                progress.started();
                let _ = gate.await;
                Ok(summary())
            })
            .await
            .unwrap();
        let done = tracker
            .submit(|_progress, _cancel| async { Ok(summary()) })
            .await
            .unwrap();

        for _ in 0..400 {
            if tracker.running_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let active = tracker.active().await.unwrap();
        let ids: Vec<&str> = active.iter().map(|s| s.job_id.as_str()).collect();
        assert_eq!(ids, vec![waiting.to_string().as_str()]);
        assert!(tracker.status(&done.to_string()).await.unwrap().state.is_terminal());

        release.send(()).unwrap();
        settle(&tracker, waiting).await;
        assert!(tracker.active().await.unwrap().is_empty());
    }
}
