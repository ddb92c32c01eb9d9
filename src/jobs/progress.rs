//! One-way progress mailbox from a running crawl to its job driver.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The worker picked the job up.
    Started,
    Message(String),
}

/// Sending half handed to the crawl. Sends never block and never fail from
/// the caller's point of view: once the driver is gone, events are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that discards everything.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn started(&self) {
        self.send(ProgressEvent::Started);
    }

    pub fn notify(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Message(message.into()));
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender::new(tx), rx)
}
