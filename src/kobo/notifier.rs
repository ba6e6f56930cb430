//! Fire-and-forget progress notifications for an external tracker.
//!
//! The request path only enqueues; a worker task drains the queue and hands
//! each event to a [`ProgressSink`]. Sink failures are logged and dropped,
//! and so are events arriving while the queue is full.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NOTIFY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub book_id: i64,
    pub percent: Option<f64>,
    pub user_id: i64,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify_progress(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

/// Default sink: no tracker configured, just log what would have been sent.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn notify_progress(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        tracing::info!(
            book_id = event.book_id,
            user_id = event.user_id,
            percent = ?event.percent,
            "reading progress changed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressNotifier {
    pub fn spawn(sink: Arc<dyn ProgressSink>, token: CancellationToken) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(sink, token, NOTIFY_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        sink: Arc<dyn ProgressSink>,
        token: CancellationToken,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = sink.notify_progress(&event).await {
                            tracing::warn!(
                                book_id = event.book_id,
                                user_id = event.user_id,
                                error = %e,
                                "failed to push progress notification"
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::info!("progress notifier shutting down");
                        break;
                    }
                }
            }
        });

        (Self { tx: Some(tx) }, handle)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Never blocks and never fails the caller.
    pub fn notify(&self, book_id: i64, percent: Option<f64>, user_id: i64) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = ProgressEvent {
            book_id,
            percent,
            user_id,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(book_id, user_id, "progress notification queue is full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(book_id, user_id, "progress notifier is gone, dropping notification");
            }
        }
    }
}

#[cfg(test)]
pub use recording::RecordingSink;
