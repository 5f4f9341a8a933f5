use std::{sync::Arc, time::Instant};

use anyhow::Result;
use async_trait::async_trait;
use data_model::InterruptionNotice;
use futures::StreamExt;
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::interruption_handler::{InterruptionHandler, NoticeOutcome};

/// Handles one notice. Implemented by [`InterruptionHandler`]; the runner
/// only deals with queueing and concurrency.
#[async_trait]
pub trait NoticeProcessor: Send + Sync {
    async fn process(&self, notice: &InterruptionNotice) -> Result<NoticeOutcome>;
}

#[async_trait]
impl NoticeProcessor for InterruptionHandler {
    async fn process(&self, notice: &InterruptionNotice) -> Result<NoticeOutcome> {
        self.handle(notice).await
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("notice queue is full")]
    QueueFull,
    #[error("notice runner has shut down")]
    Closed,
}

pub struct QueuedNotice {
    pub notice: InterruptionNotice,
    pub queued_at: Instant,
}

struct Inner {
    request_rx: mpsc::Receiver<QueuedNotice>,
}

/// Bounded worker pool in front of a [`NoticeProcessor`]. Notices for
/// different instances run concurrently; a failure is logged and never
/// stops the pool.
pub struct NoticeRunner<T: NoticeProcessor> {
    request_tx: mpsc::Sender<QueuedNotice>,
    inner: Arc<Mutex<Inner>>,
    processor: Arc<T>,
    workers: usize,
    metrics: Arc<metrics::safety_net::Metrics>,
}

impl<T: NoticeProcessor> NoticeRunner<T> {
    pub fn new(
        processor: Arc<T>,
        workers: usize,
        queue_length: usize,
        metrics: Arc<metrics::safety_net::Metrics>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<QueuedNotice>(queue_length.max(1));
        Self {
            request_tx,
            inner: Arc::new(Mutex::new(Inner { request_rx })),
            processor,
            workers: workers.max(1),
            metrics,
        }
    }

    pub fn enqueue(&self, notice: InterruptionNotice) -> Result<(), EnqueueError> {
        self.request_tx
            .try_send(QueuedNotice {
                notice,
                queued_at: Instant::now(),
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })
    }

    pub fn queued(&self) -> usize {
        self.request_tx.max_capacity() - self.request_tx.capacity()
    }

    /// Drain the queue continuously until shutdown.
    pub async fn start(&self, mut shutdown_rx: tokio::sync::watch::Receiver<()>) {
        info!(workers = self.workers, "starting notice runner");
        let mut inner_guard = self.inner.lock().await;
        loop {
            let mut notices = Vec::with_capacity(self.workers);
            tokio::select! {
                received = inner_guard.request_rx.recv_many(&mut notices, self.workers) => {
                    if received == 0 {
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("notice runner shutting down");
                    break
                }
            }
            self.process_batch(notices).await;
        }
    }

    /// Handle whatever is queued right now.
    pub async fn process(&self) {
        let mut inner_guard = self.inner.lock().await;
        let mut notices = Vec::new();
        while let Ok(notice) = inner_guard.request_rx.try_recv() {
            notices.push(notice);
        }
        drop(inner_guard);
        self.process_batch(notices).await;
    }

    async fn process_batch(&self, notices: Vec<QueuedNotice>) {
        futures::stream::iter(notices)
            .for_each_concurrent(self.workers, |queued| async move {
                self.metrics.notice_queue_duration.record(
                    queued.queued_at.elapsed().as_secs_f64(),
                    &[KeyValue::new("kind", queued.notice.kind.to_string())],
                );
                match self.processor.process(&queued.notice).await {
                    Ok(outcome) => debug!(
                        instance_id = queued.notice.instance_id.get(),
                        outcome = outcome.label(),
                        "notice processed"
                    ),
                    Err(err) => error!(
                        instance_id = queued.notice.instance_id.get(),
                        kind = queued.notice.kind.as_ref(),
                        error = %err,
                        "error processing notice"
                    ),
                }
            })
            .await;
    }
}
