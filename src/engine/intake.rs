//! Intake loops: decode, acquire a slot, dispatch.

use super::executor::PinExecutor;
use super::limiter::ConcurrencyLimiter;
use super::notifier::WebhookSender;
use super::pool::WorkerPool;
use crate::error::Result;
use crate::queue::{PinRequest, WebhookMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, Span};

/// Work carried by one topic.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Pool and log label.
    const NAME: &'static str;

    /// Decodes and validates one payload.
    ///
    /// # Errors
    ///
    /// Returns a decode error for payloads that must be dropped.
    fn decode(&self, payload: &[u8]) -> Result<Self::Item>;

    /// Span for one item, child of the loop's span.
    fn span(&self, item: &Self::Item) -> Span;

    /// Processes one item. Never fails: outcomes are logged here.
    async fn handle(&self, item: Self::Item);
}

/// Runs until `inbound` closes or a zero-length payload arrives, then waits
/// for every dispatched item.
pub async fn run<H: WorkHandler>(
    handler: Arc<H>,
    limiter: Arc<ConcurrencyLimiter>,
    mut inbound: mpsc::Receiver<Bytes>,
    topic: String,
) {
    let mut pool = WorkerPool::new(H::NAME);
    tracing::info!(topic = %topic, capacity = limiter.capacity(), "intake loop started");

    while let Some(payload) = inbound.recv().await {
        if payload.is_empty() {
            tracing::info!(topic = %topic, "termination message received");
            break;
        }
        let item = match handler.decode(&payload) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "dropping undecodable message");
                crate::metrics::record_dropped(&topic);
                continue;
            },
        };
        let Ok(slot) = limiter.acquire().await else {
            tracing::warn!(topic = %topic, "limiter closed, stopping intake");
            break;
        };

        let span = handler.span(&item);
        let handler = Arc::clone(&handler);
        pool.dispatch(
            async move {
                let _slot = slot;
                handler.handle(item).await;
            }
            .instrument(span),
        );
    }

    pool.drain().await;
    tracing::info!(topic = %topic, "intake loop stopped");
}

/// Pin and unpin requests.
pub struct PinHandler {
    executor: PinExecutor,
    span: Span,
}

impl PinHandler {
    pub fn new(executor: PinExecutor, span: Span) -> Self {
        Self { executor, span }
    }
}

#[async_trait]
impl WorkHandler for PinHandler {
    type Item = PinRequest;

    const NAME: &'static str = "pin";

    fn decode(&self, payload: &[u8]) -> Result<PinRequest> {
        PinRequest::decode(payload)
    }

    fn span(&self, request: &PinRequest) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "request",
            op = request.operation(),
            storage_id = request.storage_id,
            src = request.source.as_deref().unwrap_or_default(),
        )
    }

    async fn handle(&self, request: PinRequest) {
        let op = request.operation();
        match self.executor.execute(&request).await {
            Ok(outcome) => {
                crate::metrics::record_request(op, outcome.as_str());
            },
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "request failed");
                crate::metrics::record_request(op, e.kind());
            },
        }
    }
}

/// Webhook deliveries.
pub struct WebhookHandler {
    sender: WebhookSender,
    span: Span,
}

impl WebhookHandler {
    pub fn new(sender: WebhookSender, span: Span) -> Self {
        Self { sender, span }
    }
}

#[async_trait]
impl WorkHandler for WebhookHandler {
    type Item = WebhookMessage;

    const NAME: &'static str = "webhook";

    fn decode(&self, payload: &[u8]) -> Result<WebhookMessage> {
        WebhookMessage::decode(payload)
    }

    fn span(&self, message: &WebhookMessage) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "webhook",
            storage_id = message.storage_id,
            user_id = message.user_id,
            status = %message.status,
        )
    }

    async fn handle(&self, message: WebhookMessage) {
        match self.sender.deliver(&message).await {
            Ok(delivery) => crate::metrics::record_webhook(delivery.as_str()),
            Err(e) => {
                tracing::warn!(error = %e, "webhook delivery failed");
                crate::metrics::record_webhook("failed");
            },
        }
    }
}
