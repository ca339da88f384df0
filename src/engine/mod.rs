//! The pin-orchestration engine.
//!
//! Two intake loops consume the request and webhook topics. Each decodes
//! payloads, takes a slot from its own [`ConcurrencyLimiter`] and runs the
//! item on its [`WorkerPool`]:
//!
//! ```text
//! request topic -> intake -> PinExecutor -> StateUpdater -> Notifier -> webhook topic
//! webhook topic -> intake -> WebhookSender -> HTTP POST
//! ```
//!
//! [`Engine::stop`] unsubscribes first, so every message a subscription took
//! is either handed to its loop or re-queued, then waits for both loops to
//! drain before stopping the publisher.

mod executor;
mod intake;
mod limiter;
mod notifier;
mod pool;
mod updater;

#[cfg(test)]
mod tests;

pub use executor::{Outcome, PinExecutor};
pub use intake::{PinHandler, WebhookHandler, WorkHandler};
pub use limiter::{ConcurrencyLimiter, LimiterClosed, Slot};
pub use notifier::{Delivery, Notifier, WebhookSender, retry_url};
pub use pool::WorkerPool;
pub use updater::StateUpdater;

use crate::constants;
use crate::error::PinError;
use crate::network::ContentNetwork;
use crate::queue::{Publisher, QueueError, Subscriber, Transport};
use crate::storage::{ObjectStore, ScratchDirs};
use crate::store::RecordStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Setup(#[from] PinError),
}

/// Engine tuning and topic names.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_requests: usize,
    pub max_concurrent_webhooks: usize,
    /// Capacity of each subscription-to-loop channel.
    pub intake_buffer: usize,
    /// Extra attempts for the record update after a successful add.
    pub persist_retries: u32,
    pub request_topic: String,
    pub webhook_topic: String,
    pub channel: String,
    /// Base of the manual re-pin URL sent with failure webhooks.
    pub retry_base_url: String,
    pub webhook_timeout: Duration,
    pub scratch: ScratchDirs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: constants::DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_concurrent_webhooks: constants::DEFAULT_MAX_CONCURRENT_WEBHOOKS,
            intake_buffer: constants::DEFAULT_INTAKE_BUFFER,
            persist_retries: constants::DEFAULT_PERSIST_RETRIES,
            request_topic: constants::DEFAULT_REQUEST_TOPIC.to_string(),
            webhook_topic: constants::DEFAULT_WEBHOOK_TOPIC.to_string(),
            channel: constants::DEFAULT_CHANNEL.to_string(),
            retry_base_url: String::new(),
            webhook_timeout: Duration::from_secs(constants::DEFAULT_WEBHOOK_TIMEOUT_SECS),
            scratch: ScratchDirs::in_temp_dir(constants::DEFAULT_SCRATCH_PREFIX),
        }
    }
}

/// External services the engine runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub objects: Arc<dyn ObjectStore>,
    pub network: Arc<dyn ContentNetwork>,
    pub records: Arc<dyn RecordStore>,
}

struct Loop {
    subscription: Box<dyn Subscriber>,
    task: JoinHandle<()>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl Loop {
    async fn shutdown(self, name: &str) {
        self.subscription.unsubscribe().await;
        if let Err(e) = self.task.await {
            tracing::error!(intake = name, error = %e, "intake loop ended abnormally");
        }
        self.limiter.close();
    }
}

struct Running {
    requests: Loop,
    webhooks: Loop,
    publisher: Arc<dyn Publisher>,
}

/// Start/stop controller for the two intake loops.
pub struct Engine {
    config: EngineConfig,
    collaborators: Collaborators,
    span: Span,
    running: Option<Running>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let span = tracing::info_span!("engine", channel = %config.channel);
        Self {
            config,
            collaborators,
            span,
            running: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Subscribes both topics and spawns their intake loops.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if started twice, or the error
    /// that prevented subscribing. A failed start leaves nothing running.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let config = &self.config;
        let c = &self.collaborators;

        let publisher = c.transport.publisher().await?;
        let sender = WebhookSender::new(
            Arc::clone(&c.records),
            config.retry_base_url.clone(),
            config.webhook_timeout,
        )?;
        let executor = PinExecutor::new(
            Arc::clone(&c.objects),
            Arc::clone(&c.network),
            Arc::clone(&c.records),
            StateUpdater::new(Arc::clone(&c.records), config.persist_retries),
            Notifier::new(Arc::clone(&publisher), config.webhook_topic.clone()),
            config.scratch.clone(),
        );

        let pin_span = tracing::info_span!(parent: &self.span, "pin_intake");
        let requests = self
            .spawn_loop(
                &config.request_topic,
                Arc::new(PinHandler::new(executor, pin_span.clone())),
                ConcurrencyLimiter::new(config.max_concurrent_requests, "pin"),
                pin_span,
            )
            .await;
        let requests = match requests {
            Ok(requests) => requests,
            Err(e) => {
                publisher.stop().await;
                return Err(e.into());
            },
        };

        let webhook_span = tracing::info_span!(parent: &self.span, "webhook_intake");
        let webhooks = self
            .spawn_loop(
                &config.webhook_topic,
                Arc::new(WebhookHandler::new(sender, webhook_span.clone())),
                ConcurrencyLimiter::new(config.max_concurrent_webhooks, "webhook"),
                webhook_span,
            )
            .await;
        let webhooks = match webhooks {
            Ok(webhooks) => webhooks,
            Err(e) => {
                requests.shutdown("pin").await;
                publisher.stop().await;
                return Err(e.into());
            },
        };

        self.span.in_scope(|| {
            tracing::info!(
                request_topic = %config.request_topic,
                webhook_topic = %config.webhook_topic,
                "engine started"
            );
        });
        self.running = Some(Running {
            requests,
            webhooks,
            publisher,
        });
        Ok(())
    }

    async fn spawn_loop<H: WorkHandler>(
        &self,
        topic: &str,
        handler: Arc<H>,
        limiter: ConcurrencyLimiter,
        span: Span,
    ) -> Result<Loop, QueueError> {
        let (sink, inbound) = mpsc::channel::<Bytes>(self.config.intake_buffer.max(1));
        let limiter = Arc::new(limiter);
        let task = tokio::spawn(
            intake::run(handler, Arc::clone(&limiter), inbound, topic.to_string()).instrument(span),
        );
        match self
            .collaborators
            .transport
            .subscribe(topic, &self.config.channel, sink)
            .await
        {
            Ok(subscription) => Ok(Loop {
                subscription,
                task,
                limiter,
            }),
            Err(e) => {
                // the sink was dropped with the failed subscribe, so the loop exits
                let _ = task.await;
                Err(e)
            },
        }
    }

    /// Unsubscribes, drains both loops, closes their limiters and stops the
    /// publisher. A no-op when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let span = self.span.clone();
        async move {
            tracing::info!("engine stopping");
            let Running {
                requests,
                webhooks,
                publisher,
            } = running;
            requests.subscription.unsubscribe().await;
            webhooks.subscription.unsubscribe().await;

            for (name, task) in [("pin", requests.task), ("webhook", webhooks.task)] {
                if let Err(e) = task.await {
                    tracing::error!(intake = name, error = %e, "intake loop ended abnormally");
                }
            }
            requests.limiter.close();
            webhooks.limiter.close();
            publisher.stop().await;
            tracing::info!("engine stopped");
        }
        .instrument(span)
        .await;
    }
}
