//! NSQ transport over TCP.
//!
//! Consumers discover nsqd instances through nsqlookupd (re-polled on an
//! interval) or, when no lookupd is configured, connect to the configured
//! nsqd directly. Producers publish to a single nsqd.

mod connection;
mod consumer;
#[cfg(test)]
mod fake;
mod lookup;
mod producer;
pub mod protocol;

pub use consumer::NsqSubscription;
pub use lookup::Lookup;
pub use producer::NsqProducer;

use crate::constants::{
    DEFAULT_LOOKUPD_POLL_INTERVAL_SECS, DEFAULT_MAX_IN_FLIGHT, DEFAULT_NSQD_ADDRESS,
};
use crate::queue::{MessageSink, Publisher, QueueError, Subscriber, Transport, validate_name};
use async_trait::async_trait;
use protocol::Identify;
use std::sync::Arc;
use std::time::Duration;

/// Settings for an NSQ deployment.
#[derive(Debug, Clone)]
pub struct NsqConfig {
    /// nsqlookupd HTTP addresses. Empty means consume from `nsqd_address`.
    pub lookupd_addresses: Vec<String>,
    /// nsqd TCP address used by producers (and consumers without lookupd).
    pub nsqd_address: String,
    /// Messages nsqd may push per connection before they are finished.
    pub max_in_flight: u32,
    pub lookupd_poll_interval: Duration,
    pub client_id: String,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            lookupd_addresses: Vec::new(),
            nsqd_address: DEFAULT_NSQD_ADDRESS.to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            lookupd_poll_interval: Duration::from_secs(DEFAULT_LOOKUPD_POLL_INTERVAL_SECS),
            client_id: "pinnerd".to_string(),
        }
    }
}

impl NsqConfig {
    pub(crate) fn identify(&self) -> Identify {
        Identify::new(self.client_id.clone())
    }
}

/// NSQ transport.
pub struct NsqTransport {
    config: Arc<NsqConfig>,
    lookup: Lookup,
}

impl NsqTransport {
    pub fn new(config: NsqConfig, http: reqwest::Client) -> Self {
        let lookup = Lookup::new(http, config.lookupd_addresses.clone());
        Self {
            config: Arc::new(config),
            lookup,
        }
    }

    /// Discovery client, shared with every subscription.
    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }
}

#[async_trait]
impl Transport for NsqTransport {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        sink: MessageSink,
    ) -> Result<Box<dyn Subscriber>, QueueError> {
        validate_name(topic)?;
        validate_name(channel)?;
        Ok(Box::new(NsqSubscription::spawn(
            Arc::clone(&self.config),
            self.lookup.clone(),
            topic.to_string(),
            channel.to_string(),
            sink,
        )))
    }

    async fn publisher(&self) -> Result<Arc<dyn Publisher>, QueueError> {
        Ok(Arc::new(NsqProducer::new(
            self.config.nsqd_address.clone(),
            self.config.identify(),
        )))
    }
}
