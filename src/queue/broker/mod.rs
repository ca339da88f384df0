//! Embedded message broker with optional persistence.
//!
//! Provides NSQ topic/channel semantics inside the process so the daemon can
//! run without an external queue, and so tests can drive the engine end to
//! end. Queues are held in memory and mirrored to redb when a database path
//! is configured.
//!
//! # Examples
//!
//! ```rust
//! use pinnerd::queue::EmbeddedBroker;
//!
//! # fn main() -> anyhow::Result<()> {
//! let broker = EmbeddedBroker::in_memory();
//!
//! // Published before any channel exists: held in the topic backlog
//! broker.publish("events", b"first")?;
//! assert_eq!(broker.backlog("events"), 1);
//!
//! // The first channel takes over the backlog, later channels fan out
//! broker.ensure_channel("events", "audit")?;
//! broker.ensure_channel("events", "mailer")?;
//! assert_eq!(broker.publish("events", b"second")?, 2);
//!
//! assert_eq!(broker.depth("events", "audit"), 2);
//! assert_eq!(broker.depth("events", "mailer"), 1);
//! # Ok(())
//! # }
//! ```

mod persistence;
mod service;
mod subscription;
mod types;

pub use service::EmbeddedBroker;
pub use subscription::{BrokerPublisher, BrokerSubscription};
pub use types::{BrokerConfig, BrokerMessage};

#[cfg(test)]
mod tests;
