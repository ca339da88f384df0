//! pinnerd: queue-driven pin orchestration.
//!
//! Consumes pin/unpin requests from a message queue, adds uploaded objects
//! (or whole directories) from object storage to a content-addressable
//! network under a concurrency cap, records the outcome on the storage
//! record and notifies the owner through a webhook.
//!
//! - [`engine`] - intake loops, executor, state updates, webhooks
//! - [`queue`] - transports (NSQ, embedded broker) and message codecs
//! - [`storage`] - object storage backends and scratch directories
//! - [`network`] - content network clients
//! - [`store`] - storage record persistence
//! - [`daemon`] - wiring from [`config::Config`] to a running engine

pub mod config;
pub mod constants;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod network;
pub mod queue;
pub mod reliability;
pub mod storage;
pub mod store;

pub use engine::{Collaborators, Engine, EngineConfig};
pub use error::{PinError, Result};
pub use model::{Column, Stage, StorageRecord, UserWebhookPreference};
