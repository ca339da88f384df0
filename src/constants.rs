//! Shared defaults for the pin engine, transports and clients.
//!
//! Centralizes values referenced by configuration defaults, validation
//! messages and the in-code fallbacks so they never drift apart.

/// Default number of simultaneously in-flight pin/unpin operations.
///
/// A configured value of `0` falls back to this.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 5;

/// Default number of simultaneously in-flight webhook deliveries.
pub const DEFAULT_MAX_CONCURRENT_WEBHOOKS: usize = 10;

/// Default capacity of the channel between a subscription and its intake loop.
pub const DEFAULT_INTAKE_BUFFER: usize = 16;

/// Default number of extra attempts for the column update after a successful add.
pub const DEFAULT_PERSIST_RETRIES: u32 = 2;

/// Default topic carrying pin/unpin requests.
pub const DEFAULT_REQUEST_TOPIC: &str = "pin_requests";

/// Default topic carrying webhook notifications.
pub const DEFAULT_WEBHOOK_TOPIC: &str = "webhooks";

/// Default consumer channel name.
pub const DEFAULT_CHANNEL: &str = "pinner";

/// Default nsqlookupd HTTP address.
pub const DEFAULT_LOOKUPD_ADDRESS: &str = "http://127.0.0.1:4161";

/// Default nsqd TCP address used by producers.
pub const DEFAULT_NSQD_ADDRESS: &str = "127.0.0.1:4150";

/// Default number of messages nsqd may push before they are finished.
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 1;

/// Default interval between nsqlookupd polls.
pub const DEFAULT_LOOKUPD_POLL_INTERVAL_SECS: u64 = 30;

/// Default IPFS RPC API address.
pub const DEFAULT_NETWORK_API_URL: &str = "http://127.0.0.1:5001";

/// Default timeout for a single content-network request.
///
/// Adds of large directories stream the whole tree, so this is generous.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 300;

/// Default timeout for a webhook POST.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Default prefix for scratch directories.
pub const DEFAULT_SCRATCH_PREFIX: &str = "pinnerd-";

/// Default SQLite database path.
pub const DEFAULT_DATABASE_PATH: &str = "pinnerd.db";

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Path of the manual re-pin endpoint, relative to the retry base URL.
pub const RETRY_PIN_PATH: &str = "/auth/storage/pin/id";

/// Maximum accepted NSQ frame size (nsqd default `--max-msg-size` plus headroom).
pub const MAX_NSQ_FRAME_SIZE: usize = 1024 * 1024 + 1024;
