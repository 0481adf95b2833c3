//! AI gateway infrastructure: HTTP client, retry, adaptive concurrency,
//! and cost accounting behind one `complete` surface.

pub mod cost;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod limiter;
pub mod retry;

pub use cost::{price_for, CostLedger};
pub use gateway::{AiGateway, PurposeUsage};
pub use http_client::HttpCompletionClient;
pub use limiter::{AdaptiveLimiter, LimiterPermit};
pub use retry::RetryPolicy;
