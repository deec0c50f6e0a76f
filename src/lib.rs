pub mod config;
mod error;
pub mod failover;
pub mod http;
pub mod interop;
pub mod keypool;
pub mod normalize;
pub mod pacing;
pub mod scheduler;
pub mod sse;
pub mod upstream;

pub use config::{KeyCheckSettings, PacingSettings, RelayConfig};
pub use error::{RelayError, Result};
pub use failover::{
    LogOutcomeSink, OutcomeSink, RequestOutcome, RetryPolicy, send_with_failover,
};
pub use keypool::{KeyPool, KeyPoolStatus, PoolSnapshot, SharedKeyPool, redact_key};
pub use pacing::StreamPacer;
pub use upstream::{GeminiClient, KeyAuth};
