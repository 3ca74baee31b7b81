//! Scout Resilience - recovery primitives for live audio streaming
//!
//! This crate keeps a live transcription pipeline alive across Wi-Fi drops,
//! audio devices disappearing mid-meeting, and a remote service that becomes
//! slow or unreachable. It provides:
//!
//! - A three-state circuit breaker with a sliding failure window
//! - An exponential backoff policy with bounded jitter
//! - A self-healing connection that buffers outbound audio across outages
//! - A primary/backup audio source failover manager with hysteresis
//! - A device hot-swap coordinator that restarts capture under a deadline
//!
//! # Example
//!
//! ```rust,no_run
//! use scout_resilience::{
//!     connection::{ReconnectionConfig, ResilientConnection},
//!     connection::zeromq::ZmqTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connection = ResilientConnection::new(
//!         "tcp://127.0.0.1:5555",
//!         ZmqTransport::default(),
//!         ReconnectionConfig::default(),
//!     );
//!     let mut states = connection.subscribe();
//!
//!     connection.connect();
//!     connection.send(vec![0u8; 640]).await;
//!
//!     if let Some(state) = states.recv().await {
//!         println!("connection is now {}", state);
//!     }
//!
//!     connection.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod connection;
pub mod hotswap;
pub mod redundancy;
pub mod settings;

// Re-export commonly used types for convenience
pub use backoff::BackoffPolicy;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection::{ConnectionState, ConnectionStats, ReconnectionConfig, ResilientConnection};
pub use hotswap::{DeviceHotSwapManager, DeviceNotificationCenter, DeviceStatus, HotSwapConfig};
pub use redundancy::{
    AudioQuality, AudioSource, FailoverEvent, FailoverThresholds, RedundancyHealth,
    RedundancyStats, RedundantCaptureManager,
};
pub use settings::SettingsStore;

// Error types
use thiserror::Error;

/// Errors that can occur in the scout-resilience system
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Settings store could not be read or written
    #[error("Settings error: {message}")]
    Settings { message: String },

    /// Transport-level failure surfaced to a caller
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for scout-resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
/// Guarded state here is always left consistent between statements.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
