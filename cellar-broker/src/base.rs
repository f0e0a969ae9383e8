// cellar-broker/src/base.rs
// Base types and error definitions for the broker core

use thiserror::Error;

/// Opaque identifier correlating an outbound request with its asynchronous
/// inbound answer(s). Monotonically increasing, never reused while the
/// request is active.
pub type RequestId = i32;

/// Errors that can occur in the broker core.
///
/// Correlation misses (unknown request ids) are deliberately *not* part of
/// this taxonomy: broker callbacks for cancelled requests are routine, so
/// lookups return `Option`/empty instead of an error.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected to broker")]
  NotConnected,

  #[error("Already connected to broker")]
  AlreadyConnected,

  #[error("Thread already running: {0}")]
  AlreadyRunning(String),

  #[error("Transport error: {0}")]
  TransportError(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Shutting down")]
  Shutdown,

  #[error("Internal error: {0}")]
  InternalError(String),

  #[error("API error: code={0}, msg={1}")]
  ApiError(i32, String),
}
