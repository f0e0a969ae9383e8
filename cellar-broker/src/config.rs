// cellar-broker/src/config.rs
// Broker connection configuration

use serde::Deserialize;
use std::time::Duration;

/// Configuration for a broker client instance.
///
/// Deserializable so the composition root can load it from whatever config
/// source the application uses; every field has a sensible default so a
/// partial document works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  /// Gateway/TWS host.
  pub host: String,
  /// Gateway/TWS port.
  pub port: u16,
  /// Client id presented to the broker. Each concurrent connection needs a
  /// distinct id; the composition root may randomize it.
  pub client_id: i32,
  /// Maximum time to wait for the connection handshake to complete.
  pub connect_timeout_secs: u64,
  /// Maximum time to wait for a blocking request (historical bars,
  /// contract details) before giving up and discarding partial data.
  pub request_timeout_secs: u64,
  /// Per-listener bounded queue capacity on the event bridge. When full,
  /// the oldest event is dropped in favor of the newest.
  pub event_queue_capacity: usize,
  /// Number of worker threads in the background task pool.
  pub worker_threads: usize,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    BrokerConfig {
      host: "127.0.0.1".to_string(),
      port: 7497,
      client_id: 1,
      connect_timeout_secs: 10,
      request_timeout_secs: 60,
      event_queue_capacity: 256,
      worker_threads: 4,
    }
  }
}

impl BrokerConfig {
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_document_fills_defaults() {
    let cfg: BrokerConfig = serde_json::from_str(r#"{"host": "10.0.0.5", "port": 4002}"#).unwrap();
    assert_eq!(cfg.host, "10.0.0.5");
    assert_eq!(cfg.port, 4002);
    assert_eq!(cfg.client_id, 1);
    assert_eq!(cfg.event_queue_capacity, 256);
    assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
  }
}
