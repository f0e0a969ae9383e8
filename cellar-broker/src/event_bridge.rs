// cellar-broker/src/event_bridge.rs
// Cross-thread hand-off of market events from the I/O thread to listeners

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::contract::SubscriptionKey;
use crate::data::MarketEvent;

const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

struct Listener {
  key: SubscriptionKey,
  tx: Sender<MarketEvent>,
  // Publisher-side clone of the receiver, used only to discard the oldest
  // queued event when the channel is full.
  drain: Receiver<MarketEvent>,
  dropped: u64,
  last_drop_warn: Option<Instant>,
}

/// Relay moving events from the producing I/O thread to consumer threads.
///
/// Each listener owns a bounded queue; `publish` never blocks the I/O
/// thread. A slow consumer loses its *oldest* queued events first, since a
/// stale live quote is worth less than the newest one. Per-key publish
/// order is preserved end-to-end because publication happens from the
/// single I/O thread.
pub struct EventBridge {
  listeners: Mutex<HashMap<u64, Listener>>,
  next_id: AtomicU64,
  capacity: usize,
}

impl EventBridge {
  pub fn new(capacity: usize) -> Self {
    EventBridge {
      listeners: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      capacity: capacity.max(1),
    }
  }

  /// Register a listener for one subscription key. The returned receiver
  /// sees only events whose key matches, in publish order.
  pub fn subscribe(&self, key: SubscriptionKey) -> (ListenerId, Receiver<MarketEvent>) {
    let (tx, rx) = bounded(self.capacity);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let listener = Listener {
      key: key.clone(),
      tx,
      drain: rx.clone(),
      dropped: 0,
      last_drop_warn: None,
    };
    self.listeners.lock().insert(id, listener);
    debug!("Listener {} subscribed to {}", id, key);
    (ListenerId(id), rx)
  }

  /// Remove a listener. Events already queued but undelivered are dropped;
  /// the listener is going away anyway.
  pub fn unsubscribe(&self, id: ListenerId) {
    if self.listeners.lock().remove(&id.0).is_some() {
      debug!("Listener {} unsubscribed", id.0);
    }
  }

  /// Number of listeners registered for a key.
  pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
    self.listeners.lock().values().filter(|l| &l.key == key).count()
  }

  /// Deliver an event to every listener registered for its key. Called from
  /// the I/O thread; events with no registered listener are discarded
  /// without error. Queue overflow drops the oldest event and logs at a
  /// throttled rate, never raising to the publisher.
  pub fn publish(&self, event: MarketEvent) {
    let key = event.key();
    let mut listeners = self.listeners.lock();
    for (id, listener) in listeners.iter_mut() {
      if listener.key != key {
        continue;
      }
      match listener.tx.try_send(event.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(ev)) => {
          // Drop-oldest: discard the head of the queue, then retry once.
          let _ = listener.drain.try_recv();
          listener.dropped += 1;
          if listener.tx.try_send(ev).is_err() {
            // Receiver side gone; next publish with no match cleans nothing,
            // but unsubscribe is the real cleanup path.
          }
          let now = Instant::now();
          let should_warn = listener
            .last_drop_warn
            .map_or(true, |t| now.duration_since(t) >= DROP_WARN_INTERVAL);
          if should_warn {
            warn!(
              "Listener {} for {} is slow; dropped {} event(s) so far",
              id, listener.key, listener.dropped
            );
            listener.last_drop_warn = Some(now);
          }
        }
        Err(TrySendError::Disconnected(_)) => {
          // Receiver dropped without unsubscribing; stop delivering quietly.
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::contract::StreamKind;
  use crate::data::{TickEvent, TickKind};
  use chrono::Utc;
  use std::thread;

  fn tick(symbol: &str, value: f64) -> MarketEvent {
    MarketEvent::Tick(TickEvent {
      req_id: 1,
      symbol: symbol.to_string(),
      local_symbol: String::new(),
      kind: TickKind::Last,
      value,
      timestamp: Utc::now(),
    })
  }

  fn key(symbol: &str) -> SubscriptionKey {
    SubscriptionKey::new(symbol, "", StreamKind::TickPrice)
  }

  fn value_of(event: &MarketEvent) -> f64 {
    match event {
      MarketEvent::Tick(t) => t.value,
      _ => panic!("expected tick"),
    }
  }

  #[test]
  fn per_key_order_preserved() {
    let bridge = EventBridge::new(16);
    let (_, rx) = bridge.subscribe(key("AAPL"));
    for v in [1.0, 2.0, 3.0] {
      bridge.publish(tick("AAPL", v));
    }
    let got: Vec<f64> = (0..3).map(|_| value_of(&rx.recv().unwrap())).collect();
    assert_eq!(got, vec![1.0, 2.0, 3.0]);
  }

  #[test]
  fn events_filtered_by_key() {
    let bridge = EventBridge::new(16);
    let (_, rx_aapl) = bridge.subscribe(key("AAPL"));
    let (_, rx_msft) = bridge.subscribe(key("MSFT"));
    bridge.publish(tick("AAPL", 10.0));
    bridge.publish(tick("MSFT", 20.0));
    assert_eq!(value_of(&rx_aapl.recv().unwrap()), 10.0);
    assert_eq!(value_of(&rx_msft.recv().unwrap()), 20.0);
    assert!(rx_aapl.try_recv().is_err());
  }

  #[test]
  fn unregistered_key_discarded_silently() {
    let bridge = EventBridge::new(16);
    bridge.publish(tick("NOBODY", 1.0)); // must not panic or error
  }

  #[test]
  fn two_listeners_same_key_both_receive() {
    let bridge = EventBridge::new(16);
    let (id_a, rx_a) = bridge.subscribe(key("AAPL"));
    let (_id_b, rx_b) = bridge.subscribe(key("AAPL"));
    assert_eq!(bridge.listener_count(&key("AAPL")), 2);

    bridge.publish(tick("AAPL", 1.0));
    assert_eq!(value_of(&rx_a.recv().unwrap()), 1.0);
    assert_eq!(value_of(&rx_b.recv().unwrap()), 1.0);

    // Removing one leaves the other receiving uninterrupted.
    bridge.unsubscribe(id_a);
    bridge.publish(tick("AAPL", 2.0));
    assert_eq!(value_of(&rx_b.recv().unwrap()), 2.0);
    assert!(rx_a.try_recv().is_err());
  }

  #[test]
  fn overflow_drops_oldest() {
    let bridge = EventBridge::new(2);
    let (_, rx) = bridge.subscribe(key("AAPL"));
    for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
      bridge.publish(tick("AAPL", v));
    }
    // Capacity 2, drop-oldest: only the two newest remain.
    assert_eq!(value_of(&rx.recv().unwrap()), 4.0);
    assert_eq!(value_of(&rx.recv().unwrap()), 5.0);
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn publish_from_producer_thread() {
    let bridge = std::sync::Arc::new(EventBridge::new(64));
    let (_, rx) = bridge.subscribe(key("CL"));
    let publisher = {
      let bridge = bridge.clone();
      thread::spawn(move || {
        for v in 0..50 {
          bridge.publish(tick("CL", v as f64));
        }
      })
    };
    publisher.join().unwrap();
    let got: Vec<f64> = (0..50).map(|_| value_of(&rx.recv().unwrap())).collect();
    let expected: Vec<f64> = (0..50).map(|v| v as f64).collect();
    assert_eq!(got, expected);
  }
}
