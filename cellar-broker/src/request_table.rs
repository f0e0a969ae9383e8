// cellar-broker/src/request_table.rs
// Request/subscription correlation table

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::base::RequestId;
use crate::contract::{Contract, StreamKind, SubscriptionKey};
use crate::data::{Bar, ResponseCallback};

/// Bookkeeping for one active request.
#[derive(Clone)]
pub struct RequestRecord {
  pub req_id: RequestId,
  pub symbol: String,
  pub local_symbol: String,
  pub kind: Option<StreamKind>,
}

// All maps live behind one mutex so every operation mutates them as a
// single atomic unit. Expected volume is tens of concurrent requests, so a
// single lock is plenty.
#[derive(Default)]
struct TableState {
  counter: RequestId,
  requests: HashMap<RequestId, RequestRecord>,
  callbacks: HashMap<RequestId, ResponseCallback>,
  accumulators: HashMap<RequestId, Vec<Bar>>,
  key_to_id: HashMap<SubscriptionKey, RequestId>,
}

/// Thread-safe correlation between request ids and callbacks, subscription
/// keys, and accumulation buffers for multi-part responses.
///
/// Unknown ids are never an error anywhere in this table: late callbacks
/// for cancelled requests are routine, so absence comes back as `None` or
/// an empty result.
pub struct RequestTable {
  state: Mutex<TableState>,
}

impl RequestTable {
  pub fn new() -> Self {
    RequestTable {
      state: Mutex::new(TableState::default()),
    }
  }

  /// Allocate a fresh, never-before-issued request id.
  pub fn next_id(&self) -> RequestId {
    let mut state = self.state.lock();
    state.counter += 1;
    state.counter
  }

  /// Atomic check-and-set on the subscription key. Returns the existing
  /// mapping untouched (`existed == true`), or allocates a new id and
  /// registers both directions of the mapping.
  ///
  /// Callers use `existed` to decide whether to issue a broker-level
  /// subscribe or just attach to the already-open stream.
  pub fn get_or_create(&self, contract: &Contract, kind: StreamKind) -> (bool, RequestId) {
    let key = SubscriptionKey::for_contract(contract, kind);
    let mut state = self.state.lock();

    if let Some(&req_id) = state.key_to_id.get(&key) {
      trace!("Subscription exists: {} -> req_id={}", key, req_id);
      return (true, req_id);
    }

    state.counter += 1;
    let req_id = state.counter;
    state.key_to_id.insert(key.clone(), req_id);
    state.requests.insert(req_id, RequestRecord {
      req_id,
      symbol: contract.symbol.clone(),
      local_symbol: contract.local_symbol.clone(),
      kind: Some(kind),
    });
    debug!("New subscription: {} -> req_id={}", key, req_id);
    (false, req_id)
  }

  /// Look up the request id for a live subscription, if any.
  pub fn request_for_key(&self, key: &SubscriptionKey) -> Option<RequestId> {
    self.state.lock().key_to_id.get(key).copied()
  }

  /// Associate (or replace) the delivery function for an id. Idempotent:
  /// re-registering overwrites, it never appends a second delivery path.
  pub fn register_callback(&self, req_id: RequestId, callback: ResponseCallback) {
    let mut state = self.state.lock();
    state.callbacks.insert(req_id, callback);
    state.requests.entry(req_id).or_insert_with(|| RequestRecord {
      req_id,
      symbol: String::new(),
      local_symbol: String::new(),
      kind: None,
    });
  }

  /// Delivery function for an id, `None` if unknown or removed. The `None`
  /// path is expected for events arriving after cancellation.
  pub fn lookup_callback(&self, req_id: RequestId) -> Option<ResponseCallback> {
    self.state.lock().callbacks.get(&req_id).cloned()
  }

  /// (symbol, local_symbol) for an id, `None` if unknown.
  pub fn contract_info(&self, req_id: RequestId) -> Option<(String, String)> {
    self
      .state
      .lock()
      .requests
      .get(&req_id)
      .map(|r| (r.symbol.clone(), r.local_symbol.clone()))
  }

  /// Delete the record, the key mapping, the callback, and any accumulator
  /// for an id, atomically. Safe to call twice; the second call is a no-op.
  pub fn remove(&self, req_id: RequestId) {
    let mut state = self.state.lock();
    if let Some(record) = state.requests.remove(&req_id) {
      if let Some(kind) = record.kind {
        let key = SubscriptionKey::new(&record.symbol, &record.local_symbol, kind);
        state.key_to_id.remove(&key);
      }
      debug!("Removed request {}", req_id);
    }
    state.callbacks.remove(&req_id);
    state.accumulators.remove(&req_id);
  }

  /// Number of live requests, for diagnostics.
  pub fn active_requests(&self) -> usize {
    self.state.lock().requests.len()
  }

  // --- Accumulation buffers for multi-part responses ---

  /// Start accumulating for an id. Rows arriving before this call, or
  /// after `remove`, are discarded.
  pub fn init_accumulator(&self, req_id: RequestId) {
    self.state.lock().accumulators.insert(req_id, Vec::new());
  }

  /// Append one row. Silent no-op when no accumulator is initialized for
  /// the id; the row is presumed stale or cancelled.
  pub fn append(&self, req_id: RequestId, bar: Bar) {
    let mut state = self.state.lock();
    if let Some(buf) = state.accumulators.get_mut(&req_id) {
      buf.push(bar);
    } else {
      trace!("Dropping bar for unknown accumulator {}", req_id);
    }
  }

  /// Take the accumulated rows, leaving no accumulator behind. Empty when
  /// the id is unknown.
  pub fn drain(&self, req_id: RequestId) -> Vec<Bar> {
    self.state.lock().accumulators.remove(&req_id).unwrap_or_default()
  }

  /// Discard any accumulated rows for an id.
  pub fn clear(&self, req_id: RequestId) {
    self.state.lock().accumulators.remove(&req_id);
  }
}

impl Default for RequestTable {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::BrokerResponse;
  use chrono::Utc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Barrier};
  use std::thread;

  fn bar(close: f64) -> Bar {
    Bar { time: Utc::now(), open: close, high: close, low: close, close, volume: 0.0 }
  }

  #[test]
  fn next_id_unique_across_threads() {
    let table = Arc::new(RequestTable::new());
    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
      let table = table.clone();
      let barrier = barrier.clone();
      handles.push(thread::spawn(move || {
        barrier.wait();
        (0..100).map(|_| table.next_id()).collect::<Vec<_>>()
      }));
    }
    let mut all: Vec<RequestId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 800);
  }

  #[test]
  fn get_or_create_races_resolve_to_one_winner() {
    let table = Arc::new(RequestTable::new());
    let barrier = Arc::new(Barrier::new(8));
    let created = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
      let table = table.clone();
      let barrier = barrier.clone();
      let created = created.clone();
      handles.push(thread::spawn(move || {
        barrier.wait();
        let (existed, req_id) = table.get_or_create(&Contract::stock("AAPL"), StreamKind::TickPrice);
        if !existed {
          created.fetch_add(1, Ordering::SeqCst);
        }
        req_id
      }));
    }
    let ids: Vec<RequestId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(ids.iter().all(|&id| id == ids[0]));
  }

  #[test]
  fn remove_is_idempotent_and_releases_key() {
    let table = RequestTable::new();
    let contract = Contract::stock("MSFT");
    let (_, req_id) = table.get_or_create(&contract, StreamKind::TickPrice);
    table.register_callback(req_id, Arc::new(|_| {}));
    table.init_accumulator(req_id);

    table.remove(req_id);
    table.remove(req_id); // no-op

    assert!(table.lookup_callback(req_id).is_none());
    assert!(table.contract_info(req_id).is_none());
    let key = SubscriptionKey::for_contract(&contract, StreamKind::TickPrice);
    assert!(table.request_for_key(&key).is_none());

    // The key is free again; a fresh subscription gets a fresh id.
    let (existed, new_id) = table.get_or_create(&contract, StreamKind::TickPrice);
    assert!(!existed);
    assert_ne!(new_id, req_id);
  }

  #[test]
  fn unknown_ids_are_not_errors() {
    let table = RequestTable::new();
    assert!(table.lookup_callback(9999).is_none());
    table.append(9999, bar(1.0)); // must not allocate a phantom record
    assert!(table.drain(9999).is_empty());
    assert_eq!(table.active_requests(), 0);
  }

  #[test]
  fn accumulator_roundtrip() {
    let table = RequestTable::new();
    let req_id = table.next_id();
    table.append(req_id, bar(1.0)); // before init: dropped
    table.init_accumulator(req_id);
    table.append(req_id, bar(2.0));
    table.append(req_id, bar(3.0));
    let bars = table.drain(req_id);
    assert_eq!(bars.len(), 2);
    assert_eq!(bars[0].close, 2.0);
    // Drained: further appends are dropped.
    table.append(req_id, bar(4.0));
    assert!(table.drain(req_id).is_empty());
  }

  #[test]
  fn register_callback_overwrites() {
    let table = RequestTable::new();
    let req_id = table.next_id();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    {
      let first = first.clone();
      table.register_callback(req_id, Arc::new(move |_| { first.fetch_add(1, Ordering::SeqCst); }));
    }
    {
      let second = second.clone();
      table.register_callback(req_id, Arc::new(move |_| { second.fetch_add(1, Ordering::SeqCst); }));
    }
    table.lookup_callback(req_id).unwrap()(BrokerResponse::Done);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
  }
}
