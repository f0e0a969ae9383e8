// cellar-broker/src/client.rs
// Broker client composition: correlation table + supervisor + bridge + threads

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::base::{BrokerError, RequestId};
use crate::config::BrokerConfig;
use crate::contract::{Contract, StreamKind, SubscriptionKey};
use crate::data::{
  Bar, BarBatch, BarRepository, BrokerResponse, ContractDetails, MarketEvent, ResponseCallback,
  TickEvent, TickKind,
};
use crate::event_bridge::{EventBridge, ListenerId};
use crate::request_table::RequestTable;
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::thread_manager::{TaskHandle, ThreadManager};
use crate::transport::{BrokerTransport, TransportEvents, TransportRequest};

/// Name of the single long-lived thread driving the transport's blocking
/// I/O loop. Registering it twice means two components are fighting over
/// the connection, which the thread manager rejects.
const IO_THREAD: &str = "broker-io";

// Broker status codes sorted by how much we care.
const CONNECTION_ERROR_CODES: &[i32] = &[502, 504, 1100, 1101, 1102];
const INFO_CODES: &[i32] = &[2104, 2106, 2108, 2119, 2157, 2158];
const WARNING_CODES: &[i32] = &[354, 2174, 2176, 10167, 10168];
const NO_DATA_CODES: &[i32] = &[162, 165, 166, 200, 366];

/// A live market data subscription: the broker-level request id plus this
/// caller's private listener on the event bridge. Dropping the receiver
/// does not cancel the broker stream; see `unsubscribe_market_data`.
pub struct Subscription {
  pub req_id: RequestId,
  pub listener: ListenerId,
  pub events: Receiver<MarketEvent>,
  pub key: SubscriptionKey,
}

// Inbound surface handed to the transport. Runs on the I/O thread; every
// method hands off through the table or the bridge and returns quickly.
struct ClientEvents {
  table: Arc<RequestTable>,
  supervisor: Arc<ConnectionSupervisor>,
  bridge: Arc<EventBridge>,
}

impl TransportEvents for ClientEvents {
  fn on_connected(&self) {
    self.supervisor.mark_connected();
  }

  fn on_connection_closed(&self) {
    info!("Broker closed the connection");
    self.supervisor.disconnect();
  }

  fn on_tick(&self, req_id: RequestId, kind: TickKind, value: f64) {
    let (symbol, local_symbol) = match self.table.contract_info(req_id) {
      Some(info) => info,
      None => {
        // Routine: late tick for a cancelled subscription.
        trace!("Dropping tick for unknown req_id={}", req_id);
        return;
      }
    };
    let tick = TickEvent {
      req_id,
      symbol,
      local_symbol,
      kind,
      value,
      timestamp: Utc::now(),
    };
    if let Some(cb) = self.table.lookup_callback(req_id) {
      cb(BrokerResponse::Tick(tick.clone()));
    }
    self.bridge.publish(MarketEvent::Tick(tick));
  }

  fn on_historical_bar(&self, req_id: RequestId, bar: Bar) {
    self.table.append(req_id, bar);
  }

  fn on_historical_end(&self, req_id: RequestId) {
    let bars = self.table.drain(req_id);
    let (symbol, local_symbol) = self.table.contract_info(req_id).unwrap_or_default();
    debug!("Historical data complete: req_id={}, {} bar(s)", req_id, bars.len());
    let batch = BarBatch { req_id, symbol, local_symbol, bars };
    if let Some(cb) = self.table.lookup_callback(req_id) {
      cb(BrokerResponse::Bars(batch.clone()));
    }
    self.bridge.publish(MarketEvent::Bars(batch));
  }

  fn on_contract_details(&self, req_id: RequestId, details: ContractDetails) {
    if let Some(cb) = self.table.lookup_callback(req_id) {
      cb(BrokerResponse::ContractDetails(details));
    }
  }

  fn on_contract_details_end(&self, req_id: RequestId) {
    if let Some(cb) = self.table.lookup_callback(req_id) {
      cb(BrokerResponse::Done);
    }
  }

  fn on_error(&self, req_id: RequestId, code: i32, message: &str) {
    if CONNECTION_ERROR_CODES.contains(&code) {
      error!("Broker connection error: code={}: {}", code, message);
      self.supervisor.mark_error(message);
      return;
    }
    if INFO_CODES.contains(&code) {
      info!("Broker info: req_id={}, code={}: {}", req_id, code, message);
      return;
    }
    if WARNING_CODES.contains(&code) {
      warn!("Broker warning: req_id={}, code={}: {}", req_id, code, message);
      return;
    }
    if NO_DATA_CODES.contains(&code) {
      warn!("Broker no data: req_id={}, code={}: {}", req_id, code, message);
      if let Some(cb) = self.table.lookup_callback(req_id) {
        cb(BrokerResponse::Done);
      }
      return;
    }
    error!("Broker error: req_id={}, code={}: {}", req_id, code, message);
    if let Some(cb) = self.table.lookup_callback(req_id) {
      cb(BrokerResponse::Failed { code, message: message.to_string() });
    }
  }
}

/// The broker client core. Explicitly constructed by the composition root
/// and passed by reference to dependents; multiple independent instances
/// can coexist (one per connection, and freely in tests).
pub struct BrokerClient {
  config: BrokerConfig,
  transport: Arc<dyn BrokerTransport>,
  table: Arc<RequestTable>,
  supervisor: Arc<ConnectionSupervisor>,
  bridge: Arc<EventBridge>,
  threads: Arc<ThreadManager>,
  repository: Option<Arc<dyn BarRepository>>,
}

impl BrokerClient {
  pub fn new(
    config: BrokerConfig,
    transport: Arc<dyn BrokerTransport>,
    repository: Option<Arc<dyn BarRepository>>,
  ) -> Self {
    let bridge = Arc::new(EventBridge::new(config.event_queue_capacity));
    let threads = ThreadManager::new(config.worker_threads);
    info!("BrokerClient created for {}:{} (client_id={})", config.host, config.port, config.client_id);
    BrokerClient {
      config,
      transport,
      table: Arc::new(RequestTable::new()),
      supervisor: ConnectionSupervisor::new(),
      bridge,
      threads,
      repository,
    }
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.supervisor.state()
  }

  pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
    self.supervisor.clone()
  }

  pub fn request_table(&self) -> Arc<RequestTable> {
    self.table.clone()
  }

  pub fn bridge(&self) -> Arc<EventBridge> {
    self.bridge.clone()
  }

  pub fn threads(&self) -> Arc<ThreadManager> {
    self.threads.clone()
  }

  /// Connect to the broker: spawn the dedicated I/O thread and block until
  /// the handshake completes, fails, or times out. The I/O loop owns the
  /// socket for the life of the connection; if its body exits without ever
  /// confirming the handshake, waiters are released with an error rather
  /// than left hanging.
  pub fn connect(&self) -> Result<(), BrokerError> {
    self.supervisor.begin_connect()?;

    if let Err(e) = self.transport.connect() {
      self.supervisor.mark_error(&e.to_string());
      return Err(e);
    }

    let events: Arc<dyn TransportEvents> = Arc::new(ClientEvents {
      table: self.table.clone(),
      supervisor: self.supervisor.clone(),
      bridge: self.bridge.clone(),
    });
    let transport = self.transport.clone();
    let supervisor = self.supervisor.clone();

    let io_thread = match self.threads.register_thread(IO_THREAD, move |stop| {
      let _guard = supervisor.io_guard();
      transport.run(events, &stop)
    }, false) {
      Ok(t) => t,
      Err(e) => {
        self.supervisor.mark_error(&format!("I/O thread registration failed: {}", e));
        return Err(e);
      }
    };
    if let Err(e) = io_thread.start() {
      self.supervisor.mark_error(&format!("I/O thread failed to start: {}", e));
      return Err(e);
    }

    match self.supervisor.await_ready(self.config.connect_timeout()) {
      Ok(()) => Ok(()),
      Err(BrokerError::Timeout(msg)) => {
        self.supervisor.mark_error("connection timeout");
        Err(BrokerError::Timeout(msg))
      }
      Err(e) => Err(e),
    }
  }

  /// Subscribe to streaming market data for a contract, deduplicating
  /// against already-open streams: a second subscription to the same
  /// (symbol, local symbol) attaches a new listener to the existing
  /// broker-level request instead of issuing another one.
  ///
  /// The optional callback is (re)registered on the request either way and
  /// fires on the I/O thread; the returned receiver delivers on whatever
  /// thread the caller reads it from.
  pub fn subscribe_market_data(
    &self,
    contract: &Contract,
    callback: Option<ResponseCallback>,
  ) -> Result<Subscription, BrokerError> {
    self.supervisor.await_ready(self.config.connect_timeout())?;

    let (existed, req_id) = self.table.get_or_create(contract, StreamKind::TickPrice);
    if let Some(cb) = callback {
      self.table.register_callback(req_id, cb);
    }
    let key = SubscriptionKey::for_contract(contract, StreamKind::TickPrice);
    let (listener, events) = self.bridge.subscribe(key.clone());

    if !existed {
      let request = TransportRequest::MarketData { contract: contract.clone() };
      if let Err(e) = self.transport.send_request(req_id, &request) {
        self.bridge.unsubscribe(listener);
        self.table.remove(req_id);
        return Err(e);
      }
      info!("Subscribed: req_id={}, {}", req_id, key);
    } else {
      debug!("Attached to existing subscription: req_id={}, {}", req_id, key);
    }

    Ok(Subscription { req_id, listener, events, key })
  }

  /// Detach one listener without touching the broker-level stream. Other
  /// listeners on the same key keep receiving.
  pub fn drop_listener(&self, listener: ListenerId) {
    self.bridge.unsubscribe(listener);
  }

  /// Cancel the broker-level stream for a contract and release all local
  /// bookkeeping. Late events for the old id are discarded silently. The
  /// I/O thread is never interrupted; this only removes bookkeeping.
  pub fn unsubscribe_market_data(&self, contract: &Contract) {
    let key = SubscriptionKey::for_contract(contract, StreamKind::TickPrice);
    match self.table.request_for_key(&key) {
      Some(req_id) => {
        if let Err(e) = self.transport.cancel_request(req_id) {
          warn!("Cancel failed for req_id={}: {}", req_id, e);
        }
        self.table.remove(req_id);
        info!("Unsubscribed: req_id={}, {}", req_id, key);
      }
      None => warn!("No subscription found for {}", key),
    }
  }

  /// Fetch historical bars, blocking until the terminal end marker arrives
  /// or the configured request timeout elapses. On timeout the partially
  /// accumulated buffer is discarded and the request cancelled; historical
  /// data is only ever delivered whole.
  pub fn request_historical_bars(
    &self,
    contract: &Contract,
    duration: &str,
    bar_size: &str,
    what_to_show: &str,
  ) -> Result<Vec<Bar>, BrokerError> {
    fetch_historical(
      &self.table,
      self.transport.as_ref(),
      &self.supervisor,
      contract,
      duration,
      bar_size,
      what_to_show,
      self.config.connect_timeout(),
      self.config.request_timeout(),
    )
  }

  /// Look up contract reference data, blocking until the end marker.
  /// Ambiguous contracts yield multiple entries.
  pub fn request_contract_details(
    &self,
    contract: &Contract,
  ) -> Result<Vec<ContractDetails>, BrokerError> {
    self.supervisor.await_ready(self.config.connect_timeout())?;

    let req_id = self.table.next_id();
    let (tx, rx) = bounded::<BrokerResponse>(16);
    self.table.register_callback(req_id, Arc::new(move |resp| {
      let _ = tx.try_send(resp);
    }));

    let request = TransportRequest::ContractDetails { contract: contract.clone() };
    if let Err(e) = self.transport.send_request(req_id, &request) {
      self.table.remove(req_id);
      return Err(e);
    }

    let deadline = Instant::now() + self.config.request_timeout();
    let mut acc = Vec::new();
    loop {
      let now = Instant::now();
      if now >= deadline {
        let _ = self.transport.cancel_request(req_id);
        self.table.remove(req_id);
        return Err(BrokerError::Timeout(format!(
          "contract details for {} after {:?}", contract.symbol, self.config.request_timeout()
        )));
      }
      match rx.recv_timeout(deadline - now) {
        Ok(BrokerResponse::ContractDetails(d)) => acc.push(d),
        Ok(BrokerResponse::Done) => {
          self.table.remove(req_id);
          return Ok(acc);
        }
        Ok(BrokerResponse::Failed { code, message }) => {
          self.table.remove(req_id);
          return Err(BrokerError::ApiError(code, message));
        }
        Ok(_) => {}
        Err(_) => {
          let _ = self.transport.cancel_request(req_id);
          self.table.remove(req_id);
          return Err(BrokerError::Timeout(format!(
            "contract details for {}", contract.symbol
          )));
        }
      }
    }
  }

  /// Fire-and-forget historical download on the worker pool, keyed by the
  /// contract, with the completed batch handed to the configured
  /// repository. Submitting again for the same contract supersedes the
  /// in-flight download.
  pub fn download_historical(
    &self,
    contract: &Contract,
    duration: &str,
    bar_size: &str,
    timeframe: &str,
  ) -> Result<TaskHandle, BrokerError> {
    let repository = self.repository.clone().ok_or_else(|| {
      BrokerError::ConfigurationError("no bar repository configured".to_string())
    })?;

    let task_id = format!("download:{}/{}", contract.symbol, contract.local_symbol);
    let table = self.table.clone();
    let transport = self.transport.clone();
    let supervisor = self.supervisor.clone();
    let contract = contract.clone();
    let duration = duration.to_string();
    let bar_size = bar_size.to_string();
    let timeframe = timeframe.to_string();
    let connect_timeout = self.config.connect_timeout();
    let request_timeout = self.config.request_timeout();

    self.threads.submit_task(&task_id, move |cancel| {
      if cancel.is_cancelled() {
        return Ok(());
      }
      let bars = fetch_historical(
        &table,
        transport.as_ref(),
        &supervisor,
        &contract,
        &duration,
        &bar_size,
        "TRADES",
        connect_timeout,
        request_timeout,
      )?;
      if cancel.is_cancelled() {
        debug!("Download for {} superseded; discarding {} bar(s)", contract.symbol, bars.len());
        return Ok(());
      }
      info!("Saving {} bar(s) for {} [{}]", bars.len(), contract.symbol, timeframe);
      repository.save(&contract.symbol, &timeframe, &bars)
    })
  }

  /// Close the connection: stop the I/O loop cooperatively and return the
  /// supervisor to Disconnected so a later `connect` can retry.
  pub fn disconnect(&self) {
    let _ = self.transport.disconnect();
    self.threads.signal_stop(IO_THREAD);
    if let Some(t) = self.threads.thread(IO_THREAD) {
      if !t.join_timeout(Duration::from_secs(2)) {
        warn!("I/O thread did not stop in time; detaching");
      }
    }
    self.supervisor.disconnect();
  }

  /// Disconnect and tear down all managed threads and the worker pool.
  /// Threads that ignore their stop signal are logged and abandoned; the
  /// process must still be able to exit.
  pub fn shutdown(&self, timeout: Duration) {
    self.disconnect();
    self.threads.shutdown(true, timeout);
  }
}

// Shared by the blocking request path and pool download tasks.
#[allow(clippy::too_many_arguments)]
fn fetch_historical(
  table: &RequestTable,
  transport: &dyn BrokerTransport,
  supervisor: &ConnectionSupervisor,
  contract: &Contract,
  duration: &str,
  bar_size: &str,
  what_to_show: &str,
  connect_timeout: Duration,
  request_timeout: Duration,
) -> Result<Vec<Bar>, BrokerError> {
  supervisor.await_ready(connect_timeout)?;

  let req_id = table.next_id();
  table.init_accumulator(req_id);
  let (tx, rx) = bounded::<Result<Vec<Bar>, BrokerError>>(1);
  table.register_callback(req_id, Arc::new(move |resp| {
    let outcome = match resp {
      BrokerResponse::Bars(batch) => Some(Ok(batch.bars)),
      BrokerResponse::Done => Some(Ok(Vec::new())),
      BrokerResponse::Failed { code, message } => Some(Err(BrokerError::ApiError(code, message))),
      _ => None,
    };
    if let Some(outcome) = outcome {
      let _ = tx.try_send(outcome);
    }
  }));

  let request = TransportRequest::HistoricalBars {
    contract: contract.clone(),
    duration: duration.to_string(),
    bar_size: bar_size.to_string(),
    what_to_show: what_to_show.to_string(),
  };
  if let Err(e) = transport.send_request(req_id, &request) {
    table.remove(req_id);
    return Err(e);
  }
  debug!("Requested historical data: req_id={}, symbol={}, duration={}, bar_size={}",
         req_id, contract.symbol, duration, bar_size);

  match rx.recv_timeout(request_timeout) {
    Ok(outcome) => {
      table.remove(req_id);
      outcome
    }
    Err(_) => {
      // The terminal marker never came. Cancel and discard the partial
      // buffer; callers get whole responses or nothing.
      let _ = transport.cancel_request(req_id);
      table.remove(req_id);
      Err(BrokerError::Timeout(format!(
        "historical data for {} after {:?}", contract.symbol, request_timeout
      )))
    }
  }
}
