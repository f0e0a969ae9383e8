// cellar-broker/src/transport_mock.rs
// Scripted in-memory transport for exercising the client without a broker

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::base::{BrokerError, RequestId};
use crate::data::{Bar, ContractDetails, TickKind};
use crate::thread_manager::StopToken;
use crate::transport::{BrokerTransport, TransportEvents, TransportRequest};

/// How the mock behaves around connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
  /// Handshake completes, requests are answered from the script.
  Normal,
  /// `connect` itself fails (broker not running).
  FailConnect,
  /// The I/O loop returns immediately without ever confirming the
  /// handshake (simulates a loop body that silently dies).
  ExitImmediately,
  /// The loop runs but the handshake confirmation never arrives.
  NeverHandshake,
}

enum Cmd {
  Request(RequestId, TransportRequest),
  Tick(RequestId, TickKind, f64),
  Error(RequestId, i32, String),
  Close,
}

/// In-memory `BrokerTransport` that replays a scripted response per request
/// kind and records everything sent through it.
pub struct MockTransport {
  mode: MockMode,
  /// Ticks emitted in order for every market data subscription.
  ticks: Vec<(TickKind, f64)>,
  /// Bars emitted for every historical request, followed by the end marker
  /// unless `omit_historical_end` is set.
  bars: Vec<Bar>,
  omit_historical_end: bool,
  tx: Sender<Cmd>,
  rx: Receiver<Cmd>,
  sent: Mutex<Vec<(RequestId, TransportRequest)>>,
  cancelled: Mutex<Vec<RequestId>>,
}

impl MockTransport {
  pub fn new() -> Self {
    let (tx, rx) = unbounded();
    MockTransport {
      mode: MockMode::Normal,
      ticks: Vec::new(),
      bars: Vec::new(),
      omit_historical_end: false,
      tx,
      rx,
      sent: Mutex::new(Vec::new()),
      cancelled: Mutex::new(Vec::new()),
    }
  }

  pub fn with_mode(mut self, mode: MockMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_ticks(mut self, ticks: Vec<(TickKind, f64)>) -> Self {
    self.ticks = ticks;
    self
  }

  pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
    self.bars = bars;
    self
  }

  /// Suppress the terminal end marker on historical responses, leaving the
  /// accumulation buffer waiting forever.
  pub fn without_historical_end(mut self) -> Self {
    self.omit_historical_end = true;
    self
  }

  /// Queue a tick for delivery from the I/O loop.
  pub fn inject_tick(&self, req_id: RequestId, kind: TickKind, value: f64) {
    let _ = self.tx.send(Cmd::Tick(req_id, kind, value));
  }

  /// Queue an error report for delivery from the I/O loop.
  pub fn inject_error(&self, req_id: RequestId, code: i32, message: &str) {
    let _ = self.tx.send(Cmd::Error(req_id, code, message.to_string()));
  }

  /// Everything passed to `send_request`, in order.
  pub fn sent_requests(&self) -> Vec<(RequestId, TransportRequest)> {
    self.sent.lock().clone()
  }

  pub fn cancelled_requests(&self) -> Vec<RequestId> {
    self.cancelled.lock().clone()
  }

  fn serve(&self, events: &Arc<dyn TransportEvents>, req_id: RequestId, request: TransportRequest) {
    match request {
      TransportRequest::MarketData { .. } => {
        for &(kind, value) in &self.ticks {
          events.on_tick(req_id, kind, value);
        }
      }
      TransportRequest::HistoricalBars { .. } => {
        for bar in &self.bars {
          events.on_historical_bar(req_id, bar.clone());
        }
        if !self.omit_historical_end {
          events.on_historical_end(req_id);
        }
      }
      TransportRequest::ContractDetails { contract } => {
        let details = ContractDetails {
          long_name: format!("{} Inc.", contract.symbol),
          min_tick: 0.01,
          time_zone: "US/Eastern".to_string(),
          contract,
        };
        events.on_contract_details(req_id, details);
        events.on_contract_details_end(req_id);
      }
    }
  }
}

impl Default for MockTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl BrokerTransport for MockTransport {
  fn connect(&self) -> Result<(), BrokerError> {
    match self.mode {
      MockMode::FailConnect => Err(BrokerError::ConnectionFailed(
        "mock transport configured to refuse".to_string(),
      )),
      _ => Ok(()),
    }
  }

  fn disconnect(&self) -> Result<(), BrokerError> {
    let _ = self.tx.send(Cmd::Close);
    Ok(())
  }

  fn send_request(&self, req_id: RequestId, request: &TransportRequest) -> Result<(), BrokerError> {
    self.sent.lock().push((req_id, request.clone()));
    self
      .tx
      .send(Cmd::Request(req_id, request.clone()))
      .map_err(|_| BrokerError::TransportError("mock queue closed".to_string()))
  }

  fn cancel_request(&self, req_id: RequestId) -> Result<(), BrokerError> {
    self.cancelled.lock().push(req_id);
    Ok(())
  }

  fn run(&self, events: Arc<dyn TransportEvents>, stop: &StopToken) -> Result<(), BrokerError> {
    if self.mode == MockMode::ExitImmediately {
      debug!("Mock I/O loop exiting immediately");
      return Ok(());
    }
    if self.mode == MockMode::Normal {
      events.on_connected();
    }
    loop {
      if stop.is_stopped() {
        return Ok(());
      }
      match self.rx.recv_timeout(Duration::from_millis(20)) {
        Ok(Cmd::Request(req_id, request)) => self.serve(&events, req_id, request),
        Ok(Cmd::Tick(req_id, kind, value)) => events.on_tick(req_id, kind, value),
        Ok(Cmd::Error(req_id, code, msg)) => events.on_error(req_id, code, &msg),
        Ok(Cmd::Close) => {
          events.on_connection_closed();
          return Ok(());
        }
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => return Ok(()),
      }
    }
  }
}
