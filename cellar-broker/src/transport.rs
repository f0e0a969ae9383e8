// cellar-broker/src/transport.rs
// Seam to the external broker service

use crate::base::{BrokerError, RequestId};
use crate::contract::Contract;
use crate::data::{Bar, ContractDetails, TickKind};
use crate::thread_manager::StopToken;
use std::sync::Arc;

/// Outbound request parameters. The wire encoding is the transport's
/// business; the core only correlates ids.
#[derive(Debug, Clone)]
pub enum TransportRequest {
  /// Streaming market data for a contract.
  MarketData { contract: Contract },
  /// Historical bars, answered as a stream of bars plus a terminal end
  /// marker.
  HistoricalBars {
    contract: Contract,
    duration: String,
    bar_size: String,
    what_to_show: String,
  },
  /// Contract reference data lookup.
  ContractDetails { contract: Contract },
}

/// Inbound callback surface, keyed by request id. Invoked exclusively from
/// the transport's I/O thread; implementations hand events off to other
/// threads rather than doing work inline.
pub trait TransportEvents: Send + Sync {
  /// Connection handshake completed.
  fn on_connected(&self);
  /// Connection closed by the remote side.
  fn on_connection_closed(&self);
  fn on_tick(&self, req_id: RequestId, kind: TickKind, value: f64);
  fn on_historical_bar(&self, req_id: RequestId, bar: Bar);
  fn on_historical_end(&self, req_id: RequestId);
  fn on_contract_details(&self, req_id: RequestId, details: ContractDetails);
  fn on_contract_details_end(&self, req_id: RequestId);
  /// Error or status report. `req_id` is -1 when not tied to a request.
  fn on_error(&self, req_id: RequestId, code: i32, message: &str);
}

/// The opaque external brokerage service: one socket, many concurrent
/// outstanding requests, responses demultiplexed by request id.
///
/// The socket is exclusively owned by the I/O thread running `run`; other
/// threads reach it only through the request methods, which the transport
/// must make safe to call concurrently.
pub trait BrokerTransport: Send + Sync {
  /// Establish the socket-level connection. Handshake completion is
  /// reported asynchronously via `TransportEvents::on_connected` from the
  /// `run` loop.
  fn connect(&self) -> Result<(), BrokerError>;

  fn disconnect(&self) -> Result<(), BrokerError>;

  /// Issue a request under a caller-allocated id.
  fn send_request(&self, req_id: RequestId, request: &TransportRequest) -> Result<(), BrokerError>;

  /// Cancel a previously issued request. Best-effort; late events for the
  /// id may still arrive and are discarded by the correlation table.
  fn cancel_request(&self, req_id: RequestId) -> Result<(), BrokerError>;

  /// Blocking I/O loop. Runs on its own dedicated thread until the stop
  /// token is set or the connection dies; dispatches every inbound message
  /// through `events`.
  fn run(&self, events: Arc<dyn TransportEvents>, stop: &StopToken) -> Result<(), BrokerError>;
}
