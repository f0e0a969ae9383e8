// cellar-broker/src/data.rs
// Market data value objects and the persistence seam

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::base::{BrokerError, RequestId};
use crate::contract::{Contract, StreamKind, SubscriptionKey};

/// Field of a tick update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
  Bid,
  Ask,
  Last,
  BidSize,
  AskSize,
  LastSize,
  Volume,
  High,
  Low,
  Open,
  Close,
  Halted,
}

impl fmt::Display for TickKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TickKind::Bid => "bid",
      TickKind::Ask => "ask",
      TickKind::Last => "last",
      TickKind::BidSize => "bid_size",
      TickKind::AskSize => "ask_size",
      TickKind::LastSize => "last_size",
      TickKind::Volume => "volume",
      TickKind::High => "high",
      TickKind::Low => "low",
      TickKind::Open => "open",
      TickKind::Close => "close",
      TickKind::Halted => "halted",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for TickKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "bid" | "bid_price" => Ok(TickKind::Bid),
      "ask" | "ask_price" => Ok(TickKind::Ask),
      "last" | "last_price" => Ok(TickKind::Last),
      "bid_size" | "bidsize" => Ok(TickKind::BidSize),
      "ask_size" | "asksize" => Ok(TickKind::AskSize),
      "last_size" | "lastsize" => Ok(TickKind::LastSize),
      "volume" => Ok(TickKind::Volume),
      "high" => Ok(TickKind::High),
      "low" => Ok(TickKind::Low),
      "open" => Ok(TickKind::Open),
      "close" => Ok(TickKind::Close),
      "halted" => Ok(TickKind::Halted),
      _ => Err(format!("Unknown tick kind: {}", s)),
    }
  }
}

/// One tick update for a subscribed instrument. Produced on the broker I/O
/// thread, consumed wherever the subscription's listener lives.
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
  pub req_id: RequestId,
  pub symbol: String,
  pub local_symbol: String,
  pub kind: TickKind,
  pub value: f64,
  pub timestamp: DateTime<Utc>,
}

impl TickEvent {
  pub fn key(&self) -> SubscriptionKey {
    SubscriptionKey::new(&self.symbol, &self.local_symbol, StreamKind::TickPrice)
  }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
  pub time: DateTime<Utc>,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: f64,
}

/// A complete multi-part historical response, delivered as one unit after
/// the terminal end marker arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct BarBatch {
  pub req_id: RequestId,
  pub symbol: String,
  pub local_symbol: String,
  pub bars: Vec<Bar>,
}

impl BarBatch {
  pub fn key(&self) -> SubscriptionKey {
    SubscriptionKey::new(&self.symbol, &self.local_symbol, StreamKind::HistoricalBars)
  }
}

/// Event published on the event bridge.
#[derive(Debug, Clone)]
pub enum MarketEvent {
  Tick(TickEvent),
  Bars(BarBatch),
}

impl MarketEvent {
  /// Subscription key this event is addressed to.
  pub fn key(&self) -> SubscriptionKey {
    match self {
      MarketEvent::Tick(t) => t.key(),
      MarketEvent::Bars(b) => b.key(),
    }
  }
}

/// Reference data returned by a contract details request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractDetails {
  pub contract: Contract,
  pub long_name: String,
  pub min_tick: f64,
  pub time_zone: String,
}

/// Payload delivered to a per-request callback.
#[derive(Debug, Clone)]
pub enum BrokerResponse {
  Tick(TickEvent),
  Bars(BarBatch),
  ContractDetails(ContractDetails),
  /// Terminal marker for multi-part responses, and the "no data" outcome.
  Done,
  /// The broker rejected or failed the request.
  Failed { code: i32, message: String },
}

/// Delivery function registered for a request id. Invoked on the broker I/O
/// thread; implementations must hand off, not block.
pub type ResponseCallback = Arc<dyn Fn(BrokerResponse) + Send + Sync>;

/// Persistence seam: the core hands drained historical batches to this and
/// does not care how or where they are stored.
pub trait BarRepository: Send + Sync {
  fn save(&self, symbol: &str, timeframe: &str, bars: &[Bar]) -> Result<(), BrokerError>;
}
