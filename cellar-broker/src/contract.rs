// cellar-broker/src/contract.rs
// Contract value structs and subscription identity

use std::fmt;
use std::str::FromStr;

/// Security type of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecType {
  Stock,   // STK
  Future,  // FUT
  Option,  // OPT
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Future => "FUT",
      SecType::Option => "OPT",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "STK" => Ok(SecType::Stock),
      "FUT" => Ok(SecType::Future),
      "OPT" => Ok(SecType::Option),
      _ => Err(format!("Unknown security type: {}", s)),
    }
  }
}

/// Option right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionRight {
  Call,
  Put,
}

impl fmt::Display for OptionRight {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OptionRight::Call => "C",
      OptionRight::Put => "P",
    };
    write!(f, "{}", s)
  }
}

/// A tradable instrument. Constructed via the named factory functions
/// rather than field-by-field, so each variant carries exactly the fields
/// that make sense for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  /// Exchange-local symbol. Distinguishes individual futures contracts
  /// (e.g. "CLZ4") from the underlying symbol ("CL"). Empty for stocks.
  pub local_symbol: String,
  pub exchange: String,
  pub currency: String,
  /// Expiry in YYYYMMDD form, futures and options only.
  pub last_trade_date: Option<String>,
  pub strike: Option<f64>,
  pub right: Option<OptionRight>,
  pub multiplier: Option<String>,
}

impl Contract {
  /// A stock on SMART routing in USD.
  pub fn stock(symbol: &str) -> Self {
    Contract {
      con_id: 0,
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      local_symbol: String::new(),
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      last_trade_date: None,
      strike: None,
      right: None,
      multiplier: None,
    }
  }

  /// A single futures contract identified by its local symbol and expiry.
  pub fn future(symbol: &str, local_symbol: &str, last_trade_date: &str, exchange: &str) -> Self {
    Contract {
      con_id: 0,
      symbol: symbol.to_string(),
      sec_type: SecType::Future,
      local_symbol: local_symbol.to_string(),
      exchange: exchange.to_string(),
      currency: "USD".to_string(),
      last_trade_date: Some(last_trade_date.to_string()),
      strike: None,
      right: None,
      multiplier: None,
    }
  }

  /// An option on a stock underlying.
  pub fn option(symbol: &str, last_trade_date: &str, strike: f64, right: OptionRight) -> Self {
    Contract {
      con_id: 0,
      symbol: symbol.to_string(),
      sec_type: SecType::Option,
      local_symbol: String::new(),
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      last_trade_date: Some(last_trade_date.to_string()),
      strike: Some(strike),
      right: Some(right),
      multiplier: Some("100".to_string()),
    }
  }
}

/// Kind of data stream a subscription delivers. Part of the subscription
/// identity so tick and bar streams for the same instrument are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
  TickPrice,
  RealTimeBars,
  HistoricalBars,
  ContractDetails,
}

impl fmt::Display for StreamKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      StreamKind::TickPrice => "tickPrice",
      StreamKind::RealTimeBars => "realTimeBars",
      StreamKind::HistoricalBars => "historicalBars",
      StreamKind::ContractDetails => "contractDetails",
    };
    write!(f, "{}", s)
  }
}

/// Logical identity of one live data stream: (symbol, local symbol, kind).
/// Two subscribe calls with equal keys refer to the same stream and must
/// share a single broker-level request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
  pub symbol: String,
  pub local_symbol: String,
  pub kind: StreamKind,
}

impl SubscriptionKey {
  pub fn new(symbol: &str, local_symbol: &str, kind: StreamKind) -> Self {
    SubscriptionKey {
      symbol: symbol.to_string(),
      local_symbol: local_symbol.to_string(),
      kind,
    }
  }

  pub fn for_contract(contract: &Contract, kind: StreamKind) -> Self {
    SubscriptionKey::new(&contract.symbol, &contract.local_symbol, kind)
  }
}

impl fmt::Display for SubscriptionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.symbol, self.local_symbol, self.kind)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn factory_variants() {
    let stk = Contract::stock("AAPL");
    assert_eq!(stk.sec_type, SecType::Stock);
    assert!(stk.last_trade_date.is_none());

    let fut = Contract::future("CL", "CLZ4", "20241120", "NYMEX");
    assert_eq!(fut.sec_type, SecType::Future);
    assert_eq!(fut.local_symbol, "CLZ4");

    let opt = Contract::option("AAPL", "20250117", 200.0, OptionRight::Call);
    assert_eq!(opt.strike, Some(200.0));
    assert_eq!(opt.multiplier.as_deref(), Some("100"));
  }

  #[test]
  fn keys_differ_by_local_symbol_and_kind() {
    let a = SubscriptionKey::new("CL", "CLZ4", StreamKind::TickPrice);
    let b = SubscriptionKey::new("CL", "CLF5", StreamKind::TickPrice);
    let c = SubscriptionKey::new("CL", "CLZ4", StreamKind::RealTimeBars);
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_eq!(a, SubscriptionKey::new("CL", "CLZ4", StreamKind::TickPrice));
  }
}
