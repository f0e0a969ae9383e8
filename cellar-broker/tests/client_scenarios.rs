// cellar-broker/tests/client_scenarios.rs
// End-to-end scenarios against the scripted mock transport

use anyhow::Result;
use cellar_broker::{
  Bar, BarRepository, BrokerClient, BrokerConfig, BrokerError, BrokerTransport, ConnectionState,
  Contract, MarketEvent, MockTransport, TaskState, TickKind,
};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn init_logger() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .is_test(true)
    .try_init();
}

fn config() -> BrokerConfig {
  BrokerConfig {
    connect_timeout_secs: 2,
    request_timeout_secs: 2,
    worker_threads: 2,
    ..BrokerConfig::default()
  }
}

fn daily_bars(n: usize) -> Vec<Bar> {
  (0..n)
    .map(|i| {
      let close = 100.0 + i as f64;
      Bar {
        time: Utc.with_ymd_and_hms(2024, 1, 1 + i as u32, 0, 0, 0).unwrap(),
        open: close - 1.0,
        high: close + 1.0,
        low: close - 2.0,
        close,
        volume: 1000.0,
      }
    })
    .collect()
}

struct MemoryRepo {
  saves: Mutex<Vec<(String, String, Vec<Bar>)>>,
}

impl MemoryRepo {
  fn new() -> Arc<Self> {
    Arc::new(MemoryRepo { saves: Mutex::new(Vec::new()) })
  }
}

impl BarRepository for MemoryRepo {
  fn save(&self, symbol: &str, timeframe: &str, bars: &[Bar]) -> Result<(), BrokerError> {
    self.saves.lock().push((symbol.to_string(), timeframe.to_string(), bars.to_vec()));
    Ok(())
  }
}

#[test]
fn full_session_lifecycle() -> Result<()> {
  init_logger();
  let mock = Arc::new(MockTransport::new().with_bars(daily_bars(5)));
  let repo = MemoryRepo::new();
  let client = BrokerClient::new(config(), mock.clone(), Some(repo.clone()));

  client.connect()?;
  assert_eq!(client.connection_state(), ConnectionState::Connected);

  // Streaming: two consumers of the same instrument share one broker request.
  let es = Contract::future("ES", "ESZ4", "20241220", "CME");
  let chart = client.subscribe_market_data(&es, None)?;
  let ticker = client.subscribe_market_data(&es, None)?;
  assert_eq!(chart.req_id, ticker.req_id);
  assert_eq!(mock.sent_requests().len(), 1);

  mock.inject_tick(chart.req_id, TickKind::Last, 5910.25);
  for rx in [&chart.events, &ticker.events] {
    match rx.recv_timeout(Duration::from_secs(2))? {
      MarketEvent::Tick(t) => {
        assert_eq!(t.symbol, "ES");
        assert_eq!(t.value, 5910.25);
      }
      other => panic!("expected tick, got {:?}", other),
    }
  }

  // Blocking fetch delivers the whole batch at once.
  let bars = client.request_historical_bars(&es, "5 D", "1 day", "TRADES")?;
  assert_eq!(bars.len(), 5);
  assert!(bars.windows(2).all(|w| w[0].time < w[1].time));

  // Background download lands in the repository.
  let download = client.download_historical(&es, "5 D", "1 day", "D1")?;
  assert_eq!(download.wait(Duration::from_secs(5)), TaskState::Done);
  {
    let saves = repo.saves.lock();
    assert_eq!(saves.len(), 1);
    let (symbol, timeframe, saved) = &saves[0];
    assert_eq!(symbol, "ES");
    assert_eq!(timeframe, "D1");
    assert_eq!(saved.len(), 5);
  }

  client.unsubscribe_market_data(&es);
  assert!(!mock.cancelled_requests().is_empty());

  client.shutdown(Duration::from_secs(2));
  assert_eq!(client.connection_state(), ConnectionState::Disconnected);
  assert!(client.threads().is_shutdown());
  Ok(())
}

#[test]
fn remote_close_recovers_with_reconnect() -> Result<()> {
  init_logger();
  let mock = Arc::new(MockTransport::new());
  let client = BrokerClient::new(config(), mock.clone(), None);

  client.connect()?;
  mock.disconnect()?; // broker closes the session from its side
  for _ in 0..100 {
    if client.connection_state() == ConnectionState::Disconnected {
      break;
    }
    std::thread::sleep(Duration::from_millis(10));
  }
  assert_eq!(client.connection_state(), ConnectionState::Disconnected);

  // A fresh attempt reuses the same client.
  client.connect()?;
  assert_eq!(client.connection_state(), ConnectionState::Connected);
  client.shutdown(Duration::from_secs(2));
  Ok(())
}

#[test]
fn download_without_repository_is_a_configuration_error() {
  init_logger();
  let mock = Arc::new(MockTransport::new());
  let client = BrokerClient::new(config(), mock, None);
  client.connect().unwrap();
  assert!(matches!(
    client.download_historical(&Contract::stock("AAPL"), "5 D", "1 day", "D1"),
    Err(BrokerError::ConfigurationError(_))
  ));
  client.shutdown(Duration::from_secs(2));
}
