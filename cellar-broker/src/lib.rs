// cellar-broker/src/lib.rs

//! # cellar-broker
//!
//! Threaded client core for a request/response brokerage API (Interactive
//! Brokers TWS / IB Gateway style): one socket, many concurrent outstanding
//! requests, asynchronous responses demultiplexed by request id.
//!
//! The crate owns the concurrency plumbing between a blocking broker I/O
//! loop and the rest of an application:
//!
//! *   [`RequestTable`] correlates request ids with callbacks, subscription
//!     keys, and accumulation buffers for multi-part responses, and
//!     deduplicates subscriptions per instrument.
//! *   [`ConnectionSupervisor`] is the connection state machine. Threads
//!     block on [`ConnectionSupervisor::await_ready`] with a bounded wait
//!     and are released even when the I/O loop dies silently.
//! *   [`EventBridge`] hands market events from the I/O thread to any
//!     number of consumer threads over bounded per-listener queues,
//!     dropping the oldest event when a consumer falls behind.
//! *   [`ThreadManager`] runs the named I/O thread plus a worker pool for
//!     background downloads, where resubmitting a task id supersedes the
//!     in-flight task, and shuts everything down within a deadline.
//! *   [`BrokerClient`] composes the above behind the [`BrokerTransport`]
//!     seam; [`MockTransport`] scripts that seam for tests.
//!
//! # Example
//!
//! ```no_run
//! use cellar_broker::{BrokerClient, BrokerConfig, Contract, MockTransport};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!   let client = BrokerClient::new(BrokerConfig::default(), Arc::new(MockTransport::new()), None);
//!   client.connect()?;
//!
//!   let sub = client.subscribe_market_data(&Contract::stock("AAPL"), None)?;
//!   while let Ok(event) = sub.events.recv() {
//!     println!("{:?}", event);
//!   }
//!
//!   client.shutdown(Duration::from_secs(5));
//!   Ok(())
//! }
//! ```

pub mod base;
pub mod client;
pub mod config;
pub mod contract;
pub mod data;
pub mod event_bridge;
pub mod request_table;
pub mod supervisor;
pub mod thread_manager;
pub mod transport;
pub mod transport_mock;

pub use base::{BrokerError, RequestId};
pub use client::{BrokerClient, Subscription};
pub use config::BrokerConfig;
pub use contract::{Contract, OptionRight, SecType, StreamKind, SubscriptionKey};
pub use data::{
  Bar, BarBatch, BarRepository, BrokerResponse, ContractDetails, MarketEvent, ResponseCallback,
  TickEvent, TickKind,
};
pub use event_bridge::{EventBridge, ListenerId};
pub use request_table::RequestTable;
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use thread_manager::{CancelToken, ManagedThread, StopToken, TaskHandle, TaskState, ThreadManager};
pub use transport::{BrokerTransport, TransportEvents, TransportRequest};
pub use transport_mock::{MockMode, MockTransport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
