// cellar-broker/src/supervisor.rs
// Connection lifecycle state machine with blocking readiness waits

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::base::BrokerError;

/// Connection lifecycle state. Transitions within one attempt are monotone:
/// Disconnected -> Connecting -> (Connected | Error). Reconnecting requires
/// an explicit `disconnect` back to Disconnected first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Error,
}

struct SupervisorState {
  state: ConnectionState,
  error: Option<String>,
}

/// Owns the connection state machine. Only this type writes the state; the
/// I/O thread reports transitions through `mark_connected` / `mark_error`,
/// and any other thread can block on `await_ready` with a bounded wait.
pub struct ConnectionSupervisor {
  state: Mutex<SupervisorState>,
  cond: Condvar,
}

impl ConnectionSupervisor {
  pub fn new() -> Arc<Self> {
    Arc::new(ConnectionSupervisor {
      state: Mutex::new(SupervisorState {
        state: ConnectionState::Disconnected,
        error: None,
      }),
      cond: Condvar::new(),
    })
  }

  pub fn state(&self) -> ConnectionState {
    self.state.lock().state
  }

  pub fn is_connected(&self) -> bool {
    self.state() == ConnectionState::Connected
  }

  /// Reason recorded with the last `mark_error`, if any.
  pub fn last_error(&self) -> Option<String> {
    self.state.lock().error.clone()
  }

  /// Disconnected -> Connecting. Rejected from any other state; a failed
  /// attempt must go through `disconnect` before retrying.
  pub fn begin_connect(&self) -> Result<(), BrokerError> {
    let mut guard = self.state.lock();
    match guard.state {
      ConnectionState::Disconnected => {
        guard.state = ConnectionState::Connecting;
        guard.error = None;
        info!("Connection attempt started");
        Ok(())
      }
      ConnectionState::Connecting | ConnectionState::Connected => Err(BrokerError::AlreadyConnected),
      ConnectionState::Error => Err(BrokerError::ConnectionFailed(
        "previous attempt failed; disconnect before retrying".to_string(),
      )),
    }
  }

  /// Connecting -> Connected; wakes every thread blocked in `await_ready`.
  /// A stray confirmation in any other state is logged and ignored.
  pub fn mark_connected(&self) {
    let mut guard = self.state.lock();
    match guard.state {
      ConnectionState::Connecting => {
        guard.state = ConnectionState::Connected;
        info!("Connection established");
        self.cond.notify_all();
      }
      other => warn!("Ignoring connection confirmation in state {:?}", other),
    }
  }

  /// Connecting|Connected -> Error, recording the reason. Wakes all blocked
  /// waiters so they observe the failure instead of hanging.
  pub fn mark_error(&self, reason: &str) {
    let mut guard = self.state.lock();
    match guard.state {
      ConnectionState::Connecting | ConnectionState::Connected => {
        warn!("Connection error: {}", reason);
        guard.state = ConnectionState::Error;
        guard.error = Some(reason.to_string());
        self.cond.notify_all();
      }
      other => debug!("Ignoring connection error in state {:?}: {}", other, reason),
    }
  }

  /// Any state -> Disconnected, clearing the recorded error. Wakes blocked
  /// waiters; they observe `NotConnected`.
  pub fn disconnect(&self) {
    let mut guard = self.state.lock();
    if guard.state != ConnectionState::Disconnected {
      info!("Connection closed");
    }
    guard.state = ConnectionState::Disconnected;
    guard.error = None;
    self.cond.notify_all();
  }

  /// Block the calling thread until the connection is Connected, the attempt
  /// fails, or the timeout elapses. Never called from the I/O thread itself.
  pub fn await_ready(&self, timeout: Duration) -> Result<(), BrokerError> {
    let deadline = Instant::now() + timeout;
    let mut guard = self.state.lock();
    loop {
      match guard.state {
        ConnectionState::Connected => return Ok(()),
        ConnectionState::Error => {
          let reason = guard.error.clone().unwrap_or_else(|| "unknown".to_string());
          return Err(BrokerError::ConnectionFailed(reason));
        }
        ConnectionState::Disconnected => return Err(BrokerError::NotConnected),
        ConnectionState::Connecting => {}
      }
      let now = Instant::now();
      if now >= deadline {
        return Err(BrokerError::Timeout(format!(
          "connection not ready after {:?}", timeout
        )));
      }
      self.cond.wait_for(&mut guard, deadline - now);
    }
  }

  /// Guard for the I/O loop body. If the loop returns while the supervisor
  /// still thinks the connection is being established (or is live), the
  /// drop transitions to Error so no waiter blocks forever on a thread that
  /// silently died.
  pub fn io_guard(self: &Arc<Self>) -> IoLoopGuard {
    IoLoopGuard { supervisor: self.clone() }
  }
}

pub struct IoLoopGuard {
  supervisor: Arc<ConnectionSupervisor>,
}

impl Drop for IoLoopGuard {
  fn drop(&mut self) {
    match self.supervisor.state() {
      ConnectionState::Connecting => {
        self.supervisor.mark_error("I/O loop exited before handshake completed");
      }
      ConnectionState::Connected => {
        self.supervisor.mark_error("I/O loop exited; connection lost");
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn happy_path_transitions() {
    let sup = ConnectionSupervisor::new();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
    sup.begin_connect().unwrap();
    assert_eq!(sup.state(), ConnectionState::Connecting);
    sup.mark_connected();
    assert!(sup.is_connected());
    sup.disconnect();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
  }

  #[test]
  fn begin_connect_rejected_outside_disconnected() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();
    assert!(matches!(sup.begin_connect(), Err(BrokerError::AlreadyConnected)));
    sup.mark_error("boom");
    assert!(matches!(sup.begin_connect(), Err(BrokerError::ConnectionFailed(_))));
    sup.disconnect();
    assert!(sup.begin_connect().is_ok());
  }

  #[test]
  fn error_releases_waiter_without_blocking() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();
    sup.mark_error("handshake rejected");

    let sup2 = sup.clone();
    let waiter = thread::spawn(move || sup2.await_ready(Duration::from_secs(0)));
    match waiter.join().unwrap() {
      Err(BrokerError::ConnectionFailed(reason)) => assert_eq!(reason, "handshake rejected"),
      other => panic!("expected ConnectionFailed, got {:?}", other),
    }
  }

  #[test]
  fn mark_connected_wakes_blocked_waiter() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();

    let sup2 = sup.clone();
    let waiter = thread::spawn(move || sup2.await_ready(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(50));
    sup.mark_connected();
    assert!(waiter.join().unwrap().is_ok());
  }

  #[test]
  fn await_ready_times_out_while_connecting() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();
    let start = Instant::now();
    let res = sup.await_ready(Duration::from_millis(100));
    assert!(matches!(res, Err(BrokerError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(2));
  }

  #[test]
  fn silent_io_loop_exit_ends_in_error() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();

    let sup2 = sup.clone();
    // Simulated I/O loop that returns without ever confirming the handshake.
    let io = thread::spawn(move || {
      let _guard = sup2.io_guard();
      // body returns immediately
    });
    io.join().unwrap();

    assert_eq!(sup.state(), ConnectionState::Error);
    assert!(matches!(
      sup.await_ready(Duration::from_secs(0)),
      Err(BrokerError::ConnectionFailed(_))
    ));
  }

  #[test]
  fn disconnect_clears_error() {
    let sup = ConnectionSupervisor::new();
    sup.begin_connect().unwrap();
    sup.mark_error("gone");
    assert!(sup.last_error().is_some());
    sup.disconnect();
    assert!(sup.last_error().is_none());
    assert_eq!(sup.state(), ConnectionState::Disconnected);
  }
}
