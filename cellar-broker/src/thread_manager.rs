// cellar-broker/src/thread_manager.rs
// Centralized lifecycle for named long-lived threads and pooled background tasks

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::base::BrokerError;

/// Cooperative stop signal handed to a managed thread body. The body is
/// responsible for checking it often enough to exit within the shutdown
/// join timeout.
#[derive(Clone)]
pub struct StopToken {
  flag: Arc<AtomicBool>,
}

impl StopToken {
  pub fn is_stopped(&self) -> bool {
    self.flag.load(Ordering::Relaxed)
  }
}

type ThreadBody = Box<dyn FnOnce(StopToken) -> Result<(), BrokerError> + Send>;

/// A named long-lived thread with lifecycle tracking. Consumers hold this
/// handle; the underlying `JoinHandle` never leaves the manager's control.
pub struct ManagedThread {
  name: String,
  daemon: bool,
  stop_flag: Arc<AtomicBool>,
  running: Arc<AtomicBool>,
  last_error: Arc<Mutex<Option<String>>>,
  body: Mutex<Option<ThreadBody>>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedThread {
  fn new(name: &str, daemon: bool, body: ThreadBody) -> Self {
    ManagedThread {
      name: name.to_string(),
      daemon,
      stop_flag: Arc::new(AtomicBool::new(false)),
      running: Arc::new(AtomicBool::new(false)),
      last_error: Arc::new(Mutex::new(None)),
      body: Mutex::new(Some(body)),
      handle: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Spawn the thread. The registered body runs exactly once; a second
  /// start is rejected.
  pub fn start(&self) -> Result<(), BrokerError> {
    let body = self
      .body
      .lock()
      .take()
      .ok_or_else(|| BrokerError::AlreadyRunning(self.name.clone()))?;

    let token = StopToken { flag: self.stop_flag.clone() };
    let running = self.running.clone();
    let last_error = self.last_error.clone();
    let name = self.name.clone();
    running.store(true, Ordering::SeqCst);

    let handle = thread::Builder::new()
      .name(name.clone())
      .spawn(move || {
        info!("Thread {} started", name);
        if let Err(e) = body(token) {
          warn!("Thread {} failed: {}", name, e);
          *last_error.lock() = Some(e.to_string());
        }
        running.store(false, Ordering::SeqCst);
        info!("Thread {} stopped", name);
      })
      .map_err(|e| BrokerError::InternalError(format!("spawn {}: {}", self.name, e)))?;

    *self.handle.lock() = Some(handle);
    Ok(())
  }

  /// Set the cooperative stop flag. The body must observe it and return.
  pub fn signal_stop(&self) {
    self.stop_flag.store(true, Ordering::SeqCst);
  }

  pub fn is_alive(&self) -> bool {
    self.handle.lock().as_ref().map_or(false, |h| !h.is_finished())
  }

  /// Error message from the body's `Err` return, if it failed.
  pub fn last_error(&self) -> Option<String> {
    self.last_error.lock().clone()
  }

  /// Wait up to `timeout` for the thread to finish. Returns false and
  /// detaches the thread if it does not stop in time; a hung third-party
  /// call inside the body must not pin the caller.
  pub fn join_timeout(&self, timeout: Duration) -> bool {
    let handle = match self.handle.lock().take() {
      Some(h) => h,
      None => return true,
    };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
      if Instant::now() >= deadline {
        // Put nothing back: the straggler is detached.
        return false;
      }
      thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
      warn!("Thread {} panicked", self.name);
    }
    true
  }
}

/// State of a pooled background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  Running,
  Done,
  Cancelled,
  Failed(String),
}

struct TaskShared {
  state: Mutex<TaskState>,
  cond: Condvar,
  cancelled: AtomicBool,
}

impl TaskShared {
  fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    let mut state = self.state.lock();
    if *state == TaskState::Pending {
      *state = TaskState::Cancelled;
      self.cond.notify_all();
    }
  }
}

/// Cancellation token passed to a running task body. Cancellation of a
/// running task is cooperative only.
#[derive(Clone)]
pub struct CancelToken {
  shared: Arc<TaskShared>,
}

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    self.shared.cancelled.load(Ordering::SeqCst)
  }
}

/// Handle to a submitted background task.
#[derive(Clone)]
pub struct TaskHandle {
  task_id: String,
  shared: Arc<TaskShared>,
}

impl TaskHandle {
  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  pub fn state(&self) -> TaskState {
    self.shared.state.lock().clone()
  }

  /// Prevent a not-yet-started task from running; a task already running
  /// only sees its cancel token flip.
  pub fn cancel(&self) {
    self.shared.cancel();
  }

  /// Block until the task reaches a terminal state or the timeout elapses;
  /// returns the state observed at that point.
  pub fn wait(&self, timeout: Duration) -> TaskState {
    let deadline = Instant::now() + timeout;
    let mut state = self.shared.state.lock();
    loop {
      match *state {
        TaskState::Pending | TaskState::Running => {}
        _ => return state.clone(),
      }
      let now = Instant::now();
      if now >= deadline {
        return state.clone();
      }
      self.shared.cond.wait_for(&mut state, deadline - now);
    }
  }
}

type TaskBody = Box<dyn FnOnce(&CancelToken) -> Result<(), BrokerError> + Send>;

struct PoolJob {
  task_id: String,
  shared: Arc<TaskShared>,
  body: TaskBody,
}

/// Uniform lifecycle for the application's concurrency: a small number of
/// named long-running threads (the broker I/O loop) and a bounded pool of
/// short-lived background tasks (historical downloads, one-shot lookups).
pub struct ThreadManager {
  threads: Mutex<HashMap<String, Arc<ManagedThread>>>,
  tasks: Arc<Mutex<HashMap<String, Arc<TaskShared>>>>,
  pool_tx: Mutex<Option<Sender<PoolJob>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  pool_stop: Arc<AtomicBool>,
  shutdown_started: AtomicBool,
}

impl ThreadManager {
  pub fn new(worker_threads: usize) -> Arc<Self> {
    let (tx, rx) = unbounded::<PoolJob>();
    let tasks: Arc<Mutex<HashMap<String, Arc<TaskShared>>>> = Arc::new(Mutex::new(HashMap::new()));
    let pool_stop = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::with_capacity(worker_threads.max(1));
    for i in 0..worker_threads.max(1) {
      let rx = rx.clone();
      let tasks = tasks.clone();
      let pool_stop = pool_stop.clone();
      let handle = thread::Builder::new()
        .name(format!("task-pool-{}", i))
        .spawn(move || Self::worker_loop(rx, tasks, pool_stop))
        .expect("failed to spawn pool worker");
      workers.push(handle);
    }

    info!("ThreadManager started with {} pool worker(s)", worker_threads.max(1));
    Arc::new(ThreadManager {
      threads: Mutex::new(HashMap::new()),
      tasks,
      pool_tx: Mutex::new(Some(tx)),
      workers: Mutex::new(workers),
      pool_stop,
      shutdown_started: AtomicBool::new(false),
    })
  }

  fn worker_loop(
    rx: Receiver<PoolJob>,
    tasks: Arc<Mutex<HashMap<String, Arc<TaskShared>>>>,
    pool_stop: Arc<AtomicBool>,
  ) {
    while let Ok(job) = rx.recv() {
      let shared = job.shared;
      {
        let mut state = shared.state.lock();
        if pool_stop.load(Ordering::SeqCst) || shared.cancelled.load(Ordering::SeqCst) {
          if *state == TaskState::Pending {
            *state = TaskState::Cancelled;
            shared.cond.notify_all();
          }
          drop(state);
          Self::forget_task(&tasks, &job.task_id, &shared);
          continue;
        }
        *state = TaskState::Running;
      }

      debug!("Task {} running", job.task_id);
      let token = CancelToken { shared: shared.clone() };
      let result = (job.body)(&token);

      {
        let mut state = shared.state.lock();
        *state = match result {
          Ok(()) if shared.cancelled.load(Ordering::SeqCst) => TaskState::Cancelled,
          Ok(()) => TaskState::Done,
          Err(e) => {
            warn!("Task {} failed: {}", job.task_id, e);
            TaskState::Failed(e.to_string())
          }
        };
        shared.cond.notify_all();
      }
      Self::forget_task(&tasks, &job.task_id, &shared);
    }
  }

  fn forget_task(
    tasks: &Mutex<HashMap<String, Arc<TaskShared>>>,
    task_id: &str,
    shared: &Arc<TaskShared>,
  ) {
    let mut map = tasks.lock();
    // Only remove our own entry; a superseding submit may have replaced it.
    if map.get(task_id).map_or(false, |s| Arc::ptr_eq(s, shared)) {
      map.remove(task_id);
    }
  }

  /// Register a named thread. Fails if a thread with this name is already
  /// registered and alive, which indicates two components trying to own the
  /// same loop. A dead registration under the name is replaced.
  pub fn register_thread<F>(
    &self,
    name: &str,
    body: F,
    daemon: bool,
  ) -> Result<Arc<ManagedThread>, BrokerError>
  where
    F: FnOnce(StopToken) -> Result<(), BrokerError> + Send + 'static,
  {
    if self.shutdown_started.load(Ordering::SeqCst) {
      return Err(BrokerError::Shutdown);
    }
    let mut threads = self.threads.lock();
    if let Some(existing) = threads.get(name) {
      if existing.is_alive() {
        return Err(BrokerError::AlreadyRunning(name.to_string()));
      }
      threads.remove(name);
    }
    let managed = Arc::new(ManagedThread::new(name, daemon, Box::new(body)));
    threads.insert(name.to_string(), managed.clone());
    Ok(managed)
  }

  pub fn thread(&self, name: &str) -> Option<Arc<ManagedThread>> {
    self.threads.lock().get(name).cloned()
  }

  /// Signal a named thread to stop. Returns false if the name is unknown.
  pub fn signal_stop(&self, name: &str) -> bool {
    match self.thread(name) {
      Some(t) => {
        t.signal_stop();
        true
      }
      None => false,
    }
  }

  /// Submit a background task under an application-chosen id. Submitting a
  /// second task under an existing id cancels the prior one first, so a new
  /// download for the same symbol supersedes an in-flight one.
  pub fn submit_task<F>(&self, task_id: &str, body: F) -> Result<TaskHandle, BrokerError>
  where
    F: FnOnce(&CancelToken) -> Result<(), BrokerError> + Send + 'static,
  {
    if self.shutdown_started.load(Ordering::SeqCst) {
      return Err(BrokerError::Shutdown);
    }
    let shared = Arc::new(TaskShared {
      state: Mutex::new(TaskState::Pending),
      cond: Condvar::new(),
      cancelled: AtomicBool::new(false),
    });

    {
      let mut tasks = self.tasks.lock();
      if let Some(prev) = tasks.insert(task_id.to_string(), shared.clone()) {
        debug!("Task {} superseded", task_id);
        prev.cancel();
      }
    }

    let job = PoolJob {
      task_id: task_id.to_string(),
      shared: shared.clone(),
      body: Box::new(body),
    };
    let tx_guard = self.pool_tx.lock();
    match tx_guard.as_ref() {
      Some(tx) => tx
        .send(job)
        .map_err(|_| BrokerError::Shutdown)?,
      None => return Err(BrokerError::Shutdown),
    }
    Ok(TaskHandle { task_id: task_id.to_string(), shared })
  }

  /// Cancel a task by id. Returns false if no task is tracked under the id.
  pub fn cancel_task(&self, task_id: &str) -> bool {
    match self.tasks.lock().get(task_id) {
      Some(shared) => {
        shared.cancel();
        true
      }
      None => false,
    }
  }

  /// Ids of tasks that have not reached a terminal state.
  pub fn active_tasks(&self) -> Vec<String> {
    self
      .tasks
      .lock()
      .iter()
      .filter(|(_, s)| matches!(*s.state.lock(), TaskState::Pending | TaskState::Running))
      .map(|(id, _)| id.clone())
      .collect()
  }

  /// Stop everything: signal every registered thread, join each (except
  /// daemons) up to `timeout`, cancel pending tasks, and tear down the
  /// worker pool. Threads that fail to stop in time are logged and
  /// detached; shutdown always proceeds.
  pub fn shutdown(&self, wait: bool, timeout: Duration) {
    if self.shutdown_started.swap(true, Ordering::SeqCst) {
      return;
    }
    info!("ThreadManager shutting down");

    let threads: Vec<Arc<ManagedThread>> = self.threads.lock().values().cloned().collect();
    for t in &threads {
      t.signal_stop();
    }
    if wait {
      for t in &threads {
        if t.daemon || !t.is_alive() {
          continue;
        }
        if !t.join_timeout(timeout) {
          warn!("Thread {} did not stop within {:?}", t.name(), timeout);
        }
      }
    }

    // Pool teardown: flag first so queued jobs are skipped, then close the
    // channel so workers drain and exit.
    self.pool_stop.store(true, Ordering::SeqCst);
    for shared in self.tasks.lock().values() {
      shared.cancel();
    }
    *self.pool_tx.lock() = None;
    if wait {
      let workers = std::mem::take(&mut *self.workers.lock());
      let deadline = Instant::now() + timeout;
      for handle in workers {
        while !handle.is_finished() && Instant::now() < deadline {
          thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
          let _ = handle.join();
        } else {
          warn!("Pool worker did not stop within {:?}", timeout);
        }
      }
    }
    info!("ThreadManager shutdown complete");
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown_started.load(Ordering::SeqCst)
  }
}
