//! Periodic worker tasks with crash recovery and graceful shutdown.
//!
//! Every registered worker runs in its own tokio task: run once, sleep for
//! its interval, repeat. A failed iteration is logged and followed by a
//! shorter recovery pause. A task that dies outright (a panic) is noticed by
//! the monitor loop and respawned on its next pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// One iteration. Errors are logged by the supervisor, never fatal.
    async fn run_once(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub name: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub is_alive: bool,
    pub restart_count: u32,
}

impl WorkerState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_started_at: None,
            is_alive: false,
            restart_count: 0,
        }
    }
}

/// Read side of the shutdown flag. Cheap to clone and hand to anything that
/// is about to start an external call.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A trigger/signal pair. Sending `true` on the trigger starts shutdown.
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has begun. Never resolves if the trigger was
    /// dropped without firing.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|stopping| *stopping).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` or until shutdown begins. Returns true when the
    /// caller should stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_shutting_down(),
            _ = self.wait() => true,
        }
    }
}

#[derive(Clone)]
struct TaskSpec {
    name: String,
    worker: Arc<dyn Worker>,
    interval: Duration,
    restart_delay: Duration,
}

struct TaskSlot {
    spec: TaskSpec,
    state: Arc<Mutex<WorkerState>>,
    handle: Option<JoinHandle<()>>,
}

pub struct WorkerSupervisor {
    monitor_interval: Duration,
    running: Arc<AtomicBool>,
    stopping: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    signal: ShutdownSignal,
    tasks: Arc<Mutex<Vec<TaskSlot>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(monitor_interval: Duration) -> Self {
        let (shutdown_tx, signal) = ShutdownSignal::channel();
        Self {
            monitor_interval,
            running: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            shutdown_tx,
            signal,
            tasks: Arc::new(Mutex::new(Vec::new())),
            monitor: Mutex::new(None),
        }
    }

    /// Add a worker. Workers registered after `run_all` start immediately.
    pub fn register(
        &self,
        name: &str,
        worker: Arc<dyn Worker>,
        interval: Duration,
        restart_delay: Duration,
    ) {
        if restart_delay >= interval {
            tracing::warn!(
                "Worker '{}' restart delay {:?} is not shorter than its interval {:?}",
                name,
                restart_delay,
                interval
            );
        }

        tracing::info!(
            "Registering worker '{}' ({}) every {:?}",
            name,
            worker.name(),
            interval
        );
        let mut slot = TaskSlot {
            spec: TaskSpec {
                name: name.to_string(),
                worker,
                interval,
                restart_delay,
            },
            state: Arc::new(Mutex::new(WorkerState::new(name))),
            handle: None,
        };
        if self.running.load(Ordering::SeqCst) {
            slot.handle = Some(self.spawn_task(&slot));
        }
        lock(&self.tasks).push(slot);
    }

    /// Start every registered worker and the liveness monitor.
    pub fn run_all(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::warn!("Supervisor is shutting down, not starting workers");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Workers already running");
            return;
        }

        {
            let mut tasks = lock(&self.tasks);
            for slot in tasks.iter_mut() {
                slot.handle = Some(self.spawn_task(slot));
            }
            tracing::info!("Started {} worker(s)", tasks.len());
        }

        let monitor = tokio::spawn(monitor_loop(
            self.tasks.clone(),
            self.running.clone(),
            self.signal.clone(),
            self.monitor_interval,
        ));
        *lock(&self.monitor) = Some(monitor);
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        lock(&self.tasks)
            .iter()
            .map(|slot| {
                let mut state = lock(&slot.state).clone();
                if slot.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
                    state.is_alive = false;
                }
                state
            })
            .collect()
    }

    /// Stop all workers, waiting up to `timeout` for them to finish their
    /// current iteration. Stragglers are aborted. Calling this twice is harmless.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already in progress");
            return;
        }

        tracing::info!("Shutting down workers (timeout {:?})", timeout);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let handles: Vec<(String, Arc<Mutex<WorkerState>>, JoinHandle<()>)> = lock(&self.tasks)
            .iter_mut()
            .filter_map(|slot| {
                slot.handle
                    .take()
                    .map(|h| (slot.spec.name.clone(), slot.state.clone(), h))
            })
            .collect();

        let deadline = Instant::now() + timeout;
        let waits = handles.into_iter().map(|(name, state, mut handle)| async move {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::info!("Worker '{}' stopped", name),
                Ok(Err(e)) => tracing::warn!("Worker '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    tracing::warn!(
                        "Worker '{}' did not stop within {:?}, abandoning it",
                        name,
                        timeout
                    );
                    handle.abort();
                }
            }
            lock(&state).is_alive = false;
        });
        futures_util::future::join_all(waits).await;

        tracing::info!("All workers stopped");
    }

    fn spawn_task(&self, slot: &TaskSlot) -> JoinHandle<()> {
        spawn_worker(
            slot.spec.clone(),
            slot.state.clone(),
            self.running.clone(),
            self.signal.clone(),
        )
    }
}

fn spawn_worker(
    spec: TaskSpec,
    state: Arc<Mutex<WorkerState>>,
    running: Arc<AtomicBool>,
    signal: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Worker '{}' started", spec.name);
        while running.load(Ordering::SeqCst) && !signal.is_shutting_down() {
            {
                let mut state = lock(&state);
                state.last_started_at = Some(Utc::now());
                state.is_alive = true;
            }

            let pause = match spec.worker.run_once().await {
                Ok(()) => spec.interval,
                Err(e) => {
                    tracing::error!(
                        "Worker '{}' iteration failed: {:#}; recovering in {:?}",
                        spec.name,
                        e,
                        spec.restart_delay
                    );
                    spec.restart_delay
                }
            };

            if signal.sleep(pause).await {
                break;
            }
        }
        lock(&state).is_alive = false;
        tracing::info!("Worker '{}' exiting", spec.name);
    })
}

async fn monitor_loop(
    tasks: Arc<Mutex<Vec<TaskSlot>>>,
    running: Arc<AtomicBool>,
    signal: ShutdownSignal,
    interval: Duration,
) {
    loop {
        if signal.sleep(interval).await {
            break;
        }

        let mut tasks = lock(&tasks);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        for slot in tasks.iter_mut() {
            let finished = slot.handle.as_ref().map(|h| h.is_finished()).unwrap_or(false);
            if !finished {
                continue;
            }

            let restart_count = {
                let mut state = lock(&slot.state);
                state.is_alive = false;
                state.restart_count += 1;
                state.restart_count
            };
            tracing::error!(
                "Worker '{}' terminated unexpectedly, restarting (restart #{})",
                slot.spec.name,
                restart_count
            );
            slot.handle = Some(spawn_worker(
                slot.spec.clone(),
                slot.state.clone(),
                running.clone(),
                signal.clone(),
            ));
        }
    }
    tracing::debug!("Worker monitor stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
