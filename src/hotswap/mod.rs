//! Capture recovery when audio devices come and go.
//!
//! The manager listens to a [`DeviceNotificationCenter`] and, on a relevant
//! change, asks the capture layer to restart through an injected operation.
//! Each restart runs under a deadline; a failed restart is retried a bounded
//! number of times. At most one recovery is in flight at any moment.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lock;

pub mod notifications;

pub use notifications::{
    DeviceChangeEvent, DeviceEventKind, DeviceNotificationCenter, DeviceType, ObserverId,
};

/// Operation that restarts audio capture on the current default device
pub type RestartCapture = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Idle,
    Recovering,
    Ready,
    Failed,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Idle => write!(f, "idle"),
            DeviceStatus::Recovering => write!(f, "recovering"),
            DeviceStatus::Ready => write!(f, "ready"),
            DeviceStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecoveryOutcome {
    Success,
    TimedOut,
    Error(String),
}

/// One invocation of the restart operation
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    /// 1-based within the current recovery
    pub index: u32,
    pub started_at: DateTime<Utc>,
    /// None while the attempt is running
    pub outcome: Option<RecoveryOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotSwapConfig {
    /// Deadline for a single restart
    pub restart_capture_timeout: Duration,
    /// Pause between a failed restart and the next attempt
    pub retry_delay: Duration,
    pub max_recovery_attempts: u32,
}

impl Default for HotSwapConfig {
    fn default() -> Self {
        Self {
            restart_capture_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            max_recovery_attempts: 3,
        }
    }
}

struct Shared {
    config: HotSwapConfig,
    restart: RestartCapture,
    is_recovering: AtomicBool,
    restart_invocations: AtomicU64,
    status_tx: watch::Sender<DeviceStatus>,
    last_error: Mutex<Option<String>>,
    attempts: Mutex<Vec<RecoveryAttempt>>,
    control: Mutex<Control>,
}

/// Recovery lifecycle; `is_recovering` only changes while this is locked
#[derive(Default)]
struct Control {
    task: Option<JoinHandle<()>>,
    /// Bumped on every start and cancellation; a task whose generation is
    /// stale must not publish its result
    generation: u64,
    /// Device notifications may start a recovery
    monitoring: bool,
}

/// Restarts capture after device changes, one recovery at a time
pub struct DeviceHotSwapManager {
    shared: Arc<Shared>,
    center: DeviceNotificationCenter,
    observers: Mutex<Vec<ObserverId>>,
}

impl DeviceHotSwapManager {
    pub fn new<F>(center: DeviceNotificationCenter, config: HotSwapConfig, restart: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let (status_tx, _) = watch::channel(DeviceStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                restart: Arc::new(restart),
                is_recovering: AtomicBool::new(false),
                restart_invocations: AtomicU64::new(0),
                status_tx,
                last_error: Mutex::new(None),
                attempts: Mutex::new(Vec::new()),
                control: Mutex::new(Control::default()),
            }),
            center,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HotSwapConfig {
        &self.shared.config
    }

    /// Observe device connect and disconnect notifications.
    ///
    /// Must be called from within a Tokio runtime; recoveries triggered by
    /// notifications are spawned onto it.
    pub fn start_monitoring(&self) {
        let mut observers = lock(&self.observers);
        if !observers.is_empty() {
            warn!("Device monitoring already started");
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot monitor devices outside a Tokio runtime: {}", e);
                return;
            }
        };

        for kind in [DeviceEventKind::Connected, DeviceEventKind::Disconnected] {
            let shared = Arc::downgrade(&self.shared);
            let handle = handle.clone();
            let id = self
                .center
                .add_observer(kind, move |event| on_device_change(&shared, &handle, event));
            observers.push(id);
        }
        lock(&self.shared.control).monitoring = true;

        info!("Device hot-swap monitoring started");
    }

    /// Remove the observers and cancel any in-flight recovery.
    /// Safe to call repeatedly.
    pub async fn stop_monitoring(&self) {
        let ids: Vec<ObserverId> = lock(&self.observers).drain(..).collect();
        for id in ids {
            self.center.remove_observer(id);
        }

        let task = self.shared.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Start a recovery now. Returns false if one is already running.
    pub fn trigger_manual_recovery(&self) -> bool {
        match Handle::try_current() {
            Ok(handle) => self.shared.trigger(&handle, TriggerSource::Manual),
            Err(e) => {
                error!("Cannot start recovery outside a Tokio runtime: {}", e);
                false
            }
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.shared.is_recovering.load(Ordering::SeqCst)
    }

    pub fn device_status(&self) -> DeviceStatus {
        *self.shared.status_tx.borrow()
    }

    /// Follow status changes, e.g. to await Ready or Failed
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Total restart operations started across all recoveries
    pub fn restart_invocations(&self) -> u64 {
        self.shared.restart_invocations.load(Ordering::SeqCst)
    }

    /// Attempts of the current or most recent recovery
    pub fn recovery_attempts(&self) -> Vec<RecoveryAttempt> {
        lock(&self.shared.attempts).clone()
    }
}

impl Drop for DeviceHotSwapManager {
    fn drop(&mut self) {
        for id in lock(&self.observers).drain(..) {
            self.center.remove_observer(id);
        }
        self.shared.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerSource {
    Manual,
    Device,
}

fn on_device_change(shared: &Weak<Shared>, handle: &Handle, event: &DeviceChangeEvent) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    match event {
        DeviceChangeEvent::DeviceConnected {
            name,
            device_type: DeviceType::Output,
        } => {
            debug!("Ignoring output device {} connecting", name);
        }
        DeviceChangeEvent::DeviceConnected { name, .. } => {
            info!("Input device connected: {}", name);
            shared.trigger(handle, TriggerSource::Device);
        }
        DeviceChangeEvent::DeviceDisconnected { name } => {
            warn!("Device disconnected: {}", name);
            shared.trigger(handle, TriggerSource::Device);
        }
    }
}

impl Shared {
    fn trigger(self: &Arc<Self>, handle: &Handle, source: TriggerSource) -> bool {
        let mut control = lock(&self.control);
        if source == TriggerSource::Device && !control.monitoring {
            debug!("Monitoring stopped, ignoring device change");
            return false;
        }
        if self.is_recovering.load(Ordering::SeqCst) {
            debug!("Recovery already in progress, ignoring trigger");
            return false;
        }

        self.is_recovering.store(true, Ordering::SeqCst);
        control.generation += 1;
        let generation = control.generation;
        lock(&self.attempts).clear();
        self.status_tx.send_replace(DeviceStatus::Recovering);
        info!("Starting capture recovery");

        let shared = Arc::clone(self);
        control.task = Some(handle.spawn(async move { shared.recover(generation).await }));
        true
    }

    /// Stop accepting device triggers and abort any running recovery.
    /// Returns the aborted task so async callers can wait for it to unwind.
    fn cancel(&self) -> Option<JoinHandle<()>> {
        let mut control = lock(&self.control);
        control.monitoring = false;
        control.generation += 1;
        let task = control.task.take();
        if let Some(task) = &task {
            task.abort();
        }

        if self.is_recovering.swap(false, Ordering::SeqCst) {
            info!("Cancelled in-flight capture recovery");
            self.status_tx.send_if_modified(|status| {
                if *status == DeviceStatus::Recovering {
                    *status = DeviceStatus::Idle;
                    true
                } else {
                    false
                }
            });
        }
        task
    }

    async fn recover(self: Arc<Self>, generation: u64) {
        let max_attempts = self.config.max_recovery_attempts.max(1);
        let deadline = self.config.restart_capture_timeout;
        let mut last_error = String::new();

        for index in 1..=max_attempts {
            self.restart_invocations.fetch_add(1, Ordering::SeqCst);
            lock(&self.attempts).push(RecoveryAttempt {
                index,
                started_at: Utc::now(),
                outcome: None,
            });

            // On timeout the restart future is dropped, never awaited further
            match tokio::time::timeout(deadline, (self.restart)()).await {
                Ok(Ok(())) => {
                    self.set_outcome(RecoveryOutcome::Success);
                    info!("Capture restarted on attempt {}", index);
                    self.finish(generation, DeviceStatus::Ready, None);
                    return;
                }
                Ok(Err(e)) => {
                    last_error = format!("{:#}", e);
                    self.set_outcome(RecoveryOutcome::Error(last_error.clone()));
                    if index < max_attempts {
                        warn!(
                            "Capture restart attempt {}/{} failed: {}, retrying in {:?}",
                            index, max_attempts, last_error, self.config.retry_delay
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Err(_) => {
                    self.set_outcome(RecoveryOutcome::TimedOut);
                    let message = format!("Capture restart timed out after {:?}", deadline);
                    error!("{}", message);
                    self.finish(generation, DeviceStatus::Failed, Some(message));
                    return;
                }
            }
        }

        let message = format!(
            "Capture restart failed after {} attempts: {}",
            max_attempts, last_error
        );
        error!("{}", message);
        self.finish(generation, DeviceStatus::Failed, Some(message));
    }

    fn set_outcome(&self, outcome: RecoveryOutcome) {
        if let Some(attempt) = lock(&self.attempts).last_mut() {
            attempt.outcome = Some(outcome);
        }
    }

    /// Publish the result of recovery `generation` unless it was superseded.
    /// The status is terminal before `is_recovering` clears.
    fn finish(&self, generation: u64, status: DeviceStatus, error: Option<String>) {
        let control = lock(&self.control);
        if control.generation != generation {
            debug!("Discarding result of cancelled recovery");
            return;
        }
        *lock(&self.last_error) = error;
        self.status_tx.send_replace(status);
        self.is_recovering.store(false, Ordering::SeqCst);
    }
}
