//! Primary/backup audio source failover.
//!
//! The capture layer reports per-source quality and frame activity; this
//! manager decides which source is authoritative. Automatic switches are
//! damped by three timers: a silence threshold before leaving a source, a
//! cooldown between automatic switches, and a stabilization period the
//! demoted source must sustain before it can win back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lock;
use crate::settings::SettingsStore;

pub mod history;
pub mod thresholds;

pub use history::{FailoverHistory, MAX_FAILOVER_HISTORY};
pub use thresholds::FailoverThresholds;

/// How often the stall watchdog checks frame arrival
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioSource {
    Primary,
    Backup,
}

impl AudioSource {
    pub fn display_name(&self) -> &'static str {
        match self {
            AudioSource::Primary => "Primary",
            AudioSource::Backup => "Backup",
        }
    }

    pub fn other(self) -> Self {
        match self {
            AudioSource::Primary => AudioSource::Backup,
            AudioSource::Backup => AudioSource::Primary,
        }
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Instantaneous quality estimate supplied by the capture layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioQuality {
    #[default]
    Unknown,
    Good,
    Ok,
    Poor,
}

impl AudioQuality {
    /// Ok or better
    pub fn is_usable(&self) -> bool {
        matches!(self, AudioQuality::Good | AudioQuality::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedundancyHealth {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl RedundancyHealth {
    /// Health of the pair given the active source and both qualities
    pub fn derive(active: AudioSource, primary: AudioQuality, backup: AudioQuality) -> Self {
        let (active_quality, alternate_quality) = match active {
            AudioSource::Primary => (primary, backup),
            AudioSource::Backup => (backup, primary),
        };

        match active_quality {
            AudioQuality::Good => RedundancyHealth::Healthy,
            AudioQuality::Ok => RedundancyHealth::Degraded,
            AudioQuality::Poor if alternate_quality.is_usable() => RedundancyHealth::Degraded,
            _ => {
                let both_poor = primary == AudioQuality::Poor && backup == AudioQuality::Poor;
                let both_unknown = primary == AudioQuality::Unknown && backup == AudioQuality::Unknown;
                if both_poor || both_unknown {
                    RedundancyHealth::Critical
                } else {
                    RedundancyHealth::Unknown
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverReason {
    Manual,
    Silence,
    Clipping,
    EngineStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub timestamp: DateTime<Utc>,
    pub from: AudioSource,
    pub to: AudioSource,
    pub reason: FailoverReason,
}

/// What the capture layer observed in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameActivity {
    Audible,
    Silent,
    Clipping,
}

/// Snapshot of redundancy counters
#[derive(Debug, Clone, Serialize)]
pub struct RedundancyStats {
    pub primary_frames: u64,
    pub backup_frames: u64,
    pub primary_last_frame: Option<DateTime<Utc>>,
    pub backup_last_frame: Option<DateTime<Utc>>,
    pub active_source: AudioSource,
    /// Every accepted switch, independent of the capped event history
    pub failover_count: u64,
    pub retained_events: usize,
    pub health: RedundancyHealth,
}

type SourceObserver = Arc<dyn Fn(AudioSource) + Send + Sync>;

#[derive(Debug, Default)]
struct SourceTrack {
    quality: AudioQuality,
    frames: u64,
    last_frame_at: Option<DateTime<Utc>>,
    last_frame_instant: Option<Instant>,
    silent_since: Option<Instant>,
    clipping_since: Option<Instant>,
    /// Since when quality has been continuously Ok or better
    usable_since: Option<Instant>,
}

impl SourceTrack {
    fn set_quality(&mut self, quality: AudioQuality, now: Instant) {
        self.quality = quality;
        if quality.is_usable() {
            self.usable_since.get_or_insert(now);
        } else {
            self.usable_since = None;
        }
    }

    fn record_frame(&mut self, activity: FrameActivity, now: Instant) {
        self.frames += 1;
        self.last_frame_at = Some(Utc::now());
        self.last_frame_instant = Some(now);

        match activity {
            FrameActivity::Audible => {
                self.silent_since = None;
                self.clipping_since = None;
            }
            FrameActivity::Silent => {
                self.silent_since.get_or_insert(now);
                self.clipping_since = None;
            }
            FrameActivity::Clipping => {
                self.clipping_since.get_or_insert(now);
                self.silent_since = None;
            }
        }
    }

    /// Restart the stabilization clock after this source was demoted
    fn restart_stabilization(&mut self, now: Instant) {
        self.usable_since = self.quality.is_usable().then_some(now);
    }
}

struct ManagerState {
    active: AudioSource,
    primary: SourceTrack,
    backup: SourceTrack,
    history: FailoverHistory,
    failover_count: u64,
    last_auto_switch: Option<Instant>,
    demoted: Option<AudioSource>,
    /// The watchdog already reported the active source as stalled
    stall_reported: bool,
}

impl ManagerState {
    fn track(&self, source: AudioSource) -> &SourceTrack {
        match source {
            AudioSource::Primary => &self.primary,
            AudioSource::Backup => &self.backup,
        }
    }

    fn track_mut(&mut self, source: AudioSource) -> &mut SourceTrack {
        match source {
            AudioSource::Primary => &mut self.primary,
            AudioSource::Backup => &mut self.backup,
        }
    }

    fn derive_health(&self) -> RedundancyHealth {
        RedundancyHealth::derive(self.active, self.primary.quality, self.backup.quality)
    }
}

struct Inner {
    thresholds: FailoverThresholds,
    state: Mutex<ManagerState>,
    observers: Mutex<Vec<SourceObserver>>,
    notifications: Mutex<PendingNotifications>,
}

/// Switch notifications waiting for delivery, in switch order
#[derive(Default)]
struct PendingNotifications {
    queue: VecDeque<AudioSource>,
    draining: bool,
}

/// Decides which of two audio sources is authoritative
pub struct RedundantCaptureManager {
    inner: Arc<Inner>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl RedundantCaptureManager {
    pub fn new(thresholds: FailoverThresholds) -> Self {
        let state = ManagerState {
            active: AudioSource::Primary,
            primary: SourceTrack::default(),
            backup: SourceTrack::default(),
            history: FailoverHistory::default(),
            failover_count: 0,
            last_auto_switch: None,
            demoted: None,
            stall_reported: false,
        };

        Self {
            inner: Arc::new(Inner {
                thresholds,
                state: Mutex::new(state),
                observers: Mutex::new(Vec::new()),
                notifications: Mutex::new(PendingNotifications::default()),
            }),
            watchdog: Mutex::new(None),
        }
    }

    /// Build with threshold overrides read from the settings store
    pub fn from_settings(store: &SettingsStore) -> Self {
        Self::new(FailoverThresholds::from_settings(store))
    }

    pub fn effective_failover_silence_threshold(&self) -> Duration {
        self.inner.thresholds.silence_threshold
    }

    pub fn effective_failover_cooldown(&self) -> Duration {
        self.inner.thresholds.cooldown
    }

    pub fn effective_failback_stabilization_period(&self) -> Duration {
        self.inner.thresholds.stabilization_period
    }

    pub fn active_source(&self) -> AudioSource {
        lock(&self.inner.state).active
    }

    pub fn health(&self) -> RedundancyHealth {
        lock(&self.inner.state).derive_health()
    }

    pub fn quality(&self, source: AudioSource) -> AudioQuality {
        lock(&self.inner.state).track(source).quality
    }

    pub fn set_primary_quality(&self, quality: AudioQuality) {
        self.inner.set_quality(AudioSource::Primary, quality);
    }

    pub fn set_backup_quality(&self, quality: AudioQuality) {
        self.inner.set_quality(AudioSource::Backup, quality);
    }

    /// Frame-arrival notification from the capture layer.
    ///
    /// Sustained silence or clipping on the active source past the silence
    /// threshold triggers an automatic failover.
    pub fn record_frame(&self, source: AudioSource, activity: FrameActivity) {
        let now = Instant::now();
        let threshold = self.inner.thresholds.silence_threshold;

        let mut state = lock(&self.inner.state);
        state.track_mut(source).record_frame(activity, now);
        if source != state.active {
            return;
        }
        state.stall_reported = false;

        let track = state.track(source);
        let sustained = |since: Option<Instant>| since.is_some_and(|t| now.saturating_duration_since(t) >= threshold);
        let reason = if sustained(track.silent_since) {
            Some(FailoverReason::Silence)
        } else if sustained(track.clipping_since) {
            Some(FailoverReason::Clipping)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.inner.try_automatic_failover(state, source, reason);
        }
    }

    /// The capture engine feeding `source` stopped
    pub fn report_engine_stopped(&self, source: AudioSource) {
        let state = lock(&self.inner.state);
        if source != state.active {
            debug!("{} engine stopped while inactive", source);
            return;
        }
        self.inner
            .try_automatic_failover(state, source, FailoverReason::EngineStopped);
    }

    /// Make `target` the active source. Returns false if it already was.
    pub fn switch_to_source(&self, target: AudioSource) -> bool {
        let state = lock(&self.inner.state);
        if state.active == target {
            debug!("{} already active, ignoring switch", target);
            return false;
        }
        self.inner.switch(state, target, FailoverReason::Manual);
        true
    }

    /// Flip to the other source unconditionally; returns the new active source
    pub fn emergency_failover(&self) -> AudioSource {
        let state = lock(&self.inner.state);
        let target = state.active.other();
        warn!("Emergency failover to {}", target);
        self.inner.switch(state, target, FailoverReason::Manual);
        target
    }

    /// Register a callback fired with the newly active source after each switch.
    ///
    /// Callbacks run without any manager lock held and may call back into
    /// the manager. A switch made from a callback is delivered after the
    /// current notification completes.
    pub fn on_source_changed<F>(&self, callback: F)
    where
        F: Fn(AudioSource) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).push(Arc::new(callback));
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    pub fn get_statistics(&self) -> RedundancyStats {
        let state = lock(&self.inner.state);
        RedundancyStats {
            primary_frames: state.primary.frames,
            backup_frames: state.backup.frames,
            primary_last_frame: state.primary.last_frame_at,
            backup_last_frame: state.backup.last_frame_at,
            active_source: state.active,
            failover_count: state.failover_count,
            retained_events: state.history.len(),
            health: state.derive_health(),
        }
    }

    /// Retained failover events, oldest first
    pub fn failover_events(&self) -> Vec<FailoverEvent> {
        lock(&self.inner.state).history.to_vec()
    }

    /// Start the stall watchdog: an active source that stops delivering
    /// frames for longer than the silence threshold counts as stopped.
    pub fn start_monitoring(&self) {
        let mut slot = lock(&self.watchdog);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Redundancy monitoring already started");
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.check_for_stall();
            }
        }));
        info!("Redundancy monitoring started");
    }

    /// Cancel the watchdog and release every observer. Safe to call repeatedly.
    pub async fn stop_monitoring(&self) {
        let handle = lock(&self.watchdog).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Redundancy monitoring stopped");
        }
        lock(&self.inner.observers).clear();
    }
}

impl Drop for RedundantCaptureManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.watchdog).take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn set_quality(&self, source: AudioSource, quality: AudioQuality) {
        let mut state = lock(&self.state);
        let before = state.derive_health();
        state.track_mut(source).set_quality(quality, Instant::now());

        let after = state.derive_health();
        if after != before {
            debug!("Redundancy health {:?} -> {:?}", before, after);
        }
    }

    fn check_for_stall(&self) {
        let mut state = lock(&self.state);
        let active = state.active;
        let stalled = state
            .track(active)
            .last_frame_instant
            .is_some_and(|last| last.elapsed() > self.thresholds.silence_threshold);

        if !stalled {
            return;
        }

        if state.stall_reported {
            debug!("{} still stalled", active);
        } else {
            warn!("No frames from {} for over {:?}", active, self.thresholds.silence_threshold);
            state.stall_reported = true;
        }
        self.try_automatic_failover(state, active, FailoverReason::EngineStopped);
    }

    /// Switch away from `failing` if cooldown and failback rules allow it
    fn try_automatic_failover(
        &self,
        state: MutexGuard<'_, ManagerState>,
        failing: AudioSource,
        reason: FailoverReason,
    ) -> bool {
        if state.active != failing {
            return false;
        }

        let now = Instant::now();
        let target = failing.other();

        if let Some(last) = state.last_auto_switch {
            if now.saturating_duration_since(last) < self.thresholds.cooldown {
                debug!("Failover to {} suppressed by cooldown ({:?})", target, reason);
                return false;
            }
        }

        let target_track = state.track(target);
        if target_track.quality == AudioQuality::Poor {
            debug!("Failover to {} suppressed, quality is poor", target);
            return false;
        }

        if state.demoted == Some(target) {
            let stable = target_track
                .usable_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.thresholds.stabilization_period);
            if !stable {
                debug!("Failback to {} suppressed until it stabilizes", target);
                return false;
            }
        }

        self.switch(state, target, reason);
        true
    }

    /// Apply a switch, record it and notify observers in order
    fn switch(&self, mut state: MutexGuard<'_, ManagerState>, target: AudioSource, reason: FailoverReason) {
        let now = Instant::now();
        let from = state.active;

        state.active = target;
        state.demoted = Some(from);
        state.stall_reported = false;
        state.track_mut(from).restart_stabilization(now);
        if reason != FailoverReason::Manual {
            state.last_auto_switch = Some(now);
        }

        let event = FailoverEvent {
            timestamp: Utc::now(),
            from,
            to: target,
            reason,
        };
        state.history.push(event);
        state.failover_count += 1;

        info!(
            "Audio source failover {} -> {} ({:?}), total {}",
            from, target, reason, state.failover_count
        );

        // Queued under the state lock so delivery follows switch order
        lock(&self.notifications).queue.push_back(target);
        drop(state);
        self.deliver_notifications();
    }

    /// Deliver queued notifications unless another call is already doing so.
    /// No lock is held while a callback runs.
    fn deliver_notifications(&self) {
        {
            let mut pending = lock(&self.notifications);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let next = {
                let mut pending = lock(&self.notifications);
                let next = pending.queue.pop_front();
                if next.is_none() {
                    pending.draining = false;
                }
                next
            };
            let Some(source) = next else {
                return;
            };

            let observers: Vec<SourceObserver> = lock(&self.observers).iter().cloned().collect();
            for observer in observers {
                observer(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> RedundantCaptureManager {
        RedundantCaptureManager::new(FailoverThresholds::default())
    }

    #[test]
    fn test_audio_source_names() {
        assert_eq!(AudioSource::Primary.display_name(), "Primary");
        assert_eq!(AudioSource::Backup.to_string(), "Backup");
        assert_eq!(AudioSource::Primary.other(), AudioSource::Backup);
    }

    #[test]
    fn test_health_derivation() {
        use AudioQuality::*;
        use AudioSource::*;

        assert_eq!(RedundancyHealth::derive(Primary, Good, Poor), RedundancyHealth::Healthy);
        assert_eq!(RedundancyHealth::derive(Primary, Ok, Unknown), RedundancyHealth::Degraded);
        assert_eq!(RedundancyHealth::derive(Primary, Poor, Ok), RedundancyHealth::Degraded);
        assert_eq!(RedundancyHealth::derive(Backup, Good, Poor), RedundancyHealth::Degraded);
        assert_eq!(RedundancyHealth::derive(Primary, Poor, Poor), RedundancyHealth::Critical);
        assert_eq!(RedundancyHealth::derive(Backup, Unknown, Unknown), RedundancyHealth::Critical);
        assert_eq!(RedundancyHealth::derive(Primary, Poor, Unknown), RedundancyHealth::Unknown);
        assert_eq!(RedundancyHealth::derive(Primary, Unknown, Good), RedundancyHealth::Unknown);
    }

    #[test]
    fn test_health_follows_quality_updates() {
        let mgr = manager();
        assert_eq!(mgr.health(), RedundancyHealth::Critical);

        mgr.set_primary_quality(AudioQuality::Good);
        assert_eq!(mgr.health(), RedundancyHealth::Healthy);

        mgr.set_primary_quality(AudioQuality::Poor);
        mgr.set_backup_quality(AudioQuality::Ok);
        assert_eq!(mgr.health(), RedundancyHealth::Degraded);
    }

    #[test]
    fn test_switch_to_source_is_idempotent() {
        let mgr = manager();
        assert!(mgr.switch_to_source(AudioSource::Backup));
        for _ in 0..10 {
            assert!(!mgr.switch_to_source(AudioSource::Backup));
        }

        assert_eq!(mgr.failover_events().len(), 1);
        assert_eq!(mgr.get_statistics().failover_count, 1);
        assert!(!mgr.switch_to_source(AudioSource::Backup));
    }

    #[test]
    fn test_emergency_failover_always_records() {
        let mgr = manager();
        assert_eq!(mgr.emergency_failover(), AudioSource::Backup);
        assert_eq!(mgr.emergency_failover(), AudioSource::Primary);

        let events = mgr.failover_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.reason == FailoverReason::Manual));
    }

    #[test]
    fn test_history_capped_while_counter_keeps_counting() {
        let mgr = manager();
        for i in 0..150 {
            let target = if i % 2 == 0 { AudioSource::Backup } else { AudioSource::Primary };
            assert!(mgr.switch_to_source(target));
        }

        let stats = mgr.get_statistics();
        assert_eq!(mgr.failover_events().len(), 100);
        assert_eq!(stats.retained_events, 100);
        assert_eq!(stats.failover_count, 150);
    }

    #[test]
    fn test_observers_receive_new_source() {
        let mgr = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        mgr.on_source_changed(move |source| sink.lock().unwrap().push(source));

        mgr.switch_to_source(AudioSource::Backup);
        mgr.switch_to_source(AudioSource::Backup);
        mgr.emergency_failover();

        assert_eq!(*seen.lock().unwrap(), vec![AudioSource::Backup, AudioSource::Primary]);
    }

    #[test]
    fn test_observer_can_switch_back_from_callback() {
        let mgr = Arc::new(manager());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let weak = Arc::downgrade(&mgr);
        mgr.on_source_changed(move |source| {
            sink.lock().unwrap().push(source);
            if source == AudioSource::Backup {
                if let Some(mgr) = weak.upgrade() {
                    assert_eq!(mgr.active_source(), AudioSource::Backup);
                    assert!(mgr.switch_to_source(AudioSource::Primary));
                }
            }
        });

        assert!(mgr.switch_to_source(AudioSource::Backup));

        assert_eq!(mgr.active_source(), AudioSource::Primary);
        assert_eq!(mgr.get_statistics().failover_count, 2);
        assert_eq!(*seen.lock().unwrap(), vec![AudioSource::Backup, AudioSource::Primary]);
    }

    #[test]
    fn test_observer_can_register_observers() {
        let mgr = Arc::new(manager());
        let weak = Arc::downgrade(&mgr);
        mgr.on_source_changed(move |_| {
            if let Some(mgr) = weak.upgrade() {
                mgr.on_source_changed(|_| {});
            }
        });

        mgr.emergency_failover();
        assert_eq!(mgr.observer_count(), 2);

        mgr.emergency_failover();
        assert_eq!(mgr.observer_count(), 3);
    }

    #[test]
    fn test_concurrent_switches_apply_once() {
        let mgr = Arc::new(manager());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        mgr.on_source_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    mgr.switch_to_source(AudioSource::Backup)
                })
            })
            .collect();

        let accepted = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|switched| *switched)
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(mgr.failover_events().len(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frames_are_counted_per_source() {
        let mgr = manager();
        for _ in 0..3 {
            mgr.record_frame(AudioSource::Primary, FrameActivity::Audible);
        }
        mgr.record_frame(AudioSource::Backup, FrameActivity::Audible);

        let stats = mgr.get_statistics();
        assert_eq!(stats.primary_frames, 3);
        assert_eq!(stats.backup_frames, 1);
        assert!(stats.primary_last_frame.is_some());
        assert!(stats.backup_last_frame.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_fails_over_after_threshold() {
        let mgr = manager();
        mgr.set_backup_quality(AudioQuality::Good);

        mgr.record_frame(AudioSource::Primary, FrameActivity::Silent);
        tokio::time::advance(Duration::from_millis(1900)).await;
        mgr.record_frame(AudioSource::Primary, FrameActivity::Silent);
        assert_eq!(mgr.active_source(), AudioSource::Primary);

        tokio::time::advance(Duration::from_millis(200)).await;
        mgr.record_frame(AudioSource::Primary, FrameActivity::Silent);
        assert_eq!(mgr.active_source(), AudioSource::Backup);

        let events = mgr.failover_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, FailoverReason::Silence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audible_frame_resets_silence() {
        let mgr = manager();
        mgr.record_frame(AudioSource::Primary, FrameActivity::Silent);
        tokio::time::advance(Duration::from_millis(1500)).await;
        mgr.record_frame(AudioSource::Primary, FrameActivity::Audible);
        tokio::time::advance(Duration::from_millis(1500)).await;
        mgr.record_frame(AudioSource::Primary, FrameActivity::Silent);

        assert_eq!(mgr.active_source(), AudioSource::Primary);
        assert_eq!(mgr.get_statistics().failover_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_and_stabilization_prevent_flapping() {
        let mgr = manager();
        mgr.set_primary_quality(AudioQuality::Good);
        mgr.set_backup_quality(AudioQuality::Good);

        mgr.report_engine_stopped(AudioSource::Primary);
        assert_eq!(mgr.active_source(), AudioSource::Backup);

        // Within cooldown
        tokio::time::advance(Duration::from_secs(3)).await;
        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.active_source(), AudioSource::Backup);

        // Cooldown over, but primary has not been stable for 10s since demotion
        tokio::time::advance(Duration::from_secs(3)).await;
        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.active_source(), AudioSource::Backup);

        tokio::time::advance(Duration::from_secs(5)).await;
        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.active_source(), AudioSource::Primary);
        assert_eq!(mgr.get_statistics().failover_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_drop_restarts_stabilization() {
        let mgr = manager();
        mgr.set_primary_quality(AudioQuality::Good);
        mgr.report_engine_stopped(AudioSource::Primary);

        tokio::time::advance(Duration::from_secs(8)).await;
        mgr.set_primary_quality(AudioQuality::Poor);
        mgr.set_primary_quality(AudioQuality::Ok);
        tokio::time::advance(Duration::from_secs(8)).await;

        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.active_source(), AudioSource::Backup);

        tokio::time::advance(Duration::from_secs(2)).await;
        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.active_source(), AudioSource::Primary);
    }

    #[test]
    fn test_no_failover_to_poor_source() {
        let mgr = manager();
        mgr.set_backup_quality(AudioQuality::Poor);
        mgr.report_engine_stopped(AudioSource::Primary);
        assert_eq!(mgr.active_source(), AudioSource::Primary);
    }

    #[test]
    fn test_inactive_engine_stop_is_ignored() {
        let mgr = manager();
        mgr.report_engine_stopped(AudioSource::Backup);
        assert_eq!(mgr.get_statistics().failover_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_detects_stalled_source() {
        let mgr = manager();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        mgr.on_source_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        mgr.start_monitoring();
        mgr.record_frame(AudioSource::Primary, FrameActivity::Audible);

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(mgr.active_source(), AudioSource::Backup);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        let events = mgr.failover_events();
        assert_eq!(events[0].reason, FailoverReason::EngineStopped);

        mgr.stop_monitoring().await;
        mgr.stop_monitoring().await;
        assert_eq!(mgr.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_is_reported_once_until_frames_resume() {
        let mgr = manager();
        mgr.set_backup_quality(AudioQuality::Poor);
        mgr.start_monitoring();
        mgr.record_frame(AudioSource::Primary, FrameActivity::Audible);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lock(&mgr.inner.state).stall_reported);
        assert_eq!(mgr.active_source(), AudioSource::Primary);
        assert_eq!(mgr.get_statistics().failover_count, 0);

        mgr.record_frame(AudioSource::Primary, FrameActivity::Audible);
        assert!(!lock(&mgr.inner.state).stall_reported);

        mgr.stop_monitoring().await;
    }
}
