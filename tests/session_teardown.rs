use futures::future::BoxFuture;
use futures::FutureExt;
use scout_resilience::hotswap::{
    DeviceChangeEvent, DeviceEventKind, DeviceHotSwapManager, DeviceNotificationCenter,
    DeviceStatus, HotSwapConfig,
};
use scout_resilience::redundancy::{
    AudioQuality, AudioSource, FailoverReason, FrameActivity, RedundantCaptureManager,
};
use scout_resilience::settings::{SettingsStore, FAILOVER_COOLDOWN_KEY, FAILOVER_SILENCE_THRESHOLD_KEY};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn slow_restart() -> BoxFuture<'static, anyhow::Result<()>> {
    async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
    .boxed()
}

#[tokio::test(start_paused = true)]
async fn device_loss_fails_over_and_recovers() {
    let center = DeviceNotificationCenter::new();
    let redundancy = Arc::new(RedundantCaptureManager::new(Default::default()));
    redundancy.set_primary_quality(AudioQuality::Good);
    redundancy.set_backup_quality(AudioQuality::Good);

    // Capture layer: a lost device stops the primary engine
    let engine = Arc::clone(&redundancy);
    center.add_observer(DeviceEventKind::Disconnected, move |_| {
        engine.report_engine_stopped(AudioSource::Primary);
    });

    let hotswap = DeviceHotSwapManager::new(center.clone(), HotSwapConfig::default(), slow_restart);
    hotswap.start_monitoring();

    let switches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&switches);
    redundancy.on_source_changed(move |source| sink.lock().unwrap().push(source));

    center.post(DeviceChangeEvent::DeviceDisconnected {
        name: "Built-in Microphone".to_string(),
    });

    assert_eq!(redundancy.active_source(), AudioSource::Backup);
    assert!(hotswap.is_recovering());

    let mut status = hotswap.subscribe_status();
    status
        .wait_for(|s| *s == DeviceStatus::Ready)
        .await
        .unwrap();
    assert_eq!(hotswap.restart_invocations(), 1);

    assert!(redundancy.switch_to_source(AudioSource::Primary));
    assert_eq!(
        *switches.lock().unwrap(),
        vec![AudioSource::Backup, AudioSource::Primary]
    );

    let events = redundancy.failover_events();
    assert_eq!(events[0].reason, FailoverReason::EngineStopped);
    assert_eq!(events[1].reason, FailoverReason::Manual);

    hotswap.stop_monitoring().await;
    redundancy.stop_monitoring().await;

    // Only the capture layer's own observer remains
    assert_eq!(center.observer_count(), 1);
    assert_eq!(redundancy.observer_count(), 0);
    assert!(!hotswap.is_recovering());
}

#[tokio::test(start_paused = true)]
async fn teardown_mid_recovery_leaves_nothing_running() {
    let center = DeviceNotificationCenter::new();
    let hotswap = DeviceHotSwapManager::new(center.clone(), HotSwapConfig::default(), slow_restart);
    let redundancy = RedundantCaptureManager::new(Default::default());

    hotswap.start_monitoring();
    redundancy.start_monitoring();
    redundancy.on_source_changed(|_| {});

    assert!(hotswap.trigger_manual_recovery());
    tokio::task::yield_now().await;

    hotswap.stop_monitoring().await;
    redundancy.stop_monitoring().await;

    assert_eq!(center.observer_count(), 0);
    assert_eq!(redundancy.observer_count(), 0);
    assert!(!hotswap.is_recovering());
    assert_eq!(hotswap.device_status(), DeviceStatus::Idle);

    // Nothing fires after teardown
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(hotswap.device_status(), DeviceStatus::Idle);
    assert_eq!(redundancy.get_statistics().failover_count, 0);
}

#[tokio::test(start_paused = true)]
async fn persisted_thresholds_drive_failover() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    {
        let mut store = SettingsStore::open(&path).unwrap();
        store.set(FAILOVER_SILENCE_THRESHOLD_KEY, 0.5).unwrap();
        store.set(FAILOVER_COOLDOWN_KEY, 1.0).unwrap();
    }

    let store = SettingsStore::open(&path).unwrap();
    let manager = RedundantCaptureManager::from_settings(&store);
    assert_eq!(manager.effective_failover_silence_threshold(), Duration::from_millis(500));
    assert_eq!(manager.effective_failover_cooldown(), Duration::from_secs(1));
    assert_eq!(manager.effective_failback_stabilization_period(), Duration::from_secs(10));

    manager.record_frame(AudioSource::Primary, FrameActivity::Clipping);
    tokio::time::advance(Duration::from_millis(600)).await;
    manager.record_frame(AudioSource::Primary, FrameActivity::Clipping);

    assert_eq!(manager.active_source(), AudioSource::Backup);
    assert_eq!(manager.failover_events()[0].reason, FailoverReason::Clipping);
}
