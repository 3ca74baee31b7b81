use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::lock;

/// Device change event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceChangeEvent {
    /// A new device was connected
    DeviceConnected { name: String, device_type: DeviceType },

    /// A device was disconnected
    DeviceDisconnected { name: String },
}

impl DeviceChangeEvent {
    pub fn kind(&self) -> DeviceEventKind {
        match self {
            DeviceChangeEvent::DeviceConnected { .. } => DeviceEventKind::Connected,
            DeviceChangeEvent::DeviceDisconnected { .. } => DeviceEventKind::Disconnected,
        }
    }

    pub fn device_name(&self) -> &str {
        match self {
            DeviceChangeEvent::DeviceConnected { name, .. } => name,
            DeviceChangeEvent::DeviceDisconnected { name } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Input,
    Output,
}

/// Which notifications an observer wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Connected,
    Disconnected,
}

/// Handle returned by `add_observer`, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type DeviceCallback = Arc<dyn Fn(&DeviceChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<(ObserverId, DeviceEventKind, DeviceCallback)>,
}

/// Process-local broadcast point for device connect/disconnect events.
///
/// Cloning yields another handle to the same registry, so the capture layer
/// can post while managers observe.
#[derive(Clone, Default)]
pub struct DeviceNotificationCenter {
    registry: Arc<Mutex<Registry>>,
}

impl DeviceNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer<F>(&self, kind: DeviceEventKind, callback: F) -> ObserverId
    where
        F: Fn(&DeviceChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = ObserverId(registry.next_id);
        registry.entries.push((id, kind, Arc::new(callback)));
        id
    }

    /// Returns false if the observer was not registered
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _, _)| *entry_id != id);
        registry.entries.len() != before
    }

    /// Deliver `event` to every observer of its kind, in registration order
    pub fn post(&self, event: DeviceChangeEvent) {
        let kind = event.kind();
        // Callbacks run outside the registry lock so they may add or remove observers
        let callbacks: Vec<DeviceCallback> = lock(&self.registry)
            .entries
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();

        debug!(
            "Posting {:?} for {} to {} observer(s)",
            kind,
            event.device_name(),
            callbacks.len()
        );
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}
