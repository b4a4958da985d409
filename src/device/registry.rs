//! Process-wide device registry
//!
//! Maps a state key to its shared [`Device`] record. Records are created
//! lazily on first acquire and unlinked when the last member releases them.
//! Status updates from the transport are applied here and handed to a
//! dedicated single-consumer fan-out channel so that a storm of device
//! events cannot starve caller processing; per-key ordering is preserved by
//! the single consumer.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Device, DeviceStatus};

/// One status transition queued for fan-out
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// State key of the device that changed
    pub key: String,
    /// The new raw status
    pub status: DeviceStatus,
}

/// Registry of shared device records keyed by state key
///
/// # Examples
///
/// ```
/// use acd_engine::device::{DeviceRegistry, DeviceStatus};
///
/// let registry = DeviceRegistry::new();
/// let device = registry.acquire("PJSIP/alice");
/// registry.set_status("PJSIP/alice", DeviceStatus::NotInUse);
/// assert_eq!(device.status(), DeviceStatus::NotInUse);
///
/// registry.release(device);
/// assert_eq!(registry.device_count(), 0);
/// ```
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<Device>>,
    fanout_tx: mpsc::UnboundedSender<StatusChange>,
    fanout_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusChange>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
        DeviceRegistry {
            devices: DashMap::new(),
            fanout_tx,
            fanout_rx: Mutex::new(Some(fanout_rx)),
        }
    }

    /// Look up or lazily create the record for `key` and hand out a shared
    /// reference. Every acquire must be matched by one [`release`].
    ///
    /// [`release`]: DeviceRegistry::release
    pub fn acquire(&self, key: &str) -> Arc<Device> {
        self.devices
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("🔌 Creating device record for {}", key);
                Arc::new(Device::new(key))
            })
            .clone()
    }

    /// Return a reference obtained from [`acquire`]; unlinks the record
    /// when the registry holds the last remaining reference.
    ///
    /// [`acquire`]: DeviceRegistry::acquire
    pub fn release(&self, device: Arc<Device>) {
        let key = device.key().to_string();
        drop(device);
        let removed = self.devices.remove_if(&key, |_, d| Arc::strong_count(d) == 1);
        if removed.is_some() {
            debug!("🔌 Dropped device record for {}", key);
        }
    }

    /// Peek at an existing record without affecting its lifecycle.
    pub fn get(&self, key: &str) -> Option<Arc<Device>> {
        self.devices.get(key).map(|entry| entry.value().clone())
    }

    /// Apply a raw status update from the transport and enqueue fan-out.
    ///
    /// Unknown keys are ignored: the engine only tracks devices some member
    /// references. Returns `true` when the status actually changed.
    pub fn set_status(&self, key: &str, status: DeviceStatus) -> bool {
        let Some(device) = self.get(key) else {
            debug!("device status for untracked key {} ignored", key);
            return false;
        };
        if !device.set_raw_status(status) {
            return false;
        }
        debug!("🔌 Device {} is now {}", key, status);
        if self
            .fanout_tx
            .send(StatusChange { key: key.to_string(), status })
            .is_err()
        {
            warn!("device fan-out consumer is gone; dropping status for {}", key);
        }
        true
    }

    /// Take the fan-out receiver. The engine calls this once at startup to
    /// drive the single-consumer fan-out task; subsequent calls return
    /// `None`.
    pub fn take_fanout_receiver(&self) -> Option<mpsc::UnboundedReceiver<StatusChange>> {
        self.fanout_rx.lock().take()
    }

    /// Number of live device records.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Snapshot of devices with outstanding commitments, for the
    /// stuck-reservation diagnostic sweep: `(key, reserved, active)`.
    pub fn committed_snapshot(&self) -> Vec<(String, u32, u32)> {
        self.devices
            .iter()
            .filter(|entry| entry.reserved() > 0 || entry.active() > 0)
            .map(|entry| (entry.key().to_string(), entry.reserved(), entry.active()))
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_shared_and_release_unlinks() {
        let registry = DeviceRegistry::new();
        let a = registry.acquire("PJSIP/alice");
        let b = registry.acquire("PJSIP/alice");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.device_count(), 1);

        registry.release(a);
        // One holder left: record stays.
        assert_eq!(registry.device_count(), 1);

        registry.release(b);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn set_status_enqueues_one_change_per_transition() {
        let registry = DeviceRegistry::new();
        let device = registry.acquire("SIP/desk");
        let mut rx = registry.take_fanout_receiver().unwrap();

        assert!(registry.set_status("SIP/desk", DeviceStatus::InUse));
        // Repeat is a no-op.
        assert!(!registry.set_status("SIP/desk", DeviceStatus::InUse));
        assert!(registry.set_status("SIP/desk", DeviceStatus::NotInUse));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status, DeviceStatus::InUse);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.status, DeviceStatus::NotInUse);
        assert!(rx.try_recv().is_err());

        registry.release(device);
    }

    #[test]
    fn untracked_key_is_ignored() {
        let registry = DeviceRegistry::new();
        assert!(!registry.set_status("SIP/ghost", DeviceStatus::Busy));
        assert_eq!(registry.device_count(), 0);
    }
}
