//! Shared device state
//!
//! A device is the dialable endpoint behind one or more members, identified
//! by a state key. Its record is shared process-wide: a single device may
//! back members in many queues, and the engine's own commitments (pending
//! ring attempts, bridged calls) are tracked on it as counters so that the
//! driver's observable state and the engine's outstanding claims reconcile
//! into one effective status.

pub mod registry;

pub use registry::{DeviceRegistry, StatusChange};

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::AcdError;

/// Raw device status as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// State is not known
    Unknown,
    /// Idle and reachable
    NotInUse,
    /// On a call
    InUse,
    /// Busy, cannot take a call
    Busy,
    /// The state key does not resolve to a real device
    Invalid,
    /// Unregistered or unreachable
    Unavailable,
    /// Currently ringing
    Ringing,
    /// Ringing while already on a call
    RingInUse,
    /// On hold
    OnHold,
}

impl FromStr for DeviceStatus {
    type Err = AcdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(DeviceStatus::Unknown),
            "notinuse" | "not_in_use" => Ok(DeviceStatus::NotInUse),
            "inuse" | "in_use" => Ok(DeviceStatus::InUse),
            "busy" => Ok(DeviceStatus::Busy),
            "invalid" => Ok(DeviceStatus::Invalid),
            "unavailable" => Ok(DeviceStatus::Unavailable),
            "ringing" => Ok(DeviceStatus::Ringing),
            "ringinuse" | "ring_in_use" => Ok(DeviceStatus::RingInUse),
            "onhold" | "on_hold" => Ok(DeviceStatus::OnHold),
            _ => Err(AcdError::device(format!("unknown device status: {}", s))),
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::NotInUse => "notinuse",
            DeviceStatus::InUse => "inuse",
            DeviceStatus::Busy => "busy",
            DeviceStatus::Invalid => "invalid",
            DeviceStatus::Unavailable => "unavailable",
            DeviceStatus::Ringing => "ringing",
            DeviceStatus::RingInUse => "ringinuse",
            DeviceStatus::OnHold => "onhold",
        };
        write!(f, "{}", s)
    }
}

impl DeviceStatus {
    /// Raw statuses on which a ring attempt may proceed when the queue and
    /// member both permit ringing an in-use device.
    pub fn ringable_in_use(self) -> bool {
        matches!(
            self,
            DeviceStatus::InUse | DeviceStatus::Ringing | DeviceStatus::RingInUse | DeviceStatus::OnHold
        )
    }

    /// Raw statuses on which a ring attempt may always proceed.
    pub fn idle(self) -> bool {
        matches!(self, DeviceStatus::NotInUse | DeviceStatus::Unknown)
    }
}

/// One shared device record
///
/// `reserved` counts ring attempts that have claimed the device but not yet
/// completed; `active` counts calls currently bridged through it. Every
/// contribution is owned by exactly one [`crate::dispatch::Attempt`] and
/// released exactly once.
#[derive(Debug)]
pub struct Device {
    key: String,
    status: RwLock<DeviceStatus>,
    reserved: AtomicU32,
    active: AtomicU32,
}

impl Device {
    pub(crate) fn new(key: &str) -> Self {
        Device {
            key: key.to_string(),
            status: RwLock::new(DeviceStatus::Unknown),
            reserved: AtomicU32::new(0),
            active: AtomicU32::new(0),
        }
    }

    /// The state key this record was created under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw status as last reported by the transport.
    pub fn status(&self) -> DeviceStatus {
        *self.status.read()
    }

    /// Overwrite the raw status. Returns `true` if the value changed.
    pub fn set_raw_status(&self, status: DeviceStatus) -> bool {
        let mut guard = self.status.write();
        if *guard == status {
            false
        } else {
            *guard = status;
            true
        }
    }

    /// Current reservation count.
    pub fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Current active-call count.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn add_reservation(&self) {
        self.reserved.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn drop_reservation(&self) {
        let prev = self.reserved.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reservation underflow on {}", self.key);
    }

    pub(crate) fn add_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn drop_active(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "active underflow on {}", self.key);
    }

    /// Effective status seen by a member with the given `ring_in_use`
    /// permission
    ///
    /// The raw driver status is reconciled with the engine's own
    /// outstanding commitments: a device the engine is already ringing or
    /// talking through reads as Busy to members that may not be dialed
    /// while in use, and an idle raw status with outstanding commitments
    /// reads as InUse or Ringing.
    pub fn effective_status(&self, ring_in_use: bool) -> DeviceStatus {
        let raw = self.status();
        let reserved = self.reserved() > 0;
        let active = self.active() > 0;

        if raw.ringable_in_use() {
            if (reserved || active) && !ring_in_use {
                return DeviceStatus::Busy;
            }
            return raw;
        }

        if raw.idle() {
            if active {
                return if ring_in_use { DeviceStatus::InUse } else { DeviceStatus::Busy };
            }
            if reserved {
                return if ring_in_use { DeviceStatus::Ringing } else { DeviceStatus::Busy };
            }
        }

        raw
    }
}
