//! Queue members
//!
//! A member is one dialable agent scoped to a single queue, referencing a
//! shared [`Device`] record through its state key. The roster keeps members
//! in insertion order because the Linear and RROrdered strategies depend on
//! a stable walk.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::EmptyConditions;
use crate::device::{Device, DeviceStatus};
use crate::error::{AcdError, Result};

/// Where a member registration came from
///
/// Precedence for conflicting registrations of the same interface is
/// Static > Realtime > Dynamic: static overwrites anything, realtime
/// overwrites dynamic (and refreshes realtime), dynamic never overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Declared in the static configuration
    Static,
    /// Mirrored from an external realtime backend
    Realtime,
    /// Added at runtime through the management surface
    Dynamic,
}

impl FromStr for Provenance {
    type Err = AcdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Provenance::Static),
            "realtime" => Ok(Provenance::Realtime),
            "dynamic" => Ok(Provenance::Dynamic),
            _ => Err(AcdError::member(format!("unknown member provenance: {}", s))),
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Static => write!(f, "static"),
            Provenance::Realtime => write!(f, "realtime"),
            Provenance::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Parameters for adding or refreshing a member
#[derive(Debug, Clone)]
pub struct MemberSpec {
    /// Dialable interface, unique within the queue
    pub interface: String,
    /// Human-readable name
    pub display_name: String,
    /// State key for device lookup; defaults to the interface when empty
    pub state_key: String,
    /// Selection penalty; negative marks the member invalid
    pub penalty: i32,
    /// Initially paused
    pub paused: bool,
    /// May be dialed while its device is in use
    pub ring_in_use: bool,
    /// Registration source
    pub provenance: Provenance,
    /// Realtime row identifier, for reconciliation
    pub realtime_uid: Option<String>,
}

impl MemberSpec {
    /// A dynamic member with defaults matching the management surface.
    pub fn dynamic(interface: &str) -> Self {
        MemberSpec {
            interface: interface.to_string(),
            display_name: interface.to_string(),
            state_key: interface.to_string(),
            penalty: 0,
            paused: false,
            ring_in_use: true,
            provenance: Provenance::Dynamic,
            realtime_uid: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(AcdError::member("member interface cannot be empty"));
        }
        if self.state_key.is_empty() {
            return Err(AcdError::member("member state key cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemberState {
    display_name: String,
    penalty: i32,
    paused: bool,
    pause_reason: Option<String>,
    ring_in_use: bool,
    provenance: Provenance,
    dead: bool,
    realtime_uid: Option<String>,
    calls: u32,
    last_call_end: Option<Instant>,
    last_wrapup_secs: u64,
}

/// One member of one queue
#[derive(Debug)]
pub struct Member {
    interface: String,
    state_key: String,
    device: Arc<Device>,
    state: Mutex<MemberState>,
}

impl Member {
    fn new(spec: &MemberSpec, device: Arc<Device>) -> Self {
        Member {
            interface: spec.interface.clone(),
            state_key: spec.state_key.clone(),
            device,
            state: Mutex::new(MemberState {
                display_name: spec.display_name.clone(),
                penalty: spec.penalty,
                paused: spec.paused,
                pause_reason: None,
                ring_in_use: spec.ring_in_use,
                provenance: spec.provenance,
                dead: false,
                realtime_uid: spec.realtime_uid.clone(),
                calls: 0,
                last_call_end: None,
                last_wrapup_secs: 0,
            }),
        }
    }

    /// Dialable interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Device state key.
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Shared device record.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Human-readable name.
    pub fn display_name(&self) -> String {
        self.state.lock().display_name.clone()
    }

    /// Current penalty.
    pub fn penalty(&self) -> i32 {
        self.state.lock().penalty
    }

    /// Update the penalty.
    pub fn set_penalty(&self, penalty: i32) {
        self.state.lock().penalty = penalty;
    }

    /// Whether the member is paused.
    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Pause or unpause; returns `false` if the flag was already in the
    /// requested state.
    pub fn set_paused(&self, paused: bool, reason: Option<&str>) -> bool {
        let mut state = self.state.lock();
        if state.paused == paused {
            return false;
        }
        state.paused = paused;
        state.pause_reason = if paused { reason.map(str::to_string) } else { None };
        true
    }

    /// Reason given on the last pause, if any.
    pub fn pause_reason(&self) -> Option<String> {
        self.state.lock().pause_reason.clone()
    }

    /// Whether this member may be dialed while its device is in use.
    pub fn ring_in_use(&self) -> bool {
        self.state.lock().ring_in_use
    }

    /// Update the ring-in-use permission.
    pub fn set_ring_in_use(&self, allowed: bool) {
        self.state.lock().ring_in_use = allowed;
    }

    /// Registration source.
    pub fn provenance(&self) -> Provenance {
        self.state.lock().provenance
    }

    /// Realtime row identifier, if any.
    pub fn realtime_uid(&self) -> Option<String> {
        self.state.lock().realtime_uid.clone()
    }

    /// Lifetime completed-call count.
    pub fn calls(&self) -> u32 {
        self.state.lock().calls
    }

    /// Instant the member's last call ended, if any.
    pub fn last_call_end(&self) -> Option<Instant> {
        self.state.lock().last_call_end
    }

    /// Record a completed call and arm the wrapup window.
    pub fn record_completed_call(&self, now: Instant, wrapup_secs: u64) {
        let mut state = self.state.lock();
        state.calls += 1;
        state.last_call_end = Some(now);
        state.last_wrapup_secs = wrapup_secs;
    }

    /// Whether the member is still inside its wrapup window.
    pub fn in_wrapup(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match state.last_call_end {
            Some(end) => now.duration_since(end).as_secs() < state.last_wrapup_secs,
            None => false,
        }
    }

    /// Effective device status seen through this member's permissions.
    pub fn effective_status(&self) -> DeviceStatus {
        self.device.effective_status(self.ring_in_use())
    }

    pub(crate) fn mark_dead(&self) {
        self.state.lock().dead = true;
    }

    pub(crate) fn clear_dead(&self) {
        self.state.lock().dead = false;
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    fn refresh_from(&self, spec: &MemberSpec) {
        let mut state = self.state.lock();
        state.display_name = spec.display_name.clone();
        state.penalty = spec.penalty;
        state.ring_in_use = spec.ring_in_use;
        state.provenance = spec.provenance;
        state.realtime_uid = spec.realtime_uid.clone();
        state.dead = false;
    }
}

/// Outcome of a roster insert under provenance precedence
#[derive(Debug, Clone)]
pub enum RosterInsert {
    /// A new member was added
    Added(Arc<Member>),
    /// An existing member was refreshed in place
    Updated(Arc<Member>),
}

/// Insertion-ordered member set for one queue, keyed by interface
#[derive(Debug, Default)]
pub struct MemberRoster {
    members: Vec<Arc<Member>>,
}

impl MemberRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        MemberRoster { members: Vec::new() }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the roster has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up by interface.
    pub fn get(&self, interface: &str) -> Option<Arc<Member>> {
        self.members.iter().find(|m| m.interface() == interface).cloned()
    }

    /// Insertion index of an interface, the position Linear and RROrdered
    /// rank by.
    pub fn position_of(&self, interface: &str) -> Option<usize> {
        self.members.iter().position(|m| m.interface() == interface)
    }

    /// Iterate members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.members.iter()
    }

    /// Insert or refresh under provenance precedence
    ///
    /// Static overwrites anything, realtime overwrites dynamic or realtime,
    /// dynamic never overwrites. A refused insert leaves state unchanged.
    pub fn insert(&mut self, spec: MemberSpec, device: Arc<Device>) -> Result<RosterInsert> {
        spec.validate()?;

        if let Some(existing) = self.get(&spec.interface) {
            let can_overwrite = match (spec.provenance, existing.provenance()) {
                (Provenance::Static, _) => true,
                (Provenance::Realtime, Provenance::Dynamic | Provenance::Realtime) => true,
                _ => false,
            };
            if !can_overwrite {
                return Err(AcdError::already_exists(format!(
                    "member {} already registered as {}",
                    spec.interface,
                    existing.provenance()
                )));
            }
            existing.refresh_from(&spec);
            info!("👤 Refreshed member {} ({})", spec.interface, spec.provenance);
            return Ok(RosterInsert::Updated(existing));
        }

        if spec.provenance == Provenance::Realtime {
            if let Some(uid) = spec.realtime_uid.as_deref() {
                if self.members.iter().any(|m| m.realtime_uid().as_deref() == Some(uid)) {
                    warn!("duplicate realtime uniqueid {} rejected", uid);
                    return Err(AcdError::already_exists(format!(
                        "realtime uniqueid {} already present",
                        uid
                    )));
                }
            }
        }

        let member = Arc::new(Member::new(&spec, device));
        info!(
            "👤 Added member {} (penalty {}){}",
            spec.interface,
            spec.penalty,
            if spec.paused { " PAUSED" } else { "" }
        );
        self.members.push(member.clone());
        Ok(RosterInsert::Added(member))
    }

    /// Remove by interface; returns the removed member.
    pub fn remove(&mut self, interface: &str) -> Option<Arc<Member>> {
        let index = self.position_of(interface)?;
        let member = self.members.remove(index);
        info!("👤 Removed member {}", interface);
        Some(member)
    }

    /// Mark every realtime member dead. Reconciliation then refreshes the
    /// survivors and [`sweep_dead`] collects the deletions.
    ///
    /// [`sweep_dead`]: MemberRoster::sweep_dead
    pub fn mark_realtime_dead(&mut self) {
        for member in &self.members {
            if member.provenance() == Provenance::Realtime {
                member.mark_dead();
            }
        }
    }

    /// Remove and return every member still marked dead.
    pub fn sweep_dead(&mut self) -> Vec<Arc<Member>> {
        let (dead, alive): (Vec<_>, Vec<_>) =
            self.members.drain(..).partition(|m| m.is_dead());
        self.members = alive;
        for member in &dead {
            info!("👤 Removed stale realtime member {}", member.interface());
        }
        dead
    }

    /// Members in dialable shape right now: not paused, valid penalty, out
    /// of wrapup, device effectively idle (or ringable-in-use when the
    /// queue permits).
    pub fn available_count(&self, queue_ring_in_use: bool, now: Instant) -> usize {
        self.members
            .iter()
            .filter(|m| {
                if m.paused() || m.penalty() < 0 || m.in_wrapup(now) {
                    return false;
                }
                let status = m.effective_status();
                status.idle() || (queue_ring_in_use && m.ring_in_use() && status.ringable_in_use())
            })
            .count()
    }

    /// Members counting toward occupancy under the given empty-predicate
    /// conditions.
    pub fn occupancy_count(&self, conditions: &EmptyConditions, now: Instant) -> usize {
        self.members
            .iter()
            .filter(|m| {
                if conditions.paused && m.paused() {
                    return false;
                }
                if conditions.invalid_penalty && m.penalty() < 0 {
                    return false;
                }
                if conditions.wrapup && m.in_wrapup(now) {
                    return false;
                }
                match m.effective_status() {
                    DeviceStatus::InUse | DeviceStatus::OnHold | DeviceStatus::Busy => !conditions.in_use,
                    DeviceStatus::Ringing | DeviceStatus::RingInUse => !conditions.ringing,
                    DeviceStatus::Invalid | DeviceStatus::Unavailable => !conditions.unavailable,
                    DeviceStatus::Unknown => !conditions.unknown,
                    DeviceStatus::NotInUse => true,
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;

    fn spec(interface: &str, provenance: Provenance) -> MemberSpec {
        MemberSpec { provenance, ..MemberSpec::dynamic(interface) }
    }

    #[test]
    fn dynamic_never_overwrites() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();

        roster
            .insert(spec("PJSIP/alice", Provenance::Dynamic), devices.acquire("PJSIP/alice"))
            .unwrap();
        let err = roster
            .insert(spec("PJSIP/alice", Provenance::Dynamic), devices.acquire("PJSIP/alice"))
            .unwrap_err();
        assert!(matches!(err, AcdError::AlreadyExists(_)));
    }

    #[test]
    fn static_overwrites_everything() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();

        roster
            .insert(spec("PJSIP/alice", Provenance::Realtime), devices.acquire("PJSIP/alice"))
            .unwrap();
        let mut refresh = spec("PJSIP/alice", Provenance::Static);
        refresh.penalty = 7;
        let result = roster.insert(refresh, devices.acquire("PJSIP/alice")).unwrap();
        assert!(matches!(result, RosterInsert::Updated(_)));

        let member = roster.get("PJSIP/alice").unwrap();
        assert_eq!(member.penalty(), 7);
        assert_eq!(member.provenance(), Provenance::Static);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn realtime_does_not_overwrite_static() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();

        roster
            .insert(spec("PJSIP/bob", Provenance::Static), devices.acquire("PJSIP/bob"))
            .unwrap();
        assert!(roster
            .insert(spec("PJSIP/bob", Provenance::Realtime), devices.acquire("PJSIP/bob"))
            .is_err());
        assert_eq!(roster.get("PJSIP/bob").unwrap().provenance(), Provenance::Static);
    }

    #[test]
    fn duplicate_realtime_uid_rejected() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();

        let mut first = spec("PJSIP/x", Provenance::Realtime);
        first.realtime_uid = Some("row-1".to_string());
        roster.insert(first, devices.acquire("PJSIP/x")).unwrap();

        let mut second = spec("PJSIP/y", Provenance::Realtime);
        second.realtime_uid = Some("row-1".to_string());
        assert!(roster.insert(second, devices.acquire("PJSIP/y")).is_err());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn dead_sweep_removes_only_unrefreshed_realtime_members() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();

        for iface in ["PJSIP/x", "PJSIP/y", "PJSIP/z"] {
            roster.insert(spec(iface, Provenance::Realtime), devices.acquire(iface)).unwrap();
        }
        roster.insert(spec("PJSIP/static", Provenance::Static), devices.acquire("PJSIP/static")).unwrap();

        roster.mark_realtime_dead();
        // Reload saw y again.
        roster
            .insert(spec("PJSIP/y", Provenance::Realtime), devices.acquire("PJSIP/y"))
            .unwrap();

        let removed = roster.sweep_dead();
        let mut gone: Vec<_> = removed.iter().map(|m| m.interface().to_string()).collect();
        gone.sort();
        assert_eq!(gone, vec!["PJSIP/x", "PJSIP/z"]);
        assert_eq!(roster.len(), 2);
        assert!(roster.get("PJSIP/y").is_some());
        assert!(roster.get("PJSIP/static").is_some());
    }

    #[test]
    fn wrapup_window_blocks_until_elapsed() {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();
        roster.insert(spec("PJSIP/a", Provenance::Dynamic), devices.acquire("PJSIP/a")).unwrap();

        let member = roster.get("PJSIP/a").unwrap();
        let start = Instant::now();
        member.record_completed_call(start, 30);
        assert!(member.in_wrapup(start + std::time::Duration::from_secs(29)));
        assert!(!member.in_wrapup(start + std::time::Duration::from_secs(30)));
    }
}
