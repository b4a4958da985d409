//! Outbound attempts
//!
//! One [`Attempt`] is a single outbound ring on behalf of a waiting caller
//! toward one member. The attempt owns its contributions to the shared
//! device counters: a reservation while ringing, an active mark once it
//! wins. Every contribution is released exactly once on every path, and
//! the set's drop is the backstop, because a leaked contribution leaves
//! the device reading Busy for every future caller.

use std::sync::Arc;

use tracing::debug;

use crate::member::Member;
use crate::transport::{AocRate, ChannelId, PartyInfo};

/// One outbound ring toward one member
#[derive(Debug)]
pub struct Attempt {
    member: Arc<Member>,
    /// Outbound channel once the transport allocated one
    pub channel: Option<ChannelId>,
    /// Selection metric; lower is better
    pub metric: i64,
    /// The attempt is still a live candidate this ring cycle
    pub still_going: bool,
    /// The channel is in the event watch set
    pub watching: bool,
    /// Connected-line update saved until this attempt wins
    pub pending_connected: Option<PartyInfo>,
    /// Redirecting update saved until this attempt wins
    pub pending_redirecting: Option<PartyInfo>,
    /// Advice-of-charge rates replayed to the caller if this attempt wins
    pub aoc_rates: Vec<AocRate>,
    /// The caller presented no party identity when this attempt was
    /// placed; forwarded legs then get no connected-line copy
    pub dial_callerid_absent: bool,
    /// Forwarded-from party number, sent as the redirecting party on
    /// forwarded legs; the incoming extension unless a forward already
    /// set it
    pub forwarded_from: Option<String>,
    /// Instant the outbound started ringing, for ring-no-answer accounting
    pub ring_started: Option<tokio::time::Instant>,
    reserved: bool,
    active: bool,
}

impl Attempt {
    /// A fresh candidate with its computed metric.
    pub fn new(member: Arc<Member>, metric: i64) -> Self {
        Attempt {
            member,
            channel: None,
            metric,
            still_going: true,
            watching: false,
            pending_connected: None,
            pending_redirecting: None,
            aoc_rates: Vec::new(),
            dial_callerid_absent: false,
            forwarded_from: None,
            ring_started: None,
            reserved: false,
            active: false,
        }
    }

    /// The member this attempt targets.
    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    /// The member's interface.
    pub fn interface(&self) -> &str {
        self.member.interface()
    }

    /// Whether this attempt holds a device reservation.
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Whether this attempt holds the device's active mark.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the attempt is a live, not-yet-placed candidate.
    pub fn placeable(&self) -> bool {
        self.still_going && self.channel.is_none()
    }

    /// Claim the device for this ring. Idempotent: the device counter gets
    /// exactly one contribution no matter how often this is called.
    pub fn reserve(&mut self) {
        if !self.reserved {
            self.member.device().add_reservation();
            self.reserved = true;
        }
    }

    /// This attempt won: swap the reservation for an active mark.
    pub fn promote_active(&mut self) {
        if self.reserved {
            self.member.device().drop_reservation();
            self.reserved = false;
        }
        if !self.active {
            self.member.device().add_active();
            self.active = true;
        }
    }

    /// Drop whatever contributions this attempt holds.
    pub fn release_contributions(&mut self) {
        if self.reserved {
            self.member.device().drop_reservation();
            self.reserved = false;
        }
        if self.active {
            self.member.device().drop_active();
            self.active = false;
        }
    }

    /// Take the attempt out of the race and release its contributions.
    /// The owning dispatcher hangs up any channel separately.
    pub fn retire(&mut self) {
        self.still_going = false;
        self.watching = false;
        self.release_contributions();
        debug!("📵 Retired attempt toward {}", self.member.interface());
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.release_contributions();
    }
}

/// The per-caller collection of attempts for one ring cycle
#[derive(Debug, Default)]
pub struct AttemptSet {
    attempts: Vec<Attempt>,
}

impl AttemptSet {
    /// Empty set.
    pub fn new() -> Self {
        AttemptSet { attempts: Vec::new() }
    }

    /// Build a set from prepared attempts.
    pub fn from_attempts(attempts: Vec<Attempt>) -> Self {
        AttemptSet { attempts }
    }

    /// Number of attempts, live or not.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether the set holds no attempts.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// All attempts.
    pub fn iter(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter()
    }

    /// All attempts, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Attempt> {
        self.attempts.iter_mut()
    }

    /// Attempt at `index`.
    pub fn get(&self, index: usize) -> Option<&Attempt> {
        self.attempts.get(index)
    }

    /// Attempt at `index`, mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Attempt> {
        self.attempts.get_mut(index)
    }

    /// Index of the attempt that owns `channel`.
    pub fn index_by_channel(&self, channel: &ChannelId) -> Option<usize> {
        self.attempts
            .iter()
            .position(|a| a.channel.as_ref() == Some(channel))
    }

    /// Index of the attempt toward `interface`.
    pub fn index_by_interface(&self, interface: &str) -> Option<usize> {
        self.attempts.iter().position(|a| a.interface() == interface)
    }

    /// Channels to include in the event watch set: live, placed, watching.
    pub fn watch_channels(&self) -> Vec<ChannelId> {
        self.attempts
            .iter()
            .filter(|a| a.still_going && a.watching)
            .filter_map(|a| a.channel.clone())
            .collect()
    }

    /// Whether any attempt is still a live candidate (placed or not).
    pub fn any_live(&self) -> bool {
        self.attempts.iter().any(|a| a.still_going)
    }

    /// Number of attempts currently holding the active mark.
    pub fn active_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_active()).count()
    }

    /// Smallest metric among live, not-yet-placed attempts.
    pub fn best_placeable_metric(&self) -> Option<i64> {
        self.attempts
            .iter()
            .filter(|a| a.placeable())
            .map(|a| a.metric)
            .min()
    }

    /// Retire every attempt, releasing all contributions.
    pub fn retire_all(&mut self) {
        for attempt in &mut self.attempts {
            attempt.retire();
        }
    }
}
