//! Waiting-caller state
//!
//! A [`WaitingClient`] is the per-caller state owned end-to-end by the
//! caller's task: its shared list entry, option flags, penalty window and
//! rule cursor, accumulated digits, and the flat set of interfaces already
//! dialed on its behalf (the forward-loop guard, which follows the caller
//! rather than any individual channel).

use std::collections::HashSet;
use std::time::Duration;

use std::sync::Arc;

use tokio::time::Instant;

use crate::queue::{RrCursor, WaitingEntry};
use crate::rules::{PenaltyWindow, RuleCursor};
use crate::transport::{ChannelId, PartyInfo};

/// Per-caller option flags
///
/// These arrive with the caller (dial-plan options in the original
/// deployment) and modulate ring, forwarding, and exit behavior for this
/// caller only.
#[derive(Debug, Clone)]
pub struct CallerOptions {
    /// Honor call-forward indications from rung members
    pub allow_forwarding: bool,
    /// Mark losing attempts "answered elsewhere" when hanging them up
    pub mark_answered_elsewhere: bool,
    /// Pass ring indication to the caller instead of hold music while a
    /// member is ringing
    pub ring_indication: bool,
    /// `*` pressed by the caller disconnects and leaves the queue
    pub disconnect_on_star: bool,
    /// Dial-plan context checked for exit digits; `None` disables digit
    /// exits
    pub exit_context: Option<String>,
    /// Record the bridged call under this base filename
    pub record_basename: Option<String>,
    /// Apply connected-line and redirecting updates toward the caller
    pub propagate_connected_updates: bool,
}

impl Default for CallerOptions {
    fn default() -> Self {
        CallerOptions {
            allow_forwarding: true,
            mark_answered_elsewhere: false,
            ring_indication: false,
            disconnect_on_star: false,
            exit_context: None,
            record_basename: None,
            propagate_connected_updates: true,
        }
    }
}

/// One caller waiting in (or ringing out of) a queue
#[derive(Debug)]
pub struct WaitingClient {
    entry: Arc<WaitingEntry>,
    queue_name: String,
    /// Option flags for this caller
    pub options: CallerOptions,
    /// Current penalty acceptance window
    pub window: PenaltyWindow,
    /// Cursor into the queue's penalty rule set, if one applies
    pub rule_cursor: Option<RuleCursor>,
    /// Caller-local cursor for the Linear strategy
    pub linear: RrCursor,
    /// Digits collected while waiting
    pub digits: String,
    /// Party identity the caller presented, if any
    pub caller_id: Option<PartyInfo>,
    /// Extension the caller dialed to reach the queue
    pub extension: Option<String>,
    expire_at: Option<Instant>,
    dialed_interfaces: HashSet<String>,
}

impl WaitingClient {
    /// Assemble the caller state at join time.
    pub fn new(
        entry: Arc<WaitingEntry>,
        queue_name: &str,
        options: CallerOptions,
        window: PenaltyWindow,
        rule_cursor: Option<RuleCursor>,
        timeout: Option<Duration>,
    ) -> Self {
        let expire_at = timeout.map(|t| entry.start + t);
        WaitingClient {
            entry,
            queue_name: queue_name.to_string(),
            options,
            window,
            rule_cursor,
            linear: RrCursor::default(),
            digits: String::new(),
            caller_id: None,
            extension: None,
            expire_at,
            dialed_interfaces: HashSet::new(),
        }
    }

    /// Shared list entry.
    pub fn entry(&self) -> &Arc<WaitingEntry> {
        &self.entry
    }

    /// Caller unique id.
    pub fn uid(&self) -> &str {
        &self.entry.uid
    }

    /// Caller channel.
    pub fn channel(&self) -> &ChannelId {
        &self.entry.channel
    }

    /// Queue this caller joined.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Absolute instant the caller times out, if a timeout was given.
    pub fn expire_at(&self) -> Option<Instant> {
        self.expire_at
    }

    /// Whether the caller's timeout has passed.
    pub fn has_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(at) if now >= at)
    }

    /// Whole seconds waited so far.
    pub fn wait_secs(&self, now: Instant) -> u64 {
        self.entry.wait_secs(now)
    }

    /// Apply every penalty rule due at `now`. Returns how many fired.
    pub fn advance_rules(&mut self, now: Instant) -> usize {
        let elapsed = self.entry.wait_secs(now);
        match self.rule_cursor.as_mut() {
            Some(cursor) => cursor.advance(elapsed, &mut self.window),
            None => 0,
        }
    }

    /// Record an interface as dialed for this caller. Returns `false` when
    /// it was already dialed, which breaks call-forward loops across
    /// chained dials.
    pub fn note_dialed(&mut self, interface: &str) -> bool {
        self.dialed_interfaces.insert(interface.to_string())
    }

    /// Whether an interface was already dialed for this caller.
    pub fn already_dialed(&self, interface: &str) -> bool {
        self.dialed_interfaces.contains(interface)
    }
}
