//! Mutable per-queue state
//!
//! [`QueueData`] is the half of a queue that survives configuration
//! reloads: live statistics, the ordered waiting list, the round-robin
//! cursor, and the member roster. Join, Leave, and the stat update on
//! bridge exit all serialize through its locks, so observers never see a
//! partial transition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::member::MemberRoster;
use crate::transport::ChannelId;

/// Shared view of one waiting caller held by the list
///
/// The caller task owns the rest of its state privately; the list holds
/// this entry so it can renumber positions when other callers come and go.
#[derive(Debug)]
pub struct WaitingEntry {
    /// Caller unique id (channel uid or generated)
    pub uid: String,
    /// The caller's channel
    pub channel: ChannelId,
    /// Higher priority wins an earlier position
    pub priority: i32,
    /// Wall-clock join time, for events and audit records
    pub joined_at: DateTime<Utc>,
    /// Monotonic join instant, for holdtime math
    pub start: Instant,
    position: AtomicUsize,
    original_position: AtomicUsize,
}

impl WaitingEntry {
    /// Create an entry for a caller about to join.
    pub fn new(uid: &str, channel: ChannelId, priority: i32) -> Self {
        WaitingEntry {
            uid: uid.to_string(),
            channel,
            priority,
            joined_at: Utc::now(),
            start: Instant::now(),
            position: AtomicUsize::new(0),
            original_position: AtomicUsize::new(0),
        }
    }

    /// Current 1-based position in the waiting list.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    /// Position assigned at insertion time.
    pub fn original_position(&self) -> usize {
        self.original_position.load(Ordering::SeqCst)
    }

    /// Whole seconds this caller has been waiting.
    pub fn wait_secs(&self, now: Instant) -> u64 {
        now.duration_since(self.start).as_secs()
    }
}

/// Priority-ordered waiting list
///
/// Position equals the 1-based index at all times while the list lock is
/// held; every insertion and removal renumbers the tail.
#[derive(Debug, Default)]
pub struct WaitingList {
    entries: Vec<Arc<WaitingEntry>>,
}

impl WaitingList {
    /// Number of waiting callers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WaitingEntry>> {
        self.entries.iter()
    }

    /// 0-based index of a caller.
    pub fn index_of(&self, uid: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.uid == uid)
    }

    /// Insert a caller
    ///
    /// The default slot is the tail of the caller's priority class (before
    /// the first entry with strictly lower priority). A requested 1-based
    /// position may move the caller earlier or later within that class but
    /// never ahead of a higher-priority entry and never behind a
    /// lower-priority one. Returns the assigned 1-based position.
    pub fn insert(&mut self, entry: Arc<WaitingEntry>, requested_position: Option<usize>) -> usize {
        let class_start = self
            .entries
            .iter()
            .position(|e| e.priority <= entry.priority)
            .unwrap_or(self.entries.len());
        let class_end = self
            .entries
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.entries.len());

        let index = match requested_position {
            Some(pos) => (pos.saturating_sub(1)).clamp(class_start, class_end),
            None => class_end,
        };

        entry.original_position.store(index + 1, Ordering::SeqCst);
        self.entries.insert(index, entry);
        self.renumber();
        index + 1
    }

    /// Remove a caller by uid; the tail is renumbered.
    pub fn remove(&mut self, uid: &str) -> Option<Arc<WaitingEntry>> {
        let index = self.index_of(uid)?;
        let entry = self.entries.remove(index);
        self.renumber();
        Some(entry)
    }

    fn renumber(&self) {
        for (index, entry) in self.entries.iter().enumerate() {
            entry.position.store(index + 1, Ordering::SeqCst);
        }
    }
}

/// Live statistics for one queue
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    /// Exponential moving average of answered callers' wait, seconds
    pub holdtime_avg_secs: u64,
    /// Exponential moving average of bridged talk time, seconds
    pub talktime_avg_secs: u64,
    /// Completed (bridged) calls
    pub completed: u64,
    /// Completions whose wait was under the service level
    pub completed_in_sl: u64,
    /// Callers who hung up while waiting or ringing
    pub abandoned: u64,
}

impl QueueStats {
    /// Fold one completion into the averages: `new = (3*old + sample) / 4`.
    pub fn record_completion(&mut self, hold_secs: u64, talk_secs: u64, in_service_level: bool) {
        self.holdtime_avg_secs = (self.holdtime_avg_secs * 3 + hold_secs) / 4;
        self.talktime_avg_secs = (self.talktime_avg_secs * 3 + talk_secs) / 4;
        self.completed += 1;
        if in_service_level {
            self.completed_in_sl += 1;
        }
    }

    /// Record an abandoned caller.
    pub fn record_abandon(&mut self) {
        self.abandoned += 1;
    }

    /// Reset every counter and average to zero.
    pub fn reset(&mut self) {
        *self = QueueStats::default();
    }
}

/// Queue-wide round-robin cursor shared by RRMemory and RROrdered
#[derive(Debug, Default, Clone, Copy)]
pub struct RrCursor {
    /// Insertion index the next round starts from
    pub pos: usize,
    /// A previous round saw members past the cursor
    pub wrapped: bool,
}

/// The mutable half of a queue
///
/// Shared between the old and new [`crate::queue::Queue`] values across a
/// configuration reload, so waiting callers and statistics survive.
#[derive(Debug)]
pub struct QueueData {
    waiting: Mutex<WaitingList>,
    count: AtomicUsize,
    stats: Mutex<QueueStats>,
    members: RwLock<MemberRoster>,
    rr: parking_lot::Mutex<RrCursor>,
}

impl QueueData {
    /// Fresh state for a newly created queue.
    pub fn new() -> Self {
        QueueData {
            waiting: Mutex::new(WaitingList::default()),
            count: AtomicUsize::new(0),
            stats: Mutex::new(QueueStats::default()),
            members: RwLock::new(MemberRoster::new()),
            rr: parking_lot::Mutex::new(RrCursor::default()),
        }
    }

    /// Waiting-caller count without taking the list lock.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// The waiting list; lock order is queue-data before device.
    pub fn waiting(&self) -> &Mutex<WaitingList> {
        &self.waiting
    }

    /// Insert a caller and keep the cheap counter in sync. Returns the
    /// assigned 1-based position.
    pub async fn insert_caller(
        &self,
        entry: Arc<WaitingEntry>,
        requested_position: Option<usize>,
    ) -> usize {
        let mut list = self.waiting.lock().await;
        let position = list.insert(entry, requested_position);
        self.count.store(list.len(), Ordering::SeqCst);
        position
    }

    /// Remove a caller and keep the cheap counter in sync.
    pub async fn remove_caller(&self, uid: &str) -> Option<Arc<WaitingEntry>> {
        let mut list = self.waiting.lock().await;
        let entry = list.remove(uid);
        self.count.store(list.len(), Ordering::SeqCst);
        entry
    }

    /// Queue statistics.
    pub fn stats(&self) -> &Mutex<QueueStats> {
        &self.stats
    }

    /// The member roster.
    pub fn members(&self) -> &RwLock<MemberRoster> {
        &self.members
    }

    /// Snapshot of the round-robin cursor.
    pub fn rr_cursor(&self) -> RrCursor {
        *self.rr.lock()
    }

    /// Store the round-robin cursor after a ring round.
    pub fn set_rr_cursor(&self, cursor: RrCursor) {
        *self.rr.lock() = cursor;
    }
}

impl Default for QueueData {
    fn default() -> Self {
        Self::new()
    }
}
