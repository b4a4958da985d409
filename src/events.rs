//! Typed event bus
//!
//! Real-time notifications for everything the engine does: callers joining
//! and leaving, member lifecycle, ring attempts, connects and completions.
//! Events are broadcast to any number of subscribers and retained in a
//! bounded history so late-attaching observers can catch up.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::device::DeviceStatus;

/// What happened, with the fields observers need
#[derive(Debug, Clone)]
pub enum QueueEventKind {
    /// A caller joined the waiting list
    Join {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Assigned 1-based position
        position: usize,
        /// Waiting-list size after the join
        count: usize,
        /// Caller priority
        priority: i32,
    },
    /// A caller left the waiting list, for any reason
    Leave {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Waiting-list size after the leave
        count: usize,
    },
    /// A caller hung up before being connected
    CallerAbandon {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Position at abandon time
        position: usize,
        /// Position assigned at join time
        original_position: usize,
        /// Seconds waited before abandoning
        hold_secs: u64,
    },
    /// A member was added to a queue
    MemberAdded {
        /// Queue name
        queue: String,
        /// Member interface
        interface: String,
        /// Initial penalty
        penalty: i32,
        /// Whether the member starts paused
        paused: bool,
    },
    /// A member was removed from a queue
    MemberRemoved {
        /// Queue name
        queue: String,
        /// Member interface
        interface: String,
    },
    /// A member's effective device status changed
    MemberStatus {
        /// Queue name
        queue: String,
        /// Member interface
        interface: String,
        /// New effective status
        status: DeviceStatus,
    },
    /// A member was paused or unpaused
    MemberPaused {
        /// Queue name
        queue: String,
        /// Member interface
        interface: String,
        /// New paused flag
        paused: bool,
        /// Reason supplied with the pause, if any
        reason: Option<String>,
    },
    /// A member's penalty changed
    MemberPenalty {
        /// Queue name
        queue: String,
        /// Member interface
        interface: String,
        /// New penalty
        penalty: i32,
    },
    /// An outbound attempt started ringing a member
    AgentCalled {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Member interface
        interface: String,
    },
    /// A member answered and was bridged to the caller
    AgentConnect {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Member interface
        interface: String,
        /// Seconds the caller waited before the answer
        hold_secs: u64,
        /// Seconds the winning attempt rang
        ring_secs: u64,
    },
    /// A bridged call finished
    AgentComplete {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Member interface
        interface: String,
        /// Seconds the caller waited before the answer
        hold_secs: u64,
        /// Seconds the parties were bridged
        talk_secs: u64,
        /// Whether the member, rather than the caller, ended the call
        ended_by_agent: bool,
    },
    /// A rung member failed to answer in time (or was busy)
    AgentRingNoAnswer {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Member interface
        interface: String,
        /// Milliseconds the attempt rang before failing
        ring_ms: u64,
    },
    /// A member answered and hung up before being bridged
    AgentDump {
        /// Queue name
        queue: String,
        /// Caller unique id
        caller_uid: String,
        /// Member interface
        interface: String,
    },
}

/// One emitted event
#[derive(Debug, Clone)]
pub struct QueueEvent {
    /// Unique event id
    pub id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// The payload
    pub kind: QueueEventKind,
}

/// Broadcast event bus with bounded history
///
/// # Examples
///
/// ```
/// use acd_engine::events::{EventBus, QueueEventKind};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
///
/// bus.emit(QueueEventKind::Join {
///     queue: "support".to_string(),
///     caller_uid: "caller-1".to_string(),
///     position: 1,
///     count: 1,
///     priority: 0,
/// });
///
/// let event = rx.try_recv().unwrap();
/// assert!(matches!(event.kind, QueueEventKind::Join { .. }));
/// assert_eq!(bus.history().len(), 1);
/// ```
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
    history: Mutex<VecDeque<QueueEvent>>,
    history_limit: usize,
}

impl EventBus {
    /// Create a bus retaining up to `history_limit` past events.
    pub fn new(history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        EventBus {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(1024))),
            history_limit: history_limit.max(1),
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to subscribers and the history buffer.
    pub fn emit(&self, kind: QueueEventKind) {
        let event = QueueEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        };
        debug!("📣 {:?}", event.kind);
        {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is fine; the history still records it.
        let _ = self.tx.send(event);
    }

    /// Copy of the retained history, oldest first.
    pub fn history(&self) -> Vec<QueueEvent> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(queue: &str, uid: &str) -> QueueEventKind {
        QueueEventKind::Join {
            queue: queue.to_string(),
            caller_uid: uid.to_string(),
            position: 1,
            count: 1,
            priority: 0,
        }
    }

    #[test]
    fn history_is_bounded_oldest_dropped() {
        let bus = EventBus::new(2);
        bus.emit(join("q", "a"));
        bus.emit(join("q", "b"));
        bus.emit(join("q", "c"));

        let history = bus.history();
        assert_eq!(history.len(), 2);
        let uids: Vec<_> = history
            .iter()
            .map(|e| match &e.kind {
                QueueEventKind::Join { caller_uid, .. } => caller_uid.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(uids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(join("support", "caller-9"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, QueueEventKind::Join { .. }));
    }
}
