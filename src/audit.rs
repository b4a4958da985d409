//! Line-oriented audit log
//!
//! One record per significant transition, in the classic pipe-separated
//! shape downstream reporting tools parse:
//!
//! ```text
//! <epoch>|<caller-uid>|<queue>|<agent>|<TAG>|<extra>|<extra>...
//! ```
//!
//! The sink is pluggable; the default forwards each line to `tracing`
//! under the `queue_log` target.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

/// Audit record tags emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditTag {
    /// Caller entered the queue
    EnterQueue,
    /// Member added through the management surface
    AddMember,
    /// Member removed
    RemoveMember,
    /// Member paused in one queue
    Pause,
    /// Member unpaused in one queue
    Unpause,
    /// Member paused in every queue
    PauseAll,
    /// Member unpaused in every queue
    UnpauseAll,
    /// Member penalty changed
    Penalty,
    /// Rung member failed to answer
    RingNoAnswer,
    /// Caller connected to a member
    Connect,
    /// Bridged call ended by the caller
    CompleteCaller,
    /// Bridged call ended by the member
    CompleteAgent,
    /// Bridged call transferred away
    Transfer,
    /// Caller hung up while waiting or ringing
    Abandon,
    /// Member answered then hung up before the bridge
    AgentDump,
    /// Bridge setup failed between incompatible channels
    SysCompat,
    /// Caller ejected by the leave-empty predicate
    ExitEmpty,
    /// Caller timed out waiting
    ExitWithTimeout,
    /// Caller exited by dialing digits
    ExitWithKey,
    /// Waiting caller was picked up outside the queue
    Pickup,
    /// Free-form tag from the management surface
    Custom(String),
}

impl fmt::Display for AuditTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditTag::EnterQueue => "ENTERQUEUE",
            AuditTag::AddMember => "ADDMEMBER",
            AuditTag::RemoveMember => "REMOVEMEMBER",
            AuditTag::Pause => "PAUSE",
            AuditTag::Unpause => "UNPAUSE",
            AuditTag::PauseAll => "PAUSEALL",
            AuditTag::UnpauseAll => "UNPAUSEALL",
            AuditTag::Penalty => "PENALTY",
            AuditTag::RingNoAnswer => "RINGNOANSWER",
            AuditTag::Connect => "CONNECT",
            AuditTag::CompleteCaller => "COMPLETECALLER",
            AuditTag::CompleteAgent => "COMPLETEAGENT",
            AuditTag::Transfer => "TRANSFER",
            AuditTag::Abandon => "ABANDON",
            AuditTag::AgentDump => "AGENTDUMP",
            AuditTag::SysCompat => "SYSCOMPAT",
            AuditTag::ExitEmpty => "EXITEMPTY",
            AuditTag::ExitWithTimeout => "EXITWITHTIMEOUT",
            AuditTag::ExitWithKey => "EXITWITHKEY",
            AuditTag::Pickup => "PICKUP",
            AuditTag::Custom(tag) => return write!(f, "{}", tag.to_ascii_uppercase()),
        };
        write!(f, "{}", s)
    }
}

/// Destination for formatted audit lines
pub trait AuditSink: Send + Sync {
    /// Persist or forward one formatted record.
    fn write(&self, line: &str);
}

/// Default sink: forwards lines to `tracing` under the `queue_log` target
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn write(&self, line: &str) {
        info!(target: "queue_log", "{}", line);
    }
}

/// In-memory sink collecting lines, for tests and management snapshots
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Copy of every recorded line.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines whose tag field equals `tag`.
    pub fn lines_with_tag(&self, tag: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.split('|').nth(4) == Some(tag))
            .cloned()
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn write(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// The audit log writer
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    /// Audit log writing through the default tracing sink.
    pub fn new() -> Self {
        AuditLog { sink: Arc::new(TracingSink) }
    }

    /// Audit log writing through a custom sink.
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> Self {
        AuditLog { sink }
    }

    /// Record one transition.
    ///
    /// `agent` is the member identity or `"NONE"` for caller-side records.
    pub fn record(&self, queue: &str, caller_uid: &str, agent: &str, tag: AuditTag, extras: &[&str]) {
        let mut line = format!(
            "{}|{}|{}|{}|{}",
            Utc::now().timestamp(),
            caller_uid,
            queue,
            agent,
            tag
        );
        for extra in extras {
            line.push('|');
            line.push_str(extra);
        }
        self.sink.write(&line);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
