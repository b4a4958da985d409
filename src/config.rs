use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AcdError, Result};

/// Ring strategy for distributing calls over a queue's members
///
/// The strategy decides how the metric for each candidate member is
/// computed at attempt-list construction time; lower metric means higher
/// preference. See [`crate::dispatch::RingSelector`] for the exact formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Ring every candidate in the best metric band in parallel
    RingAll,
    /// Prefer the member idle for the longest time
    LeastRecent,
    /// Prefer the member with the fewest completed calls
    FewestCalls,
    /// Uniform random choice, penalty bands respected
    Random,
    /// Round robin with a queue-wide remembered cursor
    RrMemory,
    /// Walk members strictly in insertion order per caller
    Linear,
    /// Random with penalty widening the spread instead of banding
    WeightedRandom,
    /// Round robin over a stable ordered member list
    RrOrdered,
}

impl FromStr for Strategy {
    type Err = AcdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ringall" => Ok(Strategy::RingAll),
            "leastrecent" => Ok(Strategy::LeastRecent),
            "fewestcalls" => Ok(Strategy::FewestCalls),
            "random" => Ok(Strategy::Random),
            "rrmemory" | "roundrobin" => Ok(Strategy::RrMemory),
            "linear" => Ok(Strategy::Linear),
            "wrandom" | "weightedrandom" => Ok(Strategy::WeightedRandom),
            "rrordered" => Ok(Strategy::RrOrdered),
            _ => Err(AcdError::configuration(format!("unknown ring strategy: {}", s))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::RingAll => "ringall",
            Strategy::LeastRecent => "leastrecent",
            Strategy::FewestCalls => "fewestcalls",
            Strategy::Random => "random",
            Strategy::RrMemory => "rrmemory",
            Strategy::Linear => "linear",
            Strategy::WeightedRandom => "wrandom",
            Strategy::RrOrdered => "rrordered",
        };
        write!(f, "{}", s)
    }
}

/// Autopause policy applied when a member fails to answer a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutopausePolicy {
    /// Never pause members automatically
    No,
    /// Pause the member in the originating queue only
    Yes,
    /// Pause the member in every queue it belongs to
    All,
}

impl FromStr for AutopausePolicy {
    type Err = AcdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "false" | "off" => Ok(AutopausePolicy::No),
            "yes" | "true" | "on" => Ok(AutopausePolicy::Yes),
            "all" => Ok(AutopausePolicy::All),
            _ => Err(AcdError::configuration(format!("unknown autopause policy: {}", s))),
        }
    }
}

impl std::fmt::Display for AutopausePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutopausePolicy::No => write!(f, "no"),
            AutopausePolicy::Yes => write!(f, "yes"),
            AutopausePolicy::All => write!(f, "all"),
        }
    }
}

/// Member conditions that make a member not count toward queue occupancy
///
/// Used by the join-empty and leave-empty predicates: a queue is considered
/// empty when every member matches at least one flagged condition. Each flag
/// excludes members in the corresponding state from the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyConditions {
    /// Exclude paused members
    pub paused: bool,
    /// Exclude members with an invalid (negative) penalty
    pub invalid_penalty: bool,
    /// Exclude members whose device is in use or on hold
    pub in_use: bool,
    /// Exclude members whose device is ringing
    pub ringing: bool,
    /// Exclude members whose device is unavailable or invalid
    pub unavailable: bool,
    /// Exclude members inside their wrapup window
    pub wrapup: bool,
    /// Exclude members whose device state is unknown
    pub unknown: bool,
}

impl EmptyConditions {
    /// Only structurally unusable members are excluded.
    pub fn loose() -> Self {
        EmptyConditions {
            paused: false,
            invalid_penalty: true,
            in_use: false,
            ringing: false,
            unavailable: true,
            wrapup: false,
            unknown: false,
        }
    }

    /// Everything that cannot take a call right now is excluded.
    pub fn strict() -> Self {
        EmptyConditions {
            paused: true,
            invalid_penalty: true,
            in_use: true,
            ringing: true,
            unavailable: true,
            wrapup: true,
            unknown: true,
        }
    }
}

/// One side of the empty predicate (join or leave)
///
/// When disabled, the predicate never fires: callers always join and are
/// never ejected for emptiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyCheck {
    /// Whether this predicate is evaluated at all
    pub enabled: bool,
    /// Conditions that exclude a member from the occupancy count
    pub conditions: EmptyConditions,
}

impl EmptyCheck {
    /// Predicate disabled; occupancy is never checked.
    pub fn disabled() -> Self {
        EmptyCheck { enabled: false, conditions: EmptyConditions::loose() }
    }

    /// Predicate enabled with the given exclusion conditions.
    pub fn enabled(conditions: EmptyConditions) -> Self {
        EmptyCheck { enabled: true, conditions }
    }
}

/// Announcement schedule for waiting callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceConfig {
    /// Seconds between position/holdtime announcements; 0 disables them
    pub frequency_secs: u64,
    /// Announce the caller's position in the queue
    pub announce_position: bool,
    /// Announce the queue's average holdtime
    pub announce_holdtime: bool,
    /// Prompt names played round-robin on the periodic schedule
    pub periodic_prompts: Vec<String>,
    /// Seconds between periodic prompts; 0 disables them
    pub periodic_frequency_secs: u64,
    /// Prompt played to the answering member before the bridge
    pub agent_prompt: Option<String>,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        AnnounceConfig {
            frequency_secs: 0,
            announce_position: true,
            announce_holdtime: false,
            periodic_prompts: Vec::new(),
            periodic_frequency_secs: 0,
            agent_prompt: None,
        }
    }
}

/// Configuration for a single named queue
///
/// This is the immutable half of a queue: a reload builds a fresh
/// [`crate::queue::Queue`] from a new `QueueConfig` while the mutable
/// [`crate::queue::QueueData`] (statistics, waiting list, members) is
/// carried over.
///
/// # Examples
///
/// ```
/// use acd_engine::config::{QueueConfig, Strategy};
///
/// let mut config = QueueConfig::default();
/// config.strategy = Strategy::RingAll;
/// config.ring_timeout_secs = 15;
/// config.service_level_secs = 60;
/// config.validate().expect("default-derived config is valid");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Ring strategy for member selection
    pub strategy: Strategy,

    /// Seconds a single outbound attempt is allowed to ring
    pub ring_timeout_secs: u64,

    /// Seconds to sleep between ring rounds
    pub retry_secs: u64,

    /// Default per-member wrapup window after a completed call, in seconds
    pub wrapup_secs: u64,

    /// Seconds to delay before connecting caller and member after answer
    pub member_delay_secs: u64,

    /// Service-level threshold in seconds; completions under it count as
    /// in-SL
    pub service_level_secs: u64,

    /// Cross-queue preemption weight; higher-weight queues claim shared
    /// members first
    pub weight: u32,

    /// Maximum number of waiting callers; 0 means unlimited
    pub maxlen: usize,

    /// Ring a caller as soon as enough members are free rather than only at
    /// the head position
    pub autofill: bool,

    /// Allow ringing members whose device is already in use (the member's
    /// own `ring_in_use` flag must also permit it)
    pub ring_in_use: bool,

    /// Refresh the remaining ring timeout whenever an attempt transitions
    pub timeout_restart: bool,

    /// Member count above which penalties take effect; 0 disables penalty
    /// handling entirely
    pub penalty_members_limit: usize,

    /// Announcement schedule for waiting callers
    pub announce: AnnounceConfig,

    /// Join-side empty predicate
    pub join_empty: EmptyCheck,

    /// Leave-side empty predicate
    pub leave_empty: EmptyCheck,

    /// Autopause policy on ring-no-answer
    pub autopause: AutopausePolicy,

    /// Granularity in seconds for announced holdtimes; 0 reports raw
    /// seconds
    pub holdtime_rounding_secs: u64,

    /// Name of the penalty rule set applied to callers by default
    pub default_rule: Option<String>,

    /// Suppress per-member device status events for this queue
    pub mask_member_status: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            strategy: Strategy::RingAll,
            ring_timeout_secs: 15,
            retry_secs: 5,
            wrapup_secs: 0,
            member_delay_secs: 0,
            service_level_secs: 0,
            weight: 0,
            maxlen: 0,
            autofill: true,
            ring_in_use: true,
            timeout_restart: false,
            penalty_members_limit: 0,
            announce: AnnounceConfig::default(),
            join_empty: EmptyCheck::disabled(),
            leave_empty: EmptyCheck::disabled(),
            autopause: AutopausePolicy::No,
            holdtime_rounding_secs: 0,
            default_rule: None,
            mask_member_status: false,
        }
    }
}

impl QueueConfig {
    /// Validate the configuration
    ///
    /// Returns `AcdError::Configuration` on the first invalid value; the
    /// config is left untouched either way.
    pub fn validate(&self) -> Result<()> {
        if self.ring_timeout_secs == 0 {
            return Err(AcdError::configuration("ring_timeout_secs must be at least 1"));
        }
        if self.retry_secs == 0 {
            return Err(AcdError::configuration("retry_secs must be at least 1"));
        }
        if self.announce.periodic_frequency_secs > 0 && self.announce.periodic_prompts.is_empty() {
            return Err(AcdError::configuration(
                "periodic announcements enabled but no prompts configured",
            ));
        }
        Ok(())
    }

    /// Ring timeout as a [`Duration`].
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// Retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

/// Engine-wide settings shared by all queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Persist dynamic member changes through the key/value store
    pub persist_dynamic_members: bool,

    /// Number of events retained for late-attaching observers
    pub event_history_limit: usize,

    /// Interval for the stuck-reservation diagnostic sweep; 0 disables it
    pub stuck_sweep_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            persist_dynamic_members: false,
            event_history_limit: 256,
            stuck_sweep_secs: 0,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.event_history_limit == 0 {
            return Err(AcdError::configuration("event_history_limit must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_strings() {
        for name in ["ringall", "leastrecent", "fewestcalls", "random", "rrmemory", "linear", "wrandom", "rrordered"] {
            let s: Strategy = name.parse().unwrap();
            assert_eq!(s.to_string(), name);
        }
        assert!("shuffle".parse::<Strategy>().is_err());
    }

    #[test]
    fn autopause_parses_aliases() {
        assert_eq!("yes".parse::<AutopausePolicy>().unwrap(), AutopausePolicy::Yes);
        assert_eq!("ALL".parse::<AutopausePolicy>().unwrap(), AutopausePolicy::All);
        assert_eq!("off".parse::<AutopausePolicy>().unwrap(), AutopausePolicy::No);
    }

    #[test]
    fn default_config_is_valid() {
        QueueConfig::default().validate().unwrap();
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_ring_timeout_rejected() {
        let mut config = QueueConfig::default();
        config.ring_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn periodic_announce_without_prompts_rejected() {
        let mut config = QueueConfig::default();
        config.announce.periodic_frequency_secs = 30;
        assert!(config.validate().is_err());
    }
}
