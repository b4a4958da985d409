//! Penalty rule sets
//!
//! A rule set is a named, time-ordered list of adjustments to a waiting
//! caller's penalty acceptance window. As the caller's wait grows past each
//! rule's threshold the window widens (or narrows), changing which members
//! the ring selector will consider for that caller.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AcdError, Result};

/// A caller's current penalty acceptance window
///
/// Members whose penalty falls outside `[min, max]` are excluded from
/// selection while penalties are in effect. An unset bound does not
/// constrain; a bound of `Some(0)` really means zero, so a caller can
/// start accepting only penalty-0 members and have rules widen the window
/// from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PenaltyWindow {
    /// Lower bound, unconstrained when unset
    pub min: Option<i32>,
    /// Upper bound, unconstrained when unset
    pub max: Option<i32>,
}

impl PenaltyWindow {
    /// A window with explicit bounds.
    pub fn bounded(min: i32, max: i32) -> Self {
        PenaltyWindow { min: Some(min), max: Some(max) }
    }

    /// Whether `penalty` is acceptable under this window.
    pub fn accepts(&self, penalty: i32) -> bool {
        if matches!(self.max, Some(max) if penalty > max) {
            return false;
        }
        if matches!(self.min, Some(min) if penalty < min) {
            return false;
        }
        true
    }
}

/// One penalty adjustment applied at a point in the caller's wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyRule {
    /// Seconds since the caller entered the queue at which to apply
    pub time_secs: u64,
    /// New (or delta) upper bound
    pub max_value: i32,
    /// New (or delta) lower bound
    pub min_value: i32,
    /// `max_value` is relative to the current bound rather than absolute
    pub max_relative: bool,
    /// `min_value` is relative to the current bound rather than absolute
    pub min_relative: bool,
}

impl PenaltyRule {
    /// Apply this rule to a window. A relative adjustment of an unset
    /// bound starts from zero. Both bounds are floored at zero and the
    /// lower bound is clamped to the upper one.
    pub fn apply(&self, window: &mut PenaltyWindow) {
        let max = if self.max_relative {
            window.max.unwrap_or(0) + self.max_value
        } else {
            self.max_value
        };
        let min = if self.min_relative {
            window.min.unwrap_or(0) + self.min_value
        } else {
            self.min_value
        };
        let max = max.max(0);
        let min = min.max(0).min(max);
        window.max = Some(max);
        window.min = Some(min);
    }
}

/// Named, time-ordered collection of penalty rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    name: String,
    rules: Vec<PenaltyRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new(name: &str) -> Self {
        RuleSet { name: name.to_string(), rules: Vec::new() }
    }

    /// Rule-set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a rule, keeping the set ordered by `time_secs`.
    pub fn add_rule(&mut self, rule: PenaltyRule) {
        let at = self
            .rules
            .iter()
            .position(|r| r.time_secs > rule.time_secs)
            .unwrap_or(self.rules.len());
        self.rules.insert(at, rule);
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules in time order.
    pub fn rules(&self) -> &[PenaltyRule] {
        &self.rules
    }

    /// The rule with the smallest `time_secs >= elapsed`, or `None`.
    ///
    /// A waiting caller holds a cursor instead of calling this repeatedly;
    /// see [`RuleCursor`].
    pub fn best_rule_after(&self, elapsed_secs: u64) -> Option<&PenaltyRule> {
        self.rules.iter().find(|r| r.time_secs >= elapsed_secs)
    }

    fn rule_at(&self, index: usize) -> Option<&PenaltyRule> {
        self.rules.get(index)
    }
}

/// A caller's monotone position inside a rule set
///
/// Each advance applies every not-yet-applied rule whose threshold the
/// caller's wait has reached, in time order, and moves past it. Advancing
/// again without elapsed time is a no-op.
#[derive(Debug, Clone)]
pub struct RuleCursor {
    set: Arc<RuleSet>,
    next: usize,
}

impl RuleCursor {
    /// Cursor at the start of a rule set.
    pub fn new(set: Arc<RuleSet>) -> Self {
        RuleCursor { set, next: 0 }
    }

    /// Seconds at which the next pending rule fires, if any.
    pub fn next_deadline_secs(&self) -> Option<u64> {
        self.set.rule_at(self.next).map(|r| r.time_secs)
    }

    /// Apply every rule due at `elapsed_secs`. Returns how many fired.
    pub fn advance(&mut self, elapsed_secs: u64, window: &mut PenaltyWindow) -> usize {
        let mut fired = 0;
        while let Some(rule) = self.set.rule_at(self.next) {
            if rule.time_secs > elapsed_secs {
                break;
            }
            rule.apply(window);
            info!(
                "⏱️ Penalty rule {} fired at {}s: window now [{}, {}]",
                self.set.name(),
                rule.time_secs,
                window.min.map_or_else(|| "-".to_string(), |v| v.to_string()),
                window.max.map_or_else(|| "-".to_string(), |v| v.to_string()),
            );
            self.next += 1;
            fired += 1;
        }
        fired
    }
}

/// Registry of named rule sets
///
/// Rule sets are immutable once registered; a rules reload replaces whole
/// entries while callers that already hold a cursor keep the set they
/// started with.
#[derive(Debug, Default)]
pub struct RulesRegistry {
    sets: DashMap<String, Arc<RuleSet>>,
}

impl RulesRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        RulesRegistry { sets: DashMap::new() }
    }

    /// Register or replace a rule set.
    pub fn insert(&self, set: RuleSet) {
        self.sets.insert(set.name().to_string(), Arc::new(set));
    }

    /// Look up a rule set by name.
    pub fn get(&self, name: &str) -> Option<Arc<RuleSet>> {
        self.sets.get(name).map(|entry| entry.value().clone())
    }

    /// Look up a rule set, surfacing a typed error for unknown names.
    pub fn require(&self, name: &str) -> Result<Arc<RuleSet>> {
        self.get(name)
            .ok_or_else(|| AcdError::not_found(format!("rule set not found: {}", name)))
    }

    /// Remove a rule set; callers holding cursors are unaffected.
    pub fn remove(&self, name: &str) -> bool {
        self.sets.remove(name).is_some()
    }

    /// Names of every registered set.
    pub fn names(&self) -> Vec<String> {
        self.sets.iter().map(|entry| entry.key().clone()).collect()
    }
}
