//! Management surface
//!
//! [`Admin`] is the façade management channels (CLI, AMI-style buses,
//! HTTP) call into: member lifecycle, pause and penalty control,
//! statistics reset, queue and rule snapshots, and the three reload
//! scopes. Every mutation is audited and emitted on the event bus, and
//! dynamic-member changes are written through the persistence adapter
//! when one is configured.

use std::sync::Arc;

use tracing::info;

use crate::audit::AuditTag;
use crate::config::{QueueConfig, Strategy};
use crate::device::DeviceStatus;
use crate::dispatch::Dispatcher;
use crate::error::{AcdError, Result};
use crate::events::QueueEventKind;
use crate::member::{MemberSpec, Provenance, RosterInsert};
use crate::queue::Queue;
use crate::rules::{PenaltyRule, RuleSet};

/// Point-in-time view of one member for summaries
#[derive(Debug, Clone)]
pub struct MemberSummary {
    /// Dialable interface
    pub interface: String,
    /// Display name
    pub display_name: String,
    /// Current penalty
    pub penalty: i32,
    /// Lifetime completed calls
    pub calls: u32,
    /// Paused flag
    pub paused: bool,
    /// Effective device status
    pub status: DeviceStatus,
    /// Registration source
    pub provenance: Provenance,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone)]
pub struct QueueSummary {
    /// Queue name
    pub name: String,
    /// Ring strategy
    pub strategy: Strategy,
    /// Waiting callers right now
    pub waiting: usize,
    /// Holdtime moving average, seconds
    pub holdtime_avg_secs: u64,
    /// Talk-time moving average, seconds
    pub talktime_avg_secs: u64,
    /// Completed calls
    pub completed: u64,
    /// Completions inside the service level
    pub completed_in_sl: u64,
    /// Abandoned callers
    pub abandoned: u64,
    /// Share of completions inside the service level, percent
    pub service_level_pct: f64,
    /// Member snapshot
    pub members: Vec<MemberSummary>,
}

/// Result of a realtime member reconciliation
#[derive(Debug, Clone, Default)]
pub struct RealtimeReconcile {
    /// Interfaces newly added
    pub added: Vec<String>,
    /// Interfaces refreshed in place
    pub kept: Vec<String>,
    /// Interfaces removed as stale
    pub removed: Vec<String>,
}

/// Management operations over a running engine
pub struct Admin {
    engine: Arc<Dispatcher>,
}

impl Admin {
    /// Management surface over the given engine.
    pub fn new(engine: Arc<Dispatcher>) -> Self {
        Admin { engine }
    }

    /// Add a member to a queue
    ///
    /// Provenance precedence applies; a dynamic add of an existing
    /// interface is rejected.
    pub async fn add_member(&self, queue_name: &str, spec: MemberSpec) -> Result<()> {
        let queue = self.engine.queues().require(queue_name)?;
        let device = self.engine.devices().acquire(&spec.state_key);
        let penalty = spec.penalty;
        let paused = spec.paused;
        let interface = spec.interface.clone();
        let provenance = spec.provenance;

        let inserted = {
            let mut roster = queue.data().members().write().await;
            match roster.insert(spec, device.clone()) {
                Ok(result) => result,
                Err(e) => {
                    self.engine.devices().release(device);
                    return Err(e);
                }
            }
        };

        if matches!(inserted, RosterInsert::Added(_)) {
            self.engine.audit().record(
                queue_name,
                "NONE",
                &interface,
                AuditTag::AddMember,
                &[if paused { "PAUSED" } else { "" }],
            );
            self.engine.events().emit(QueueEventKind::MemberAdded {
                queue: queue_name.to_string(),
                interface,
                penalty,
                paused,
            });
        }
        if provenance == Provenance::Dynamic {
            self.persist(&queue).await;
        }
        Ok(())
    }

    /// Remove a member from a queue.
    pub async fn remove_member(&self, queue_name: &str, interface: &str) -> Result<()> {
        let queue = self.engine.queues().require(queue_name)?;
        let member = {
            let mut roster = queue.data().members().write().await;
            roster
                .remove(interface)
                .ok_or_else(|| AcdError::not_found(format!("member not found: {}", interface)))?
        };

        let was_dynamic = member.provenance() == Provenance::Dynamic;
        self.engine.devices().release(member.device().clone());
        self.engine
            .audit()
            .record(queue_name, "NONE", interface, AuditTag::RemoveMember, &[]);
        self.engine.events().emit(QueueEventKind::MemberRemoved {
            queue: queue_name.to_string(),
            interface: interface.to_string(),
        });
        if was_dynamic {
            self.persist(&queue).await;
        }
        Ok(())
    }

    /// Pause or unpause a member, in one queue or in every queue listing
    /// it. Returns how many queues changed.
    pub async fn pause_member(
        &self,
        queue_name: Option<&str>,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<usize> {
        let targets: Vec<Arc<Queue>> = match queue_name {
            Some(name) => vec![self.engine.queues().require(name)?],
            None => self.engine.queues().snapshot(),
        };

        let mut changed = 0;
        for queue in &targets {
            let member = {
                let roster = queue.data().members().read().await;
                roster.get(interface)
            };
            let Some(member) = member else {
                continue;
            };
            if member.set_paused(paused, reason) {
                changed += 1;
                let tag = match (queue_name.is_some(), paused) {
                    (true, true) => AuditTag::Pause,
                    (true, false) => AuditTag::Unpause,
                    (false, true) => AuditTag::PauseAll,
                    (false, false) => AuditTag::UnpauseAll,
                };
                self.engine.audit().record(
                    queue.name(),
                    "NONE",
                    interface,
                    tag,
                    &[reason.unwrap_or("")],
                );
                self.engine.events().emit(QueueEventKind::MemberPaused {
                    queue: queue.name().to_string(),
                    interface: interface.to_string(),
                    paused,
                    reason: reason.map(str::to_string),
                });
                if member.provenance() == Provenance::Dynamic {
                    self.persist(queue).await;
                }
            }
        }

        if changed == 0 && queue_name.is_some() {
            return Err(AcdError::not_found(format!("member not found: {}", interface)));
        }
        Ok(changed)
    }

    /// Change a member's penalty. Negative penalties are a configuration
    /// concern, not a management one, and are rejected here.
    pub async fn set_penalty(&self, queue_name: &str, interface: &str, penalty: i32) -> Result<()> {
        if penalty < 0 {
            return Err(AcdError::invalid_input("penalty must be non-negative"));
        }
        let queue = self.engine.queues().require(queue_name)?;
        let member = {
            let roster = queue.data().members().read().await;
            roster
                .get(interface)
                .ok_or_else(|| AcdError::not_found(format!("member not found: {}", interface)))?
        };
        member.set_penalty(penalty);
        self.engine.audit().record(
            queue_name,
            "NONE",
            interface,
            AuditTag::Penalty,
            &[&penalty.to_string()],
        );
        self.engine.events().emit(QueueEventKind::MemberPenalty {
            queue: queue_name.to_string(),
            interface: interface.to_string(),
            penalty,
        });
        if member.provenance() == Provenance::Dynamic {
            self.persist(&queue).await;
        }
        Ok(())
    }

    /// Change a member's ring-in-use permission.
    pub async fn set_ring_in_use(&self, queue_name: &str, interface: &str, allowed: bool) -> Result<()> {
        let queue = self.engine.queues().require(queue_name)?;
        let member = {
            let roster = queue.data().members().read().await;
            roster
                .get(interface)
                .ok_or_else(|| AcdError::not_found(format!("member not found: {}", interface)))?
        };
        member.set_ring_in_use(allowed);
        if member.provenance() == Provenance::Dynamic {
            self.persist(&queue).await;
        }
        Ok(())
    }

    /// Zero a queue's statistics.
    pub async fn reset_stats(&self, queue_name: &str) -> Result<()> {
        let queue = self.engine.queues().require(queue_name)?;
        queue.data().stats().lock().await.reset();
        info!("📊 Statistics reset for queue {}", queue_name);
        Ok(())
    }

    /// Snapshot one queue.
    pub async fn summary(&self, queue_name: &str) -> Result<QueueSummary> {
        let queue = self.engine.queues().require(queue_name)?;
        let stats = queue.data().stats().lock().await.clone();
        let members = {
            let roster = queue.data().members().read().await;
            roster
                .iter()
                .map(|m| MemberSummary {
                    interface: m.interface().to_string(),
                    display_name: m.display_name(),
                    penalty: m.penalty(),
                    calls: m.calls(),
                    paused: m.paused(),
                    status: m.effective_status(),
                    provenance: m.provenance(),
                })
                .collect()
        };
        let service_level_pct = if stats.completed > 0 {
            stats.completed_in_sl as f64 * 100.0 / stats.completed as f64
        } else {
            0.0
        };
        Ok(QueueSummary {
            name: queue.name().to_string(),
            strategy: queue.config().strategy,
            waiting: queue.data().count(),
            holdtime_avg_secs: stats.holdtime_avg_secs,
            talktime_avg_secs: stats.talktime_avg_secs,
            completed: stats.completed,
            completed_in_sl: stats.completed_in_sl,
            abandoned: stats.abandoned,
            service_level_pct,
            members,
        })
    }

    /// Every registered rule set with its rules, for `show rules`.
    pub fn rule_sets(&self) -> Vec<(String, Vec<PenaltyRule>)> {
        self.engine
            .rules()
            .names()
            .into_iter()
            .filter_map(|name| {
                self.engine
                    .rules()
                    .get(&name)
                    .map(|set| (name, set.rules().to_vec()))
            })
            .collect()
    }

    /// Replace a queue's configuration; waiting callers and statistics
    /// survive.
    pub async fn reload_parameters(&self, queue_name: &str, config: QueueConfig) -> Result<()> {
        self.engine.queues().reload(queue_name, config)?;
        Ok(())
    }

    /// Replace every rule set.
    pub fn reload_rules(&self, sets: Vec<RuleSet>) {
        for name in self.engine.rules().names() {
            self.engine.rules().remove(&name);
        }
        for set in sets {
            self.engine.rules().insert(set);
        }
    }

    /// Reconcile a queue's realtime members against the backend's current
    /// rows: refresh survivors, add newcomers, sweep the rest. Unchanged
    /// members produce no events.
    pub async fn reconcile_realtime(
        &self,
        queue_name: &str,
        specs: Vec<MemberSpec>,
    ) -> Result<RealtimeReconcile> {
        let queue = self.engine.queues().require(queue_name)?;
        let mut outcome = RealtimeReconcile::default();
        let mut swept = Vec::new();
        let mut added_details = Vec::new();

        {
            let mut roster = queue.data().members().write().await;
            roster.mark_realtime_dead();

            for mut spec in specs {
                spec.provenance = Provenance::Realtime;
                let interface = spec.interface.clone();
                let penalty = spec.penalty;
                let paused = spec.paused;
                let device = self.engine.devices().acquire(&spec.state_key);
                match roster.insert(spec, device.clone()) {
                    Ok(RosterInsert::Added(_)) => {
                        added_details.push((interface.clone(), penalty, paused));
                        outcome.added.push(interface);
                    }
                    Ok(RosterInsert::Updated(_)) => outcome.kept.push(interface),
                    Err(e) => {
                        self.engine.devices().release(device);
                        info!("realtime member {} skipped: {}", interface, e);
                    }
                }
            }

            swept.extend(roster.sweep_dead());
        }

        for member in swept {
            let interface = member.interface().to_string();
            self.engine.devices().release(member.device().clone());
            self.engine
                .audit()
                .record(queue_name, "NONE", &interface, AuditTag::RemoveMember, &[]);
            self.engine.events().emit(QueueEventKind::MemberRemoved {
                queue: queue_name.to_string(),
                interface: interface.clone(),
            });
            outcome.removed.push(interface);
        }
        for (interface, penalty, paused) in added_details {
            self.engine.audit().record(
                queue_name,
                "NONE",
                &interface,
                AuditTag::AddMember,
                &[if paused { "PAUSED" } else { "" }],
            );
            self.engine.events().emit(QueueEventKind::MemberAdded {
                queue: queue_name.to_string(),
                interface,
                penalty,
                paused,
            });
        }
        Ok(outcome)
    }

    /// Restore a queue's persisted dynamic members.
    pub async fn load_persisted_members(&self, queue_name: &str) -> Result<usize> {
        let queue = self.engine.queues().require(queue_name)?;
        match self.engine.store() {
            Some(store) => store.load_into(&queue, self.engine.devices()).await,
            None => Ok(0),
        }
    }

    /// Write a free-form audit record from the management surface.
    pub fn log_event(&self, queue: &str, caller_uid: &str, agent: &str, tag: &str, extras: &[&str]) {
        self.engine
            .audit()
            .record(queue, caller_uid, agent, AuditTag::Custom(tag.to_string()), extras);
    }

    async fn persist(&self, queue: &Arc<Queue>) {
        if !self.engine.config.persist_dynamic_members {
            return;
        }
        let Some(store) = self.engine.store() else {
            return;
        };
        if let Err(e) = store.dump(queue).await {
            tracing::warn!("failed to persist dynamic members for {}: {}", queue.name(), e);
        }
    }
}
