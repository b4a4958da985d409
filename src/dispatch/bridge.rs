//! Winner handling and completion accounting
//!
//! The race picked one answered attempt. Everything between that moment
//! and the caller leaving bridged lives here: losers hung up, saved party
//! updates applied, member announced, post-connect hook run, the bridge
//! itself, and the statistics fold on the way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::AuditTag;
use crate::caller::WaitingClient;
use crate::error::{AcdError, Result};
use crate::events::QueueEventKind;
use crate::queue::Queue;
use crate::transport::{BridgeEnd, BridgeOptions, ControlKind, Frame, Indication};

use super::attempt::AttemptSet;
use super::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};

impl Dispatcher {
    /// Bridge the winning attempt to the caller
    ///
    /// Returns `Ok(Some(outcome))` when the caller's journey ends here,
    /// `Ok(None)` when the winner fell through (member hung up during the
    /// announcement) and the ring loop should continue.
    pub(super) async fn bridge_winner(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
        winner: usize,
        request: &DispatchRequest,
    ) -> Result<Option<DispatchOutcome>> {
        let answered_at = Instant::now();
        let hold_secs = caller.wait_secs(answered_at);

        let (member, member_channel, ring_secs) = match attempts.get_mut(winner) {
            Some(attempt) => {
                attempt.promote_active();
                let ring_secs = attempt
                    .ring_started
                    .map(|started| answered_at.duration_since(started).as_secs())
                    .unwrap_or(0);
                match attempt.channel.clone() {
                    Some(channel) => (attempt.member().clone(), channel, ring_secs),
                    None => return Err(AcdError::internal("winning attempt has no channel")),
                }
            }
            None => return Err(AcdError::internal("winning attempt index out of range")),
        };
        debug_assert!(attempts.active_count() == 1);

        // Losers get hung up, answered-elsewhere when the caller asked.
        let losers: Vec<(usize, _)> = (0..attempts.len())
            .filter(|&i| i != winner)
            .filter_map(|i| {
                attempts
                    .get(i)
                    .and_then(|a| a.channel.clone())
                    .map(|c| (i, c))
            })
            .collect();
        for (index, channel) in losers {
            self.transport
                .hangup(&channel, caller.options.mark_answered_elsewhere)
                .await;
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
        }
        for index in 0..attempts.len() {
            if index != winner {
                if let Some(attempt) = attempts.get_mut(index) {
                    attempt.retire();
                }
            }
        }

        self.transport
            .indicate(caller.channel(), Indication::StopRinging)
            .await;
        self.transport
            .indicate(caller.channel(), Indication::MusicOnHoldStop)
            .await;

        if let Some(attempt) = attempts.get_mut(winner) {
            if let Some(party) = attempt.pending_connected.take() {
                self.transport
                    .update_connected_line(caller.channel(), &party)
                    .await;
            }
            if let Some(party) = attempt.pending_redirecting.take() {
                self.transport
                    .update_redirecting(caller.channel(), &party)
                    .await;
            }
            for rate in attempt.aoc_rates.drain(..).collect::<Vec<_>>() {
                self.transport.send_aoc(caller.channel(), &rate).await;
            }
        }

        let delay = queue.config().member_delay_secs;
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        let prompt = request
            .announce_override
            .clone()
            .or_else(|| queue.config().announce.agent_prompt.clone());
        if let Some(name) = prompt {
            self.prompts.play_file(&member_channel, &name).await;
            if self.member_hung_up(&member_channel).await {
                info!("🫳 {} answered and hung up during the announcement", member.interface());
                self.audit.record(
                    queue.name(),
                    caller.uid(),
                    member.interface(),
                    AuditTag::AgentDump,
                    &[],
                );
                self.events.emit(QueueEventKind::AgentDump {
                    queue: queue.name().to_string(),
                    caller_uid: caller.uid().to_string(),
                    interface: member.interface().to_string(),
                });
                if let Some(attempt) = attempts.get_mut(winner) {
                    attempt.retire();
                }
                return Ok(None);
            }
        }

        if let Some(hook) = &request.post_connect_hook {
            match &self.dialplan {
                Some(dialplan) => {
                    if let Err(e) = dialplan.run(&member_channel, hook).await {
                        warn!("post-connect hook {} failed: {}", hook, e);
                    }
                }
                None => warn!("post-connect hook {} given but no dial-plan evaluator wired", hook),
            }
        }

        self.leave_list(queue, caller).await;
        info!(
            "✅ Caller {} connected to {} after {}s (rang {}s)",
            caller.uid(),
            member.interface(),
            hold_secs,
            ring_secs
        );
        self.audit.record(
            queue.name(),
            caller.uid(),
            member.interface(),
            AuditTag::Connect,
            &[&hold_secs.to_string(), member_channel.as_ref(), &ring_secs.to_string()],
        );
        self.events.emit(QueueEventKind::AgentConnect {
            queue: queue.name().to_string(),
            caller_uid: caller.uid().to_string(),
            interface: member.interface().to_string(),
            hold_secs,
            ring_secs,
        });

        let bridge_options = BridgeOptions { record: caller.options.record_basename.clone() };
        let outcome = self
            .transport
            .bridge(caller.channel(), &member_channel, &bridge_options)
            .await;

        if outcome.end == BridgeEnd::Failed {
            warn!("bridge between {} and {} failed", caller.channel(), member_channel);
            self.audit.record(
                queue.name(),
                caller.uid(),
                member.interface(),
                AuditTag::SysCompat,
                &[],
            );
            self.transport.hangup(&member_channel, false).await;
            if let Some(attempt) = attempts.get_mut(winner) {
                attempt.retire();
            }
            return Ok(Some(DispatchOutcome::BridgeFailed));
        }

        let talk_secs = outcome.talk_time.as_secs();
        let now = Instant::now();
        member.record_completed_call(now, queue.config().wrapup_secs);
        if let Some(attempt) = attempts.get_mut(winner) {
            attempt.retire();
        }

        let service_level = queue.config().service_level_secs;
        let in_service_level = service_level > 0 && hold_secs <= service_level;
        {
            let mut stats = queue.data().stats().lock().await;
            stats.record_completion(hold_secs, talk_secs, in_service_level);
        }

        let (tag, extra) = match &outcome.end {
            BridgeEnd::Transferred { target } => (AuditTag::Transfer, target.clone()),
            BridgeEnd::CallerHungUp => {
                (AuditTag::CompleteCaller, caller.entry().original_position().to_string())
            }
            BridgeEnd::MemberHungUp | BridgeEnd::Failed => {
                (AuditTag::CompleteAgent, caller.entry().original_position().to_string())
            }
        };
        self.audit.record(
            queue.name(),
            caller.uid(),
            member.interface(),
            tag,
            &[&hold_secs.to_string(), &talk_secs.to_string(), &extra],
        );
        self.events.emit(QueueEventKind::AgentComplete {
            queue: queue.name().to_string(),
            caller_uid: caller.uid().to_string(),
            interface: member.interface().to_string(),
            hold_secs,
            talk_secs,
            ended_by_agent: outcome.end == BridgeEnd::MemberHungUp,
        });

        Ok(Some(DispatchOutcome::Bridged {
            interface: member.interface().to_string(),
            talk_secs,
        }))
    }

    /// Whether the member channel delivered a hangup since the answer.
    async fn member_hung_up(&self, channel: &crate::transport::ChannelId) -> bool {
        while let Some(frame) = self.transport.read(channel).await {
            if matches!(frame, Frame::Control(ControlKind::Hangup { .. })) {
                return true;
            }
        }
        false
    }
}
