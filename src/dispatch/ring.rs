//! Ring cycles
//!
//! One ring cycle builds the attempt set for the caller, places the best
//! candidate(s), races the outcome, and stores the strategy cursors so the
//! next cycle resumes the walk. Everything that can go wrong with one
//! attempt stays inside the cycle: the next best candidate is tried and
//! the caller never sees per-attempt failures.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::AuditTag;
use crate::caller::WaitingClient;
use crate::config::{AutopausePolicy, Strategy};
use crate::error::Result;
use crate::events::QueueEventKind;
use crate::queue::Queue;
use crate::transport::split_interface;

use super::attempt::AttemptSet;
use super::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, WaitSignal};
use super::mux::MuxVerdict;
use super::selector::RingSelector;

impl Dispatcher {
    /// One full ring cycle for the caller at the head of the line.
    ///
    /// Breaks with the caller's final outcome, or continues after the
    /// retry sleep when nobody answered.
    pub(super) async fn ring_cycle(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        request: &DispatchRequest,
    ) -> Result<ControlFlow<DispatchOutcome>> {
        let now = Instant::now();
        let strategy = queue.config().strategy;

        let mut rr = queue.data().rr_cursor();
        let mut attempts = {
            let roster = queue.data().members().read().await;
            RingSelector::build_attempts(
                strategy,
                queue.config().penalty_members_limit,
                &roster,
                caller,
                &mut rr,
                now,
            )
        };
        queue.data().set_rr_cursor(rr);

        if attempts.is_empty() {
            debug!("queue {}: no candidates for caller {}", queue.name(), caller.uid());
            return self.finish_round(queue, caller, &mut attempts).await;
        }

        if self.ring_one(queue, caller, &mut attempts).await == 0 {
            return self.finish_round(queue, caller, &mut attempts).await;
        }

        let result = self.wait_for_answer(queue, caller, &mut attempts).await;
        match result.verdict {
            MuxVerdict::Winner(index) => {
                match self.bridge_winner(queue, caller, &mut attempts, index, request).await? {
                    Some(outcome) => Ok(ControlFlow::Break(outcome)),
                    None => self.finish_round(queue, caller, &mut attempts).await,
                }
            }
            MuxVerdict::CallerHangup { cause } => {
                self.hangup_all(caller, &mut attempts).await;
                Ok(ControlFlow::Break(self.record_abandon(queue, caller, cause).await))
            }
            MuxVerdict::Exit(outcome) => {
                self.hangup_all(caller, &mut attempts).await;
                Ok(ControlFlow::Break(outcome))
            }
            MuxVerdict::TimedOut => {
                self.ring_timed_out(queue, caller, &mut attempts).await;
                self.finish_round(queue, caller, &mut attempts).await
            }
            MuxVerdict::Exhausted => self.finish_round(queue, caller, &mut attempts).await,
        }
    }

    /// Store cursors, retire what is left, and sit out the retry interval
    /// watching the caller channel.
    async fn finish_round(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
    ) -> Result<ControlFlow<DispatchOutcome>> {
        self.store_cursors(queue, caller, attempts);
        self.hangup_all(caller, attempts).await;

        match self.retry_sleep(queue, caller).await {
            Some(WaitSignal::HungUp(cause)) => {
                Ok(ControlFlow::Break(self.record_abandon(queue, caller, cause).await))
            }
            Some(WaitSignal::Digit(digit)) => {
                match self.handle_caller_digit(queue, caller, digit).await {
                    Some(outcome) => Ok(ControlFlow::Break(outcome)),
                    None => Ok(ControlFlow::Continue(())),
                }
            }
            None => Ok(ControlFlow::Continue(())),
        }
    }

    /// Ring the best candidate(s) for this round. Falls through band by
    /// band when candidates fail synchronously; returns how many are
    /// actually ringing.
    pub(super) async fn ring_one(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
    ) -> usize {
        loop {
            let candidates = RingSelector::next_candidates(attempts, queue.config().strategy);
            if candidates.is_empty() {
                return 0;
            }
            let mut rang = 0;
            for index in candidates {
                if self.ring_entry(queue, caller, attempts, index).await {
                    rang += 1;
                }
            }
            if rang > 0 {
                return rang;
            }
        }
    }

    /// Place one outbound attempt, running the precondition chain in
    /// order: weight preemption, pause, wrapup, device state. A failed
    /// precondition or transport refusal retires the attempt and reports
    /// it as busy toward the round.
    pub(super) async fn ring_entry(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
        index: usize,
    ) -> bool {
        let Some(attempt) = attempts.get(index) else {
            return false;
        };
        let member = attempt.member().clone();
        let interface = member.interface().to_string();
        let now = Instant::now();

        if self.member_contested(queue, &interface).await {
            debug!("⚖️ {} deferred to a higher-weight queue", interface);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return false;
        }
        if member.paused() {
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return false;
        }
        if member.in_wrapup(now) {
            debug!("💤 {} still in wrapup", interface);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return false;
        }
        let status = member.effective_status();
        let ringable = status.idle()
            || (queue.config().ring_in_use && member.ring_in_use() && status.ringable_in_use());
        if !ringable {
            debug!("📵 {} not ringable: {}", interface, status);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return false;
        }

        if let Some(attempt) = attempts.get_mut(index) {
            attempt.reserve();
            attempt.dial_callerid_absent = caller.caller_id.is_none();
        }
        caller.note_dialed(&interface);

        let Ok((tech, location)) = split_interface(&interface) else {
            warn!("member interface {} is not dialable", interface);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return false;
        };

        let channel = match self.transport.request(tech, location, Some(caller.channel())).await {
            Ok(channel) => channel,
            Err(failure) => {
                debug!("📵 request toward {} refused: {}", interface, failure);
                if let Some(attempt) = attempts.get_mut(index) {
                    attempt.retire();
                }
                self.advance_cursor_on_failure(queue, caller);
                return false;
            }
        };

        if let Err(failure) = self.transport.call(&channel, location).await {
            debug!("📵 call toward {} failed: {}", interface, failure);
            self.transport.hangup(&channel, false).await;
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            self.advance_cursor_on_failure(queue, caller);
            return false;
        }

        if let Some(attempt) = attempts.get_mut(index) {
            attempt.channel = Some(channel);
            attempt.watching = true;
            attempt.ring_started = Some(now);
        }
        info!("🔔 Ringing {} for caller {}", interface, caller.uid());
        self.events.emit(QueueEventKind::AgentCalled {
            queue: queue.name().to_string(),
            caller_uid: caller.uid().to_string(),
            interface,
        });
        true
    }

    /// Whether a strictly higher-weight queue with waiting callers lists
    /// this member and needs it. Advisory and lock-free across queues: the
    /// device reservation counters settle any race.
    pub(super) async fn member_contested(&self, queue: &Arc<Queue>, interface: &str) -> bool {
        let weight = queue.config().weight;
        for other in self.queues.snapshot() {
            if other.name() == queue.name() || other.config().weight <= weight {
                continue;
            }
            let waiting = other.data().count();
            if waiting == 0 {
                continue;
            }
            let roster = other.data().members().read().await;
            if roster.get(interface).is_none() {
                continue;
            }
            let available = roster.available_count(other.config().ring_in_use, Instant::now());
            if waiting >= available {
                return true;
            }
        }
        false
    }

    /// A rung attempt came back busy, congested, or timed out: tear it
    /// down, account the ring-no-answer, and autopause per policy.
    pub(super) async fn attempt_failed(
        &self,
        queue: &Arc<Queue>,
        caller: &WaitingClient,
        attempts: &mut AttemptSet,
        index: usize,
        reason: &str,
    ) {
        let Some(attempt) = attempts.get(index) else {
            return;
        };
        let interface = attempt.interface().to_string();
        let ring_ms = attempt
            .ring_started
            .map(|started| Instant::now().duration_since(started).as_millis() as u64)
            .unwrap_or(0);
        let channel = attempt.channel.clone();

        if let Some(channel) = channel {
            self.transport.hangup(&channel, false).await;
        }
        if let Some(attempt) = attempts.get_mut(index) {
            attempt.retire();
        }

        info!("🔕 {} gave {} after {} ms", interface, reason, ring_ms);
        self.audit.record(
            queue.name(),
            caller.uid(),
            &interface,
            AuditTag::RingNoAnswer,
            &[&ring_ms.to_string()],
        );
        self.events.emit(QueueEventKind::AgentRingNoAnswer {
            queue: queue.name().to_string(),
            caller_uid: caller.uid().to_string(),
            interface: interface.clone(),
            ring_ms,
        });
        self.autopause(queue, &interface).await;
    }

    /// Account every attempt still ringing when the round's timeout hit.
    async fn ring_timed_out(
        &self,
        queue: &Arc<Queue>,
        caller: &WaitingClient,
        attempts: &mut AttemptSet,
    ) {
        let ringing: Vec<usize> = (0..attempts.len())
            .filter(|&i| {
                attempts
                    .get(i)
                    .map(|a| a.still_going && a.channel.is_some())
                    .unwrap_or(false)
            })
            .collect();
        for index in ringing {
            self.attempt_failed(queue, caller, attempts, index, "no answer").await;
        }
    }

    /// Pause the member per the queue's autopause policy.
    pub(super) async fn autopause(&self, queue: &Arc<Queue>, interface: &str) {
        match queue.config().autopause {
            AutopausePolicy::No => {}
            AutopausePolicy::Yes => self.autopause_in(queue, interface).await,
            AutopausePolicy::All => {
                for other in self.queues.snapshot() {
                    self.autopause_in(&other, interface).await;
                }
            }
        }
    }

    async fn autopause_in(&self, queue: &Arc<Queue>, interface: &str) {
        let member = {
            let roster = queue.data().members().read().await;
            roster.get(interface)
        };
        let Some(member) = member else {
            return;
        };
        if member.set_paused(true, Some("Auto-Pause")) {
            warn!("⏸️ Auto-paused {} in queue {}", interface, queue.name());
            self.audit.record(queue.name(), "NONE", interface, AuditTag::Pause, &["Auto-Pause"]);
            self.events.emit(QueueEventKind::MemberPaused {
                queue: queue.name().to_string(),
                interface: interface.to_string(),
                paused: true,
                reason: Some("Auto-Pause".to_string()),
            });
        }
    }

    /// Hang up every placed attempt and retire the set. Losing channels
    /// are marked answered-elsewhere when the caller asked for it.
    pub(super) async fn hangup_all(&self, caller: &WaitingClient, attempts: &mut AttemptSet) {
        let channels: Vec<_> = attempts
            .iter()
            .filter(|a| a.still_going)
            .filter_map(|a| a.channel.clone())
            .collect();
        for channel in channels {
            self.transport
                .hangup(&channel, caller.options.mark_answered_elsewhere)
                .await;
        }
        attempts.retire_all();
    }

    /// Store the strategy cursor so the next cycle resumes the walk.
    pub(super) fn store_cursors(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &AttemptSet,
    ) {
        match queue.config().strategy {
            Strategy::RrMemory | Strategy::RrOrdered => {
                queue.data().set_rr_cursor(RingSelector::next_cursor(attempts));
            }
            Strategy::Linear => {
                caller.linear = RingSelector::next_cursor(attempts);
            }
            _ => {}
        }
    }

    /// Request-time failure advances the walk cursor past the member.
    fn advance_cursor_on_failure(&self, queue: &Arc<Queue>, caller: &mut WaitingClient) {
        match queue.config().strategy {
            Strategy::RrMemory | Strategy::RrOrdered => {
                let mut cursor = queue.data().rr_cursor();
                cursor.pos += 1;
                queue.data().set_rr_cursor(cursor);
            }
            Strategy::Linear => {
                caller.linear.pos += 1;
            }
            _ => {}
        }
    }

    /// Sleep the retry interval, interruptible by caller DTMF or hangup.
    async fn retry_sleep(&self, queue: &Arc<Queue>, caller: &WaitingClient) -> Option<WaitSignal> {
        let mut remaining = queue.config().retry_interval();
        while !remaining.is_zero() {
            let watch = [caller.channel().clone()];
            let result = self.transport.wait_for_events(&watch, remaining).await;
            if result.ready.is_empty() {
                return None;
            }
            if let Some(signal) = self.drain_caller_channel(caller).await {
                return Some(signal);
            }
            remaining = result.remaining;
        }
        None
    }
}

/// Minimum time that must remain in a round before a busy attempt is
/// replaced with the next best candidate.
pub(super) const RERING_FLOOR: Duration = Duration::from_millis(500);
