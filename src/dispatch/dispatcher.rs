//! The dispatch orchestrator
//!
//! One [`Dispatcher`] serves every queue in the process. Each inbound
//! caller runs [`Dispatcher::run`] on its own task, owning its
//! [`WaitingClient`] end-to-end: resolve the queue, join the waiting list,
//! loop through announce and ring cycles, and leave bridged or with a
//! typed exit.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditSink, AuditTag};
use crate::caller::{CallerOptions, WaitingClient};
use crate::config::EngineConfig;
use crate::device::DeviceRegistry;
use crate::error::Result;
use crate::events::{EventBus, QueueEventKind};
use crate::persist::MemberStore;
use crate::queue::{Queue, QueueRegistry, WaitingEntry};
use crate::rules::{PenaltyWindow, RuleCursor, RulesRegistry};
use crate::transport::{
    ChannelId, ControlKind, Dialplan, Frame, Indication, KvStore, PartyInfo, PromptPlayer,
    Transport,
};
use crate::EngineStats;

/// Interval between checks while a caller waits for its turn
const WAIT_TICK: Duration = Duration::from_secs(1);

/// Everything a caller arrives with
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The caller's channel
    pub caller_channel: ChannelId,
    /// Caller unique id; generated when the channel has none
    pub caller_uid: Option<String>,
    /// Name of the queue to join
    pub queue: String,
    /// Priority; higher wins an earlier position
    pub priority: i32,
    /// Per-caller option flags
    pub options: CallerOptions,
    /// Overall time the caller is willing to wait
    pub timeout: Option<Duration>,
    /// URL pushed alongside the join, recorded in the audit trail
    pub url: Option<String>,
    /// Prompt played to the answering member, overriding the queue's
    pub announce_override: Option<String>,
    /// Dial-plan target executed on the member channel after connect
    pub post_connect_hook: Option<String>,
    /// Penalty rule set overriding the queue's default
    pub rule_override: Option<String>,
    /// Requested 1-based waiting position
    pub requested_position: Option<usize>,
    /// Initial lower penalty bound; unset leaves it unconstrained
    pub min_penalty: Option<i32>,
    /// Initial upper penalty bound; unset leaves it unconstrained
    pub max_penalty: Option<i32>,
    /// Party identity the caller presented; absent when the channel
    /// carried no caller id
    pub caller_id: Option<PartyInfo>,
    /// Extension the caller dialed to reach the queue; becomes the
    /// forwarded-from party on forwarded legs
    pub extension: Option<String>,
}

impl DispatchRequest {
    /// A plain request with default options and no timeout.
    pub fn new(caller_channel: ChannelId, queue: &str) -> Self {
        DispatchRequest {
            caller_channel,
            caller_uid: None,
            queue: queue.to_string(),
            priority: 0,
            options: CallerOptions::default(),
            timeout: None,
            url: None,
            announce_override: None,
            post_connect_hook: None,
            rule_override: None,
            requested_position: None,
            min_penalty: None,
            max_penalty: None,
            caller_id: None,
            extension: None,
        }
    }
}

/// How one dispatched caller ended
///
/// The embedding platform maps this onto its result variable through
/// [`DispatchOutcome::result_var`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The caller was bridged to a member and the call completed
    Bridged {
        /// Winning member interface
        interface: String,
        /// Seconds the parties were bridged
        talk_secs: u64,
    },
    /// The caller's wait timed out
    Timeout,
    /// The queue was at `maxlen` when the caller arrived
    Full,
    /// The join-empty predicate refused the caller: no members at all
    JoinEmpty,
    /// The join-empty predicate refused the caller: members exist but none
    /// count
    JoinUnavail,
    /// The leave-empty predicate ejected the caller: no members at all
    LeaveEmpty,
    /// The leave-empty predicate ejected the caller: members exist but
    /// none count
    LeaveUnavail,
    /// The caller hung up while waiting or ringing
    Abandoned {
        /// Transport hangup cause
        cause: i32,
    },
    /// The caller pressed `*` with the disconnect option enabled
    Disconnected,
    /// The caller dialed digits matching the exit context
    ExitWithDigits(String),
    /// The winning bridge could not be set up
    BridgeFailed,
}

impl DispatchOutcome {
    /// Result-variable value for the embedding platform, `None` for a
    /// normally completed bridge.
    pub fn result_var(&self) -> Option<&'static str> {
        match self {
            DispatchOutcome::Bridged { .. } => None,
            DispatchOutcome::Timeout => Some("TIMEOUT"),
            DispatchOutcome::Full => Some("FULL"),
            DispatchOutcome::JoinEmpty => Some("JOINEMPTY"),
            DispatchOutcome::JoinUnavail => Some("JOINUNAVAIL"),
            DispatchOutcome::LeaveEmpty => Some("LEAVEEMPTY"),
            DispatchOutcome::LeaveUnavail => Some("LEAVEUNAVAIL"),
            DispatchOutcome::ExitWithDigits(_) => Some("CONTINUE"),
            DispatchOutcome::Abandoned { .. }
            | DispatchOutcome::Disconnected
            | DispatchOutcome::BridgeFailed => Some("UNKNOWN"),
        }
    }
}

/// Signals surfaced from the caller channel while waiting
pub(super) enum WaitSignal {
    /// The caller hung up with the given cause
    HungUp(i32),
    /// The caller pressed a digit
    Digit(char),
}

/// State for the waiting-phase announcement schedules
#[derive(Default)]
pub(super) struct AnnounceState {
    last_position: Option<Instant>,
    last_periodic: Option<Instant>,
    periodic_index: usize,
}

/// The engine's central orchestrator
///
/// Owns the registries (queues, devices, rules), the event bus, the audit
/// log, and the collaborator seams. Cheap to share: wrap in an [`Arc`] and
/// spawn one [`run`] per inbound caller.
///
/// [`run`]: Dispatcher::run
pub struct Dispatcher {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) prompts: Arc<dyn PromptPlayer>,
    pub(crate) dialplan: Option<Arc<dyn Dialplan>>,
    pub(crate) queues: Arc<QueueRegistry>,
    pub(crate) devices: Arc<DeviceRegistry>,
    pub(crate) rules: Arc<RulesRegistry>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) store: Option<Arc<MemberStore>>,
}

/// Builder wiring collaborators into a [`Dispatcher`]
///
/// # Examples
///
/// ```rust,ignore
/// let dispatcher = DispatcherBuilder::new(transport, prompts)
///     .config(EngineConfig::default())
///     .kv_store(kv)
///     .build();
/// ```
pub struct DispatcherBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    prompts: Arc<dyn PromptPlayer>,
    dialplan: Option<Arc<dyn Dialplan>>,
    kv: Option<Arc<dyn KvStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl DispatcherBuilder {
    /// Start from the two collaborators every deployment has.
    pub fn new(transport: Arc<dyn Transport>, prompts: Arc<dyn PromptPlayer>) -> Self {
        DispatcherBuilder {
            config: EngineConfig::default(),
            transport,
            prompts,
            dialplan: None,
            kv: None,
            audit_sink: None,
        }
    }

    /// Engine-wide settings.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire the dial-plan evaluator (post-connect hooks, exit digits).
    pub fn dialplan(mut self, dialplan: Arc<dyn Dialplan>) -> Self {
        self.dialplan = Some(dialplan);
        self
    }

    /// Wire the key/value store for dynamic-member persistence.
    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Replace the default tracing audit sink.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Assemble the dispatcher and start its background tasks. Must be
    /// called inside a Tokio runtime.
    pub fn build(self) -> Arc<Dispatcher> {
        let events = Arc::new(EventBus::new(self.config.event_history_limit));
        let audit = match self.audit_sink {
            Some(sink) => Arc::new(AuditLog::with_sink(sink)),
            None => Arc::new(AuditLog::new()),
        };
        let devices = Arc::new(DeviceRegistry::new());
        let queues = Arc::new(QueueRegistry::new());
        let store = self.kv.map(|kv| Arc::new(MemberStore::new(kv)));

        let dispatcher = Arc::new(Dispatcher {
            config: self.config,
            transport: self.transport,
            prompts: self.prompts,
            dialplan: self.dialplan,
            queues,
            devices,
            rules: Arc::new(RulesRegistry::new()),
            events,
            audit,
            store,
        });
        dispatcher.spawn_device_fanout();
        dispatcher.spawn_stuck_sweep();
        dispatcher
    }
}

impl Dispatcher {
    /// The queue registry.
    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// The device registry.
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// The penalty-rule registry.
    pub fn rules(&self) -> &Arc<RulesRegistry> {
        &self.rules
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The persistence adapter, when a store is wired.
    pub fn store(&self) -> Option<&Arc<MemberStore>> {
        self.store.as_ref()
    }

    /// Engine-wide statistics snapshot.
    pub async fn stats(&self) -> EngineStats {
        let mut waiting_callers = 0;
        let mut members = 0;
        for queue in self.queues.snapshot() {
            waiting_callers += queue.data().count();
            members += queue.data().members().read().await.len();
        }
        EngineStats {
            queues: self.queues.len(),
            waiting_callers,
            members,
            devices: self.devices.device_count(),
        }
    }

    /// Dispatch one caller
    ///
    /// Runs the whole state machine: resolve, join gates, insert,
    /// wait-turn loop, ring cycles, bridge. Returns when the caller has
    /// left the queue for any reason. Errors are structural only (unknown
    /// queue); everything that can go wrong with the call itself comes
    /// back as a [`DispatchOutcome`].
    pub async fn run(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let queue = self.queues.require(&request.queue)?;
        let now = Instant::now();

        if queue.config().join_empty.enabled {
            let roster = queue.data().members().read().await;
            if roster.is_empty() {
                info!("🚫 Caller refused from {}: queue has no members", queue.name());
                return Ok(DispatchOutcome::JoinEmpty);
            }
            if roster.occupancy_count(&queue.config().join_empty.conditions, now) == 0 {
                info!("🚫 Caller refused from {}: no members count as present", queue.name());
                return Ok(DispatchOutcome::JoinUnavail);
            }
        }
        if !queue.has_room() {
            warn!("🚫 Queue {} is full ({} waiting)", queue.name(), queue.data().count());
            return Ok(DispatchOutcome::Full);
        }

        let uid = request
            .caller_uid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let rule_name = request
            .rule_override
            .as_deref()
            .or(queue.config().default_rule.as_deref());
        let rule_cursor = match rule_name {
            Some(name) => match self.rules.get(name) {
                Some(set) => Some(RuleCursor::new(set)),
                None => {
                    warn!("rule set {} not found; caller proceeds without penalty rules", name);
                    None
                }
            },
            None => None,
        };

        let entry = Arc::new(WaitingEntry::new(
            &uid,
            request.caller_channel.clone(),
            request.priority,
        ));
        let position = queue
            .data()
            .insert_caller(entry.clone(), request.requested_position)
            .await;

        let mut caller = WaitingClient::new(
            entry,
            queue.name(),
            request.options.clone(),
            PenaltyWindow { min: request.min_penalty, max: request.max_penalty },
            rule_cursor,
            request.timeout,
        );
        caller.caller_id = request.caller_id.clone();
        caller.extension = request.extension.clone();

        info!(
            "📞 Caller {} joined queue {} at position {} (priority {})",
            uid,
            queue.name(),
            position,
            request.priority
        );
        self.events.emit(QueueEventKind::Join {
            queue: queue.name().to_string(),
            caller_uid: uid.clone(),
            position,
            count: queue.data().count(),
            priority: request.priority,
        });
        self.audit.record(
            queue.name(),
            &uid,
            "NONE",
            AuditTag::EnterQueue,
            &[
                request.url.as_deref().unwrap_or(""),
                request.caller_channel.as_ref(),
                &request.priority.to_string(),
            ],
        );
        self.transport
            .indicate(caller.channel(), Indication::MusicOnHoldStart)
            .await;

        let outcome = self.caller_loop(&queue, &mut caller, &request).await?;

        // Every exit path removes the caller; this is the backstop.
        queue.data().remove_caller(caller.uid()).await;

        info!("📞 Caller {} left queue {}: {:?}", uid, queue.name(), outcome);
        Ok(outcome)
    }

    /// The announce/ring loop for one caller.
    async fn caller_loop(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        request: &DispatchRequest,
    ) -> Result<DispatchOutcome> {
        let mut announce = AnnounceState::default();
        loop {
            let now = Instant::now();
            caller.advance_rules(now);

            if caller.has_expired(now) {
                return Ok(self.exit_with_timeout(queue, caller).await);
            }
            if let Some(outcome) = self.check_leave_empty(queue, caller).await {
                return Ok(outcome);
            }

            if self.is_our_turn(queue, caller).await {
                match self.ring_cycle(queue, caller, request).await? {
                    ControlFlow::Break(outcome) => return Ok(outcome),
                    ControlFlow::Continue(()) => continue,
                }
            }

            if let Some(digit) = self.maybe_announce(queue, caller, &mut announce).await {
                if let Some(outcome) = self.handle_caller_digit(queue, caller, digit).await {
                    return Ok(outcome);
                }
            }

            match self.wait_tick(caller).await {
                Some(WaitSignal::HungUp(cause)) => {
                    return Ok(self.record_abandon(queue, caller, cause).await);
                }
                Some(WaitSignal::Digit(digit)) => {
                    if let Some(outcome) = self.handle_caller_digit(queue, caller, digit).await {
                        return Ok(outcome);
                    }
                }
                None => {}
            }
        }
    }

    /// Whether the head of the list (or, with autofill, one of the first
    /// `available` callers) is this caller.
    pub(super) async fn is_our_turn(&self, queue: &Arc<Queue>, caller: &WaitingClient) -> bool {
        let position = caller.entry().position();
        if position == 0 {
            return false;
        }
        let available = {
            let roster = queue.data().members().read().await;
            roster.available_count(queue.config().ring_in_use, Instant::now())
        };
        position <= available && (queue.config().autofill || position == 1)
    }

    /// Sleep one tick watching the caller channel for digits and hangup.
    pub(super) async fn wait_tick(&self, caller: &WaitingClient) -> Option<WaitSignal> {
        let watch = [caller.channel().clone()];
        let result = self.transport.wait_for_events(&watch, WAIT_TICK).await;
        if result.ready.is_empty() {
            return None;
        }
        self.drain_caller_channel(caller).await
    }

    /// Read every pending frame off the caller channel, surfacing the
    /// first signal worth acting on.
    pub(super) async fn drain_caller_channel(&self, caller: &WaitingClient) -> Option<WaitSignal> {
        while let Some(frame) = self.transport.read(caller.channel()).await {
            match frame {
                Frame::Control(ControlKind::Hangup { cause }) => {
                    return Some(WaitSignal::HungUp(cause));
                }
                Frame::Dtmf(digit) => return Some(WaitSignal::Digit(digit)),
                Frame::Voice | Frame::Control(_) => {}
            }
        }
        None
    }

    /// Act on a digit from the waiting caller: `*` disconnect, or an exit
    /// context match.
    pub(super) async fn handle_caller_digit(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        digit: char,
    ) -> Option<DispatchOutcome> {
        if digit == '*' && caller.options.disconnect_on_star {
            let wait = caller.wait_secs(Instant::now());
            let position = caller.entry().position();
            let original = caller.entry().original_position();
            self.leave_list(queue, caller).await;
            queue.data().stats().lock().await.record_abandon();
            self.audit.record(
                queue.name(),
                caller.uid(),
                "NONE",
                AuditTag::Abandon,
                &[&position.to_string(), &original.to_string(), &wait.to_string()],
            );
            return Some(DispatchOutcome::Disconnected);
        }

        caller.digits.push(digit);
        let context = caller.options.exit_context.clone()?;
        let dialplan = self.dialplan.as_ref()?;
        if dialplan.can_match(&context, &caller.digits).await {
            let wait = caller.wait_secs(Instant::now());
            let digits = caller.digits.clone();
            let position = caller.entry().position();
            let original = caller.entry().original_position();
            self.leave_list(queue, caller).await;
            self.audit.record(
                queue.name(),
                caller.uid(),
                "NONE",
                AuditTag::ExitWithKey,
                &[&digits, &position.to_string(), &original.to_string(), &wait.to_string()],
            );
            self.transport
                .indicate(caller.channel(), Indication::MusicOnHoldStop)
                .await;
            return Some(DispatchOutcome::ExitWithDigits(digits));
        }
        None
    }

    /// Evaluate the leave-empty predicate; ejects the caller when it
    /// fires.
    pub(super) async fn check_leave_empty(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
    ) -> Option<DispatchOutcome> {
        let check = queue.config().leave_empty;
        if !check.enabled {
            return None;
        }
        let (empty, outcome) = {
            let roster = queue.data().members().read().await;
            if roster.is_empty() {
                (true, DispatchOutcome::LeaveEmpty)
            } else if roster.occupancy_count(&check.conditions, Instant::now()) == 0 {
                (true, DispatchOutcome::LeaveUnavail)
            } else {
                (false, DispatchOutcome::LeaveEmpty)
            }
        };
        if !empty {
            return None;
        }

        let wait = caller.wait_secs(Instant::now());
        let position = caller.entry().position();
        let original = caller.entry().original_position();
        self.leave_list(queue, caller).await;
        self.audit.record(
            queue.name(),
            caller.uid(),
            "NONE",
            AuditTag::ExitEmpty,
            &[&position.to_string(), &original.to_string(), &wait.to_string()],
        );
        self.transport
            .indicate(caller.channel(), Indication::MusicOnHoldStop)
            .await;
        Some(outcome)
    }

    /// Timeout exit: remove, account, report.
    pub(super) async fn exit_with_timeout(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
    ) -> DispatchOutcome {
        let wait = caller.wait_secs(Instant::now());
        let position = caller.entry().position();
        let original = caller.entry().original_position();
        self.leave_list(queue, caller).await;
        self.audit.record(
            queue.name(),
            caller.uid(),
            "NONE",
            AuditTag::ExitWithTimeout,
            &[&position.to_string(), &original.to_string(), &wait.to_string()],
        );
        self.transport
            .indicate(caller.channel(), Indication::MusicOnHoldStop)
            .await;
        DispatchOutcome::Timeout
    }

    /// Abandon: the caller hung up while waiting or ringing.
    pub(super) async fn record_abandon(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        cause: i32,
    ) -> DispatchOutcome {
        let wait = caller.wait_secs(Instant::now());
        let position = caller.entry().position();
        let original = caller.entry().original_position();
        self.leave_list(queue, caller).await;
        queue.data().stats().lock().await.record_abandon();
        self.events.emit(QueueEventKind::CallerAbandon {
            queue: queue.name().to_string(),
            caller_uid: caller.uid().to_string(),
            position,
            original_position: original,
            hold_secs: wait,
        });
        self.audit.record(
            queue.name(),
            caller.uid(),
            "NONE",
            AuditTag::Abandon,
            &[&position.to_string(), &original.to_string(), &wait.to_string()],
        );
        debug!("☎️ Caller {} abandoned (cause {})", caller.uid(), cause);
        DispatchOutcome::Abandoned { cause }
    }

    /// Remove the caller from the waiting list and emit Leave.
    pub(super) async fn leave_list(&self, queue: &Arc<Queue>, caller: &WaitingClient) {
        if queue.data().remove_caller(caller.uid()).await.is_some() {
            self.events.emit(QueueEventKind::Leave {
                queue: queue.name().to_string(),
                caller_uid: caller.uid().to_string(),
                count: queue.data().count(),
            });
        }
    }

    /// Run the announcement schedules; returns a digit pressed during a
    /// prompt, if any.
    pub(super) async fn maybe_announce(
        &self,
        queue: &Arc<Queue>,
        caller: &WaitingClient,
        state: &mut AnnounceState,
    ) -> Option<char> {
        let announce = &queue.config().announce;
        let now = Instant::now();
        let mut digit = None;

        let position_due = announce.frequency_secs > 0
            && state
                .last_position
                .map_or(true, |last| now.duration_since(last).as_secs() >= announce.frequency_secs);
        if position_due {
            state.last_position = Some(now);
            if announce.announce_position {
                let position = caller.entry().position();
                for prompt in ["queue-thereare", &position.to_string(), "queue-callswaiting"] {
                    if let Some(d) = self.prompts.play_file(caller.channel(), prompt).await {
                        digit.get_or_insert(d);
                    }
                }
            }
            if announce.announce_holdtime {
                let average = queue.data().stats().lock().await.holdtime_avg_secs;
                let rounded = round_holdtime(average, queue.config().holdtime_rounding_secs);
                if rounded > 0 {
                    for prompt in ["queue-holdtime", &rounded.to_string()] {
                        if let Some(d) = self.prompts.play_file(caller.channel(), prompt).await {
                            digit.get_or_insert(d);
                        }
                    }
                }
            }
        }

        let periodic_due = announce.periodic_frequency_secs > 0
            && !announce.periodic_prompts.is_empty()
            && state
                .last_periodic
                .map_or(true, |last| {
                    now.duration_since(last).as_secs() >= announce.periodic_frequency_secs
                });
        if periodic_due {
            state.last_periodic = Some(now);
            let prompt = &announce.periodic_prompts[state.periodic_index % announce.periodic_prompts.len()];
            state.periodic_index += 1;
            if let Some(d) = self.prompts.play_file(caller.channel(), prompt).await {
                digit.get_or_insert(d);
            }
        }

        digit
    }

    /// Single-consumer task fanning device status changes out to member
    /// status events across every queue that has not masked them.
    fn spawn_device_fanout(self: &Arc<Self>) {
        let Some(mut rx) = self.devices.take_fanout_receiver() else {
            return;
        };
        let queues = self.queues.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                for queue in queues.snapshot() {
                    if queue.config().mask_member_status {
                        continue;
                    }
                    let roster = queue.data().members().read().await;
                    for member in roster.iter().filter(|m| m.state_key() == change.key) {
                        events.emit(QueueEventKind::MemberStatus {
                            queue: queue.name().to_string(),
                            interface: member.interface().to_string(),
                            status: member.effective_status(),
                        });
                    }
                }
            }
        });
    }

    /// Diagnostic sweep reporting devices with long-lived commitments.
    fn spawn_stuck_sweep(self: &Arc<Self>) {
        if self.config.stuck_sweep_secs == 0 {
            return;
        }
        let devices = self.devices.clone();
        let period = Duration::from_secs(self.config.stuck_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for (key, reserved, active) in devices.committed_snapshot() {
                    debug!(
                        "🧹 Device {} carries commitments (reserved {}, active {})",
                        key, reserved, active
                    );
                }
            }
        });
    }
}

/// Round an announced holdtime to the configured granularity.
fn round_holdtime(average_secs: u64, rounding_secs: u64) -> u64 {
    if rounding_secs == 0 {
        average_secs
    } else {
        (average_secs + rounding_secs / 2) / rounding_secs * rounding_secs
    }
}
