//! Scripted collaborators for end-to-end engine tests
//!
//! The mock transport owns fake channels whose frames are scheduled at
//! absolute instants, so tests running under tokio's paused clock are
//! fully deterministic: the engine's own timers and the scripted frames
//! interleave exactly as wall time would have them.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use acd_engine::prelude::*;

/// How a scripted member behaves when rung
#[derive(Clone)]
pub enum Behavior {
    /// Deliver Answer this long after the call is placed
    AnswerAfter(Duration),
    /// Deliver Busy this long after the call is placed
    BusyAfter(Duration),
    /// Ring forever
    NeverAnswer,
    /// Refuse the channel request outright
    RefuseRequest(RequestFailure),
    /// Offer a call forward to the given interface
    ForwardAfter(Duration, String),
}

struct MockChannel {
    frames: Mutex<VecDeque<(Instant, Frame)>>,
    hung: AtomicBool,
}

impl MockChannel {
    fn new() -> Self {
        MockChannel { frames: Mutex::new(VecDeque::new()), hung: AtomicBool::new(false) }
    }

    fn schedule(&self, due: Instant, frame: Frame) {
        let mut frames = self.frames.lock();
        let at = frames.iter().position(|(d, _)| *d > due).unwrap_or(frames.len());
        frames.insert(at, (due, frame));
    }

    fn next_due(&self) -> Option<Instant> {
        if self.hung.load(Ordering::SeqCst) {
            return None;
        }
        self.frames.lock().front().map(|(due, _)| *due)
    }

    fn has_due(&self, now: Instant) -> bool {
        self.next_due().map_or(false, |due| due <= now)
    }

    fn pop_due(&self, now: Instant) -> Option<Frame> {
        if self.hung.load(Ordering::SeqCst) {
            return None;
        }
        let mut frames = self.frames.lock();
        if frames.front().map_or(false, |(due, _)| *due <= now) {
            frames.pop_front().map(|(_, frame)| frame)
        } else {
            None
        }
    }

    fn hang_up(&self) {
        self.hung.store(true, Ordering::SeqCst);
        self.frames.lock().clear();
    }
}

/// Scripted channel driver
pub struct MockTransport {
    channels: DashMap<ChannelId, Arc<MockChannel>>,
    channel_interface: DashMap<ChannelId, String>,
    behaviors: DashMap<String, Behavior>,
    bridges: DashMap<String, (Duration, BridgeEnd)>,
    counter: AtomicUsize,
    requests: Mutex<Vec<String>>,
    hangups: Mutex<Vec<(String, bool)>>,
    indications: Mutex<Vec<(String, Indication)>>,
    party_updates: Mutex<Vec<(String, String, PartyInfo)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            channels: DashMap::new(),
            channel_interface: DashMap::new(),
            behaviors: DashMap::new(),
            bridges: DashMap::new(),
            counter: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
            indications: Mutex::new(Vec::new()),
            party_updates: Mutex::new(Vec::new()),
        })
    }

    /// Create a caller-side channel tests can script frames on.
    pub fn make_caller(&self, name: &str) -> ChannelId {
        let id = ChannelId::from(name);
        self.channels.insert(id.clone(), Arc::new(MockChannel::new()));
        id
    }

    /// Schedule a frame on a channel, `after` from now.
    pub fn schedule_frame(&self, channel: &ChannelId, after: Duration, frame: Frame) {
        if let Some(entry) = self.channels.get(channel) {
            entry.schedule(Instant::now() + after, frame);
        }
    }

    /// Script how an interface behaves when rung.
    pub fn behavior(&self, interface: &str, behavior: Behavior) {
        self.behaviors.insert(interface.to_string(), behavior);
    }

    /// Script the bridge outcome used when this interface wins.
    pub fn bridge_outcome(&self, interface: &str, talk: Duration, end: BridgeEnd) {
        self.bridges.insert(interface.to_string(), (talk, end));
    }

    /// Every interface requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// How many times an interface was requested.
    pub fn request_count(&self, interface: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.as_str() == interface).count()
    }

    /// Hangups recorded against channels whose id contains `needle`:
    /// `(channel, answered_elsewhere)`.
    pub fn hangups_matching(&self, needle: &str) -> Vec<(String, bool)> {
        self.hangups
            .lock()
            .iter()
            .filter(|(channel, _)| channel.contains(needle))
            .cloned()
            .collect()
    }

    /// Connected-line and redirecting updates sent so far:
    /// `(channel, kind, party)` where kind is `"connected"` or
    /// `"redirecting"`.
    pub fn party_updates(&self) -> Vec<(String, String, PartyInfo)> {
        self.party_updates.lock().clone()
    }

    /// Indications sent to a channel.
    pub fn indications_for(&self, channel: &ChannelId) -> Vec<Indication> {
        self.indications
            .lock()
            .iter()
            .filter(|(c, _)| c == channel.as_ref())
            .map(|(_, i)| *i)
            .collect()
    }

    fn channel(&self, id: &ChannelId) -> Option<Arc<MockChannel>> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        tech: &str,
        location: &str,
        _originator: Option<&ChannelId>,
    ) -> std::result::Result<ChannelId, RequestFailure> {
        let interface = format!("{}/{}", tech, location);
        self.requests.lock().push(interface.clone());
        if let Some(Behavior::RefuseRequest(failure)) =
            self.behaviors.get(&interface).map(|b| b.value().clone())
        {
            return Err(failure);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = ChannelId::from(format!("out-{}-{}", n, interface));
        self.channels.insert(id.clone(), Arc::new(MockChannel::new()));
        self.channel_interface.insert(id.clone(), interface);
        Ok(id)
    }

    async fn call(
        &self,
        channel: &ChannelId,
        _address: &str,
    ) -> std::result::Result<(), RequestFailure> {
        let interface = self
            .channel_interface
            .get(channel)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let Some(mock) = self.channel(channel) else {
            return Err(RequestFailure::Unavailable);
        };
        let now = Instant::now();
        match self.behaviors.get(&interface).map(|b| b.value().clone()) {
            Some(Behavior::AnswerAfter(delay)) => {
                mock.schedule(now, Frame::Control(ControlKind::Ringing));
                mock.schedule(now + delay, Frame::Control(ControlKind::Answer));
            }
            Some(Behavior::BusyAfter(delay)) => {
                mock.schedule(now + delay, Frame::Control(ControlKind::Busy));
            }
            Some(Behavior::ForwardAfter(delay, destination)) => {
                mock.schedule(
                    now + delay,
                    Frame::Control(ControlKind::CallForward { destination }),
                );
            }
            Some(Behavior::NeverAnswer) | None => {
                mock.schedule(now, Frame::Control(ControlKind::Ringing));
            }
            Some(Behavior::RefuseRequest(failure)) => return Err(failure),
        }
        Ok(())
    }

    async fn hangup(&self, channel: &ChannelId, answered_elsewhere: bool) {
        self.hangups.lock().push((channel.as_ref().to_string(), answered_elsewhere));
        if let Some(mock) = self.channel(channel) {
            mock.hang_up();
        }
    }

    async fn wait_for_events(&self, channels: &[ChannelId], timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let ready: Vec<ChannelId> = channels
                .iter()
                .filter(|id| self.channel(id).map_or(false, |c| c.has_due(now)))
                .cloned()
                .collect();
            if !ready.is_empty() {
                return WaitResult { ready, remaining: deadline.saturating_duration_since(now) };
            }
            if now >= deadline {
                return WaitResult { ready: Vec::new(), remaining: Duration::ZERO };
            }
            let next_due = channels
                .iter()
                .filter_map(|id| self.channel(id).and_then(|c| c.next_due()))
                .min();
            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn read(&self, channel: &ChannelId) -> Option<Frame> {
        self.channel(channel)?.pop_due(Instant::now())
    }

    async fn indicate(&self, channel: &ChannelId, indication: Indication) {
        self.indications.lock().push((channel.as_ref().to_string(), indication));
    }

    async fn bridge(
        &self,
        _caller: &ChannelId,
        peer: &ChannelId,
        _options: &BridgeOptions,
    ) -> BridgeOutcome {
        let interface = self
            .channel_interface
            .get(peer)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let (talk, end) = self
            .bridges
            .get(&interface)
            .map(|entry| entry.value().clone())
            .unwrap_or((Duration::from_secs(30), BridgeEnd::CallerHungUp));
        tokio::time::sleep(talk).await;
        BridgeOutcome { talk_time: talk, end }
    }

    async fn update_connected_line(&self, channel: &ChannelId, party: &PartyInfo) {
        self.party_updates.lock().push((
            channel.as_ref().to_string(),
            "connected".to_string(),
            party.clone(),
        ));
    }

    async fn update_redirecting(&self, channel: &ChannelId, party: &PartyInfo) {
        self.party_updates.lock().push((
            channel.as_ref().to_string(),
            "redirecting".to_string(),
            party.clone(),
        ));
    }
}

/// Prompt player that plays instantly and can script a digit per prompt
#[derive(Default)]
pub struct MockPrompts {
    played: Mutex<Vec<(String, String)>>,
    digits: DashMap<String, char>,
}

impl MockPrompts {
    pub fn new() -> Self {
        MockPrompts::default()
    }

    pub fn press_during(&self, prompt: &str, digit: char) {
        self.digits.insert(prompt.to_string(), digit);
    }

    pub fn played(&self) -> Vec<(String, String)> {
        self.played.lock().clone()
    }
}

#[async_trait]
impl PromptPlayer for MockPrompts {
    async fn play_file(&self, channel: &ChannelId, name: &str) -> Option<char> {
        self.played.lock().push((channel.as_ref().to_string(), name.to_string()));
        self.digits.get(name).map(|entry| *entry)
    }
}

/// Dial-plan evaluator with scripted exit extensions
#[derive(Default)]
pub struct MockDialplan {
    extensions: DashMap<String, Vec<String>>,
    ran: Mutex<Vec<(String, String)>>,
}

impl MockDialplan {
    pub fn new() -> Self {
        MockDialplan::default()
    }

    pub fn extension(&self, context: &str, digits: &str) {
        self.extensions
            .entry(context.to_string())
            .or_default()
            .push(digits.to_string());
    }

    pub fn ran(&self) -> Vec<(String, String)> {
        self.ran.lock().clone()
    }
}

#[async_trait]
impl Dialplan for MockDialplan {
    async fn run(&self, channel: &ChannelId, target: &str) -> Result<()> {
        self.ran.lock().push((channel.as_ref().to_string(), target.to_string()));
        Ok(())
    }

    async fn can_match(&self, context: &str, digits: &str) -> bool {
        self.extensions
            .get(context)
            .map_or(false, |list| list.iter().any(|d| d == digits))
    }
}

/// Assemble an engine wired to scripted collaborators and a memory audit
/// sink.
pub fn engine_with_mocks() -> (
    Arc<MockTransport>,
    Arc<MockPrompts>,
    Arc<MemorySink>,
    Arc<Dispatcher>,
) {
    let transport = MockTransport::new();
    let prompts = Arc::new(MockPrompts::new());
    let sink = Arc::new(MemorySink::new());
    let dispatcher = DispatcherBuilder::new(transport.clone(), prompts.clone())
        .audit_sink(sink.clone())
        .build();
    (transport, prompts, sink, dispatcher)
}
