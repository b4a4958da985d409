//! External collaborator seams
//!
//! The engine does not talk to the telephony transport, the prompt player,
//! the dial-plan evaluator, or the persistent key/value store directly.
//! Each is consumed through a narrow trait defined here, and the engine is
//! agnostic to whatever stack sits behind them. Tests drive the engine with
//! scripted implementations of the same traits.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AcdError, Result};

/// Opaque handle for one channel owned by the transport
///
/// The engine never inspects the contents; equality and hashing are all it
/// needs to track watch sets and attempt ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        ChannelId(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId(s.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connected-line or redirecting party data carried on control frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyInfo {
    /// Party number, if known
    pub number: Option<String>,
    /// Party display name, if known
    pub name: Option<String>,
}

/// One advice-of-charge rate entry (S type)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AocRate {
    /// ISO currency code
    pub currency: String,
    /// Charge amount per unit, in the currency's minor units
    pub amount_per_unit: u64,
    /// Charged unit length in seconds
    pub unit_secs: u32,
}

/// Control event kinds the engine consumes from [`Transport::read`]
#[derive(Debug, Clone, PartialEq)]
pub enum ControlKind {
    /// The far end answered
    Answer,
    /// The far end is busy
    Busy,
    /// The network reported congestion
    Congestion,
    /// The far end is ringing
    Ringing,
    /// The far end went off hook
    OffHook,
    /// The channel hung up with the given transport cause code
    Hangup { cause: i32 },
    /// Connected-line party update
    ConnectedLine(PartyInfo),
    /// Redirecting party update
    Redirecting(PartyInfo),
    /// The far end asks to forward the call to another destination
    CallForward { destination: String },
    /// Advice-of-charge rate information
    Aoc(AocRate),
}

/// One frame read from a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Media; the engine ignores the payload
    Voice,
    /// A DTMF digit pressed on the channel
    Dtmf(char),
    /// A control event
    Control(ControlKind),
}

/// Why the transport refused to allocate or place a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFailure {
    /// The target endpoint is busy
    Busy,
    /// The network or driver reported congestion
    Congestion,
    /// The endpoint is unreachable or does not exist
    Unavailable,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFailure::Busy => write!(f, "busy"),
            RequestFailure::Congestion => write!(f, "congestion"),
            RequestFailure::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Out-of-band indications the engine sends toward the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    /// Start ring-back toward the caller
    Ringing,
    /// Stop ring-back
    StopRinging,
    /// Start hold music
    MusicOnHoldStart,
    /// Stop hold music
    MusicOnHoldStop,
}

/// Options for a caller/member bridge
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    /// Record the bridged call under this base filename
    pub record: Option<String>,
}

/// How a bridge ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The caller hung up first
    CallerHungUp,
    /// The member hung up first
    MemberHungUp,
    /// The call was transferred away to the given target
    Transferred {
        /// Transfer destination as reported by the transport
        target: String,
    },
    /// The bridge could not be set up between these channels
    Failed,
}

/// Result of a completed bridge
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    /// Wall time the two parties were connected
    pub talk_time: Duration,
    /// Which side ended the bridge
    pub end: BridgeEnd,
}

/// Result of one [`Transport::wait_for_events`] poll
#[derive(Debug, Clone)]
pub struct WaitResult {
    /// Channels with at least one frame ready to read
    pub ready: Vec<ChannelId>,
    /// Timeout budget left after the poll
    pub remaining: Duration,
}

/// Channel-driver contract consumed by the engine
///
/// The transport owns every channel; the engine holds [`ChannelId`] handles
/// and drives them through this trait. All methods are cancel-safe from the
/// engine's point of view: a caller task dropped mid-call leaves the
/// transport free to reap its channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocate an outbound channel toward `tech/location` without placing
    /// the call. `originator` is the caller channel, for codec and variable
    /// inheritance.
    async fn request(
        &self,
        tech: &str,
        location: &str,
        originator: Option<&ChannelId>,
    ) -> std::result::Result<ChannelId, RequestFailure>;

    /// Place the call on a previously requested channel.
    async fn call(
        &self,
        channel: &ChannelId,
        address: &str,
    ) -> std::result::Result<(), RequestFailure>;

    /// Hang up a channel. `answered_elsewhere` marks the hangup as caused
    /// by another attempt winning the race.
    async fn hangup(&self, channel: &ChannelId, answered_elsewhere: bool);

    /// Block until any watched channel has a frame ready or the timeout
    /// elapses. Returns every ready channel plus the unspent budget.
    async fn wait_for_events(&self, channels: &[ChannelId], timeout: Duration) -> WaitResult;

    /// Read the next frame from a channel; `None` when nothing is pending.
    async fn read(&self, channel: &ChannelId) -> Option<Frame>;

    /// Send an out-of-band indication on a channel.
    async fn indicate(&self, channel: &ChannelId, indication: Indication);

    /// Bridge the caller to the winning member channel. Blocks until the
    /// bridge ends.
    async fn bridge(
        &self,
        caller: &ChannelId,
        peer: &ChannelId,
        options: &BridgeOptions,
    ) -> BridgeOutcome;

    /// Apply a connected-line update toward a channel. Transports without
    /// party-update support may ignore this.
    async fn update_connected_line(&self, _channel: &ChannelId, _party: &PartyInfo) {}

    /// Apply a redirecting update toward a channel.
    async fn update_redirecting(&self, _channel: &ChannelId, _party: &PartyInfo) {}

    /// Replay an advice-of-charge rate toward a channel.
    async fn send_aoc(&self, _channel: &ChannelId, _rate: &AocRate) {}
}

/// Audio-prompt player contract
#[async_trait]
pub trait PromptPlayer: Send + Sync {
    /// Play a prompt file on the channel. Returns a DTMF digit if one was
    /// pressed during playback.
    async fn play_file(&self, channel: &ChannelId, name: &str) -> Option<char>;
}

/// Dial-plan evaluator contract
///
/// Used for the post-connect hook and for validating caller exit digits
/// against a configured exit context.
#[async_trait]
pub trait Dialplan: Send + Sync {
    /// Execute a dial-plan target (macro/gosub) on the given channel.
    async fn run(&self, channel: &ChannelId, target: &str) -> Result<()>;

    /// Whether the accumulated digits form a valid extension in `context`.
    async fn can_match(&self, context: &str, digits: &str) -> bool;
}

/// Persistent key/value store contract
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value.
    async fn put(&self, family: &str, key: &str, value: &str) -> Result<()>;

    /// Fetch a value, `None` when absent.
    async fn get(&self, family: &str, key: &str) -> Option<String>;

    /// Delete a value; deleting an absent key is not an error.
    async fn delete(&self, family: &str, key: &str) -> Result<()>;
}

/// Split a dialable interface into its `(technology, location)` halves.
///
/// # Examples
///
/// ```
/// use acd_engine::transport::split_interface;
///
/// let (tech, location) = split_interface("PJSIP/alice").unwrap();
/// assert_eq!(tech, "PJSIP");
/// assert_eq!(location, "alice");
/// assert!(split_interface("nodelimiter").is_err());
/// ```
pub fn split_interface(interface: &str) -> Result<(&str, &str)> {
    match interface.split_once('/') {
        Some((tech, location)) if !tech.is_empty() && !location.is_empty() => Ok((tech, location)),
        _ => Err(AcdError::invalid_input(format!(
            "interface '{}' is not of the form tech/location",
            interface
        ))),
    }
}
