//! The event race
//!
//! While attempts ring, the caller channel and every live outbound channel
//! are polled together. Each wake services every ready channel: the first
//! answer wins, busy and congestion retire their attempt and pull in the
//! next best candidate, forwards are honored, party updates are saved or
//! applied, and the caller keeps its power to hang up, disconnect, or dial
//! an exit digit at any moment.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::caller::WaitingClient;
use crate::config::Strategy;
use crate::queue::Queue;
use crate::transport::{split_interface, ControlKind, Frame, Indication, PartyInfo};

use super::attempt::AttemptSet;
use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::ring::RERING_FLOOR;

/// Why the race ended
#[derive(Debug)]
pub enum MuxVerdict {
    /// The attempt at this index answered first
    Winner(usize),
    /// The caller hung up with the given cause
    CallerHangup {
        /// Transport hangup cause
        cause: i32,
    },
    /// The caller exited by digit; accounting is already done
    Exit(DispatchOutcome),
    /// The round's ring timeout elapsed with attempts still ringing
    TimedOut,
    /// Every candidate was retired before anyone answered
    Exhausted,
}

/// Outcome of one race plus the unspent timeout budget
#[derive(Debug)]
pub struct MuxResult {
    /// Why the race ended
    pub verdict: MuxVerdict,
    /// Timeout budget left when it did
    pub remaining: Duration,
}

impl MuxResult {
    fn new(verdict: MuxVerdict, remaining: Duration) -> Self {
        MuxResult { verdict, remaining }
    }
}

impl Dispatcher {
    /// Race the caller channel against every live outbound attempt.
    pub(super) async fn wait_for_answer(
        &self,
        queue: &Arc<Queue>,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
    ) -> MuxResult {
        let total = queue.config().ring_timeout();
        let strategy = queue.config().strategy;
        let mut remaining = total;
        let mut ringing_indicated = false;

        loop {
            let any_ringing = attempts
                .iter()
                .any(|a| a.still_going && a.channel.is_some());
            if !any_ringing && self.ring_one(queue, caller, attempts).await == 0 {
                return MuxResult::new(MuxVerdict::Exhausted, remaining);
            }
            if remaining.is_zero() {
                return MuxResult::new(MuxVerdict::TimedOut, Duration::ZERO);
            }

            let mut watch = vec![caller.channel().clone()];
            watch.extend(attempts.watch_channels());
            let wait = self.transport.wait_for_events(&watch, remaining).await;
            if wait.ready.is_empty() {
                return MuxResult::new(MuxVerdict::TimedOut, Duration::ZERO);
            }

            let mut transitioned = false;
            let mut retired_any = false;

            for channel in &wait.ready {
                if channel == caller.channel() {
                    while let Some(frame) = self.transport.read(channel).await {
                        match frame {
                            Frame::Control(ControlKind::Hangup { cause }) => {
                                return MuxResult::new(
                                    MuxVerdict::CallerHangup { cause },
                                    wait.remaining,
                                );
                            }
                            Frame::Dtmf(digit) => {
                                if let Some(outcome) =
                                    self.handle_caller_digit(queue, caller, digit).await
                                {
                                    return MuxResult::new(MuxVerdict::Exit(outcome), wait.remaining);
                                }
                            }
                            Frame::Voice | Frame::Control(_) => {}
                        }
                    }
                    continue;
                }

                let Some(index) = attempts.index_by_channel(channel) else {
                    continue;
                };
                while let Some(frame) = self.transport.read(channel).await {
                    match frame {
                        Frame::Control(ControlKind::Answer) => {
                            return MuxResult::new(MuxVerdict::Winner(index), wait.remaining);
                        }
                        Frame::Control(ControlKind::Busy) => {
                            self.attempt_failed(queue, caller, attempts, index, "busy").await;
                            transitioned = true;
                            retired_any = true;
                            break;
                        }
                        Frame::Control(ControlKind::Congestion) => {
                            self.attempt_failed(queue, caller, attempts, index, "congestion").await;
                            transitioned = true;
                            retired_any = true;
                            break;
                        }
                        Frame::Control(ControlKind::Hangup { .. }) => {
                            self.attempt_failed(queue, caller, attempts, index, "hangup").await;
                            transitioned = true;
                            retired_any = true;
                            break;
                        }
                        Frame::Control(ControlKind::Ringing) => {
                            transitioned = true;
                            if caller.options.ring_indication && !ringing_indicated {
                                self.transport
                                    .indicate(caller.channel(), Indication::MusicOnHoldStop)
                                    .await;
                                self.transport
                                    .indicate(caller.channel(), Indication::Ringing)
                                    .await;
                                ringing_indicated = true;
                            }
                        }
                        Frame::Control(ControlKind::CallForward { destination }) => {
                            self.handle_forward(caller, attempts, index, &destination).await;
                            transitioned = true;
                            break;
                        }
                        Frame::Control(ControlKind::ConnectedLine(party)) => {
                            if caller.options.propagate_connected_updates {
                                if strategy == Strategy::RingAll {
                                    if let Some(attempt) = attempts.get_mut(index) {
                                        attempt.pending_connected = Some(party);
                                    }
                                } else {
                                    self.transport
                                        .update_connected_line(caller.channel(), &party)
                                        .await;
                                }
                            }
                        }
                        Frame::Control(ControlKind::Redirecting(party)) => {
                            if caller.options.propagate_connected_updates {
                                if strategy == Strategy::RingAll {
                                    if let Some(attempt) = attempts.get_mut(index) {
                                        attempt.pending_redirecting = Some(party);
                                    }
                                } else {
                                    self.transport
                                        .update_redirecting(caller.channel(), &party)
                                        .await;
                                }
                            }
                        }
                        Frame::Control(ControlKind::Aoc(rate)) => {
                            if let Some(attempt) = attempts.get_mut(index) {
                                attempt.aoc_rates.push(rate);
                            }
                        }
                        Frame::Control(ControlKind::OffHook) | Frame::Voice | Frame::Dtmf(_) => {}
                    }
                }
            }

            remaining = if queue.config().timeout_restart && transitioned {
                total
            } else {
                wait.remaining
            };

            if retired_any && strategy != Strategy::RingAll && remaining > RERING_FLOOR {
                self.ring_one(queue, caller, attempts).await;
            }
        }
    }

    /// Honor (or refuse) a call-forward indication from a rung member.
    ///
    /// The old outbound is torn down either way. When forwarding is
    /// permitted and the destination has not been dialed for this caller
    /// yet, a fresh channel is requested toward it and takes the
    /// attempt's place in the race. The new leg is told where the call
    /// came from (the extension the caller dialed, as the redirecting
    /// party) and, when the caller presented an identity, who is calling.
    async fn handle_forward(
        &self,
        caller: &mut WaitingClient,
        attempts: &mut AttemptSet,
        index: usize,
        destination: &str,
    ) {
        let old_channel = match attempts.get_mut(index) {
            Some(attempt) => {
                attempt.watching = false;
                attempt.channel.take()
            }
            None => return,
        };
        if let Some(channel) = old_channel {
            self.transport.hangup(&channel, false).await;
        }

        if !caller.options.allow_forwarding {
            debug!("↪️ forward to {} refused by caller options", destination);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return;
        }
        if !caller.note_dialed(destination) {
            debug!("↪️ forward loop to {} broken", destination);
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return;
        }
        let Ok((tech, location)) = split_interface(destination) else {
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return;
        };

        let channel = match self.transport.request(tech, location, Some(caller.channel())).await {
            Ok(channel) => channel,
            Err(failure) => {
                debug!("↪️ forward request toward {} refused: {}", destination, failure);
                if let Some(attempt) = attempts.get_mut(index) {
                    attempt.retire();
                }
                return;
            }
        };
        if self.transport.call(&channel, location).await.is_err() {
            self.transport.hangup(&channel, false).await;
            if let Some(attempt) = attempts.get_mut(index) {
                attempt.retire();
            }
            return;
        }

        debug!("↪️ forwarded to {}", destination);
        let (forwarded_from, callerid_absent) = match attempts.get_mut(index) {
            Some(attempt) => {
                attempt.channel = Some(channel.clone());
                attempt.watching = true;
                attempt.ring_started = Some(Instant::now());
                if attempt.forwarded_from.is_none() {
                    attempt.forwarded_from = caller.extension.clone();
                }
                (attempt.forwarded_from.clone(), attempt.dial_callerid_absent)
            }
            None => return,
        };

        if let Some(number) = forwarded_from {
            self.transport
                .update_redirecting(&channel, &PartyInfo { number: Some(number), name: None })
                .await;
        }
        if !callerid_absent {
            if let Some(party) = caller.caller_id.clone() {
                self.transport.update_connected_line(&channel, &party).await;
            }
        }
    }
}
