//! Ring-strategy metric calculator and candidate selection
//!
//! At the start of each ring cycle the selector computes one metric per
//! candidate member; lower metric means higher preference. RingAll rings
//! the whole best band in parallel, every other strategy rings a single
//! best candidate and falls through to the next on failure.
//!
//! Metric layout: the low three digits carry the strategy's ordering (the
//! cursor band for Linear and round robin), and members past the penalty
//! gate are pushed into bands of one million per penalty point.

use rand::Rng;
use tokio::time::Instant;

use crate::caller::WaitingClient;
use crate::config::Strategy;
use crate::member::MemberRoster;
use crate::queue::RrCursor;

use super::attempt::{Attempt, AttemptSet};

/// Metric contribution per penalty point once penalties are in effect
pub const PENALTY_BAND: i64 = 1_000_000;

/// Width of the cursor band used by Linear and round robin
pub const CURSOR_BAND: i64 = 1000;

/// Computes metrics and picks candidates for ring cycles
pub struct RingSelector;

impl RingSelector {
    /// Build the attempt list for one ring cycle
    ///
    /// Filters out members this caller already dialed (the forward-loop
    /// guard), members with an invalid penalty, and, when penalties are in
    /// effect, members outside the caller's penalty window. Pause, wrapup,
    /// and device-state checks are deliberately left to ring time.
    ///
    /// The Linear wrapped flag is updated on `caller`; the round-robin
    /// wrapped flag on `rr`.
    pub fn build_attempts(
        strategy: Strategy,
        penalty_members_limit: usize,
        roster: &MemberRoster,
        caller: &mut WaitingClient,
        rr: &mut RrCursor,
        now: Instant,
    ) -> AttemptSet {
        let member_count = roster.len();
        let use_penalty = penalty_members_limit > 0 && member_count > penalty_members_limit;
        let mut rng = rand::thread_rng();
        let mut attempts = Vec::new();

        for (pos, member) in roster.iter().enumerate() {
            if caller.already_dialed(member.interface()) {
                continue;
            }
            let penalty = member.penalty();
            if penalty < 0 {
                continue;
            }
            if use_penalty && !caller.window.accepts(penalty) {
                continue;
            }

            let band = if use_penalty { penalty as i64 * PENALTY_BAND } else { 0 };

            let metric = match strategy {
                Strategy::RingAll => band,
                Strategy::Linear => {
                    Self::cursor_metric(pos, &mut caller.linear) + band
                }
                Strategy::RrMemory | Strategy::RrOrdered => {
                    Self::cursor_metric(pos, rr) + band
                }
                Strategy::Random => rng.gen_range(0..CURSOR_BAND) + band,
                Strategy::WeightedRandom => {
                    // Penalty widens the spread instead of banding.
                    rng.gen_range(0..CURSOR_BAND * (1 + penalty as i64))
                }
                Strategy::FewestCalls => member.calls() as i64 + band,
                Strategy::LeastRecent => {
                    let recency = match member.last_call_end() {
                        None => 0,
                        Some(end) => {
                            let since = now.duration_since(end).as_secs() as i64;
                            (PENALTY_BAND - since).max(0)
                        }
                    };
                    recency + band
                }
            };

            attempts.push(Attempt::new(member.clone(), metric));
        }

        AttemptSet::from_attempts(attempts)
    }

    /// Rank `pos` against a walk cursor: positions at or past the cursor
    /// keep their index, earlier positions land in the wrap band after
    /// everything else. Positions past the cursor set the wrapped flag so
    /// the end-of-round update knows later members existed.
    fn cursor_metric(pos: usize, cursor: &mut RrCursor) -> i64 {
        if pos < cursor.pos {
            CURSOR_BAND + pos as i64
        } else {
            if pos > cursor.pos {
                cursor.wrapped = true;
            }
            pos as i64
        }
    }

    /// Pick the candidates to ring this round
    ///
    /// The best is the smallest metric among live, not-yet-placed
    /// attempts. RingAll rings the whole tie band; every other strategy
    /// rings only the single best.
    pub fn next_candidates(set: &AttemptSet, strategy: Strategy) -> Vec<usize> {
        let Some(best) = set.best_placeable_metric() else {
            return Vec::new();
        };

        if strategy == Strategy::RingAll {
            (0..set.len())
                .filter(|&i| {
                    set.get(i)
                        .map_or(false, |a| a.placeable() && a.metric <= best)
                })
                .collect()
        } else {
            (0..set.len())
                .find(|&i| {
                    set.get(i)
                        .map_or(false, |a| a.placeable() && a.metric == best)
                })
                .into_iter()
                .collect()
        }
    }

    /// Cursor value to store once a ring round completes
    ///
    /// The next not-yet-placed candidate's metric, with the penalty band
    /// and wrap band stripped, becomes the new cursor, so the next round
    /// resumes the walk where this one left off. A round that exhausted
    /// its candidates resets the cursor to the head regardless of the
    /// wrapped flag; incrementing past the end would starve the first
    /// member.
    pub fn next_cursor(set: &AttemptSet) -> RrCursor {
        let pos = match set.best_placeable_metric() {
            Some(metric) => ((metric % PENALTY_BAND) % CURSOR_BAND) as usize,
            None => 0,
        };
        RrCursor { pos, wrapped: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::CallerOptions;
    use crate::device::DeviceRegistry;
    use crate::member::{MemberSpec, Provenance};
    use crate::queue::WaitingEntry;
    use crate::rules::PenaltyWindow;
    use crate::transport::ChannelId;
    use std::sync::Arc;

    fn roster_with(penalties: &[(&str, i32)]) -> (DeviceRegistry, MemberRoster) {
        let devices = DeviceRegistry::new();
        let mut roster = MemberRoster::new();
        for (interface, penalty) in penalties {
            let mut spec = MemberSpec::dynamic(interface);
            spec.penalty = *penalty;
            spec.provenance = Provenance::Static;
            roster.insert(spec, devices.acquire(interface)).unwrap();
        }
        (devices, roster)
    }

    fn caller() -> WaitingClient {
        let entry = Arc::new(WaitingEntry::new("c1", ChannelId::from("chan-c1"), 0));
        WaitingClient::new(
            entry,
            "q",
            CallerOptions::default(),
            PenaltyWindow::default(),
            None,
            None,
        )
    }

    #[test]
    fn ringall_rings_the_whole_best_band() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0), ("PJSIP/c", 1)]);
        let mut c = caller();
        let mut rr = RrCursor::default();
        // Low limit so penalties take effect.
        let set = RingSelector::build_attempts(Strategy::RingAll, 1, &roster, &mut c, &mut rr, Instant::now());

        let picked = RingSelector::next_candidates(&set, Strategy::RingAll);
        let interfaces: Vec<&str> = picked.iter().map(|&i| set.get(i).unwrap().interface()).collect();
        assert_eq!(interfaces, vec!["PJSIP/a", "PJSIP/b"]);
    }

    #[test]
    fn linear_walks_in_insertion_order_from_the_cursor() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0), ("PJSIP/c", 0)]);
        let mut c = caller();
        c.linear.pos = 1;
        let mut rr = RrCursor::default();
        let set = RingSelector::build_attempts(Strategy::Linear, 0, &roster, &mut c, &mut rr, Instant::now());

        let metrics: Vec<i64> = set.iter().map(|a| a.metric).collect();
        // a sits before the cursor: wrap band. b at the cursor, c past it.
        assert_eq!(metrics, vec![1000, 1, 2]);
        assert!(c.linear.wrapped, "a later member must set the wrapped flag");

        let picked = RingSelector::next_candidates(&set, Strategy::Linear);
        assert_eq!(picked.len(), 1);
        assert_eq!(set.get(picked[0]).unwrap().interface(), "PJSIP/b");
    }

    #[test]
    fn rr_cursor_written_back_strips_bands() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 1), ("PJSIP/b", 1), ("PJSIP/c", 1)]);
        let mut c = caller();
        c.window = PenaltyWindow { min: None, max: Some(5) };
        let mut rr = RrCursor { pos: 2, wrapped: false };
        let mut set =
            RingSelector::build_attempts(Strategy::RrMemory, 1, &roster, &mut c, &mut rr, Instant::now());

        // Best is c (metric 2 + band); place it, then the stored cursor
        // should resume at a's stripped position inside the wrap band.
        let picked = RingSelector::next_candidates(&set, Strategy::RrMemory);
        assert_eq!(set.get(picked[0]).unwrap().interface(), "PJSIP/c");
        set.get_mut(picked[0]).unwrap().channel = Some(ChannelId::from("chan-x"));

        let next = RingSelector::next_cursor(&set);
        assert_eq!(next.pos, 0);
        assert!(!next.wrapped);
    }

    #[test]
    fn exhausted_round_resets_cursor_to_head() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0)]);
        let mut c = caller();
        let mut rr = RrCursor { pos: 1, wrapped: false };
        let mut set =
            RingSelector::build_attempts(Strategy::RrMemory, 0, &roster, &mut c, &mut rr, Instant::now());
        assert!(rr.wrapped || rr.pos == 1);

        set.retire_all();
        let next = RingSelector::next_cursor(&set);
        assert_eq!(next.pos, 0);
    }

    #[test]
    fn fewest_calls_prefers_the_idle_member() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0)]);
        roster.get("PJSIP/a").unwrap().record_completed_call(Instant::now(), 0);
        let mut c = caller();
        let mut rr = RrCursor::default();
        let set =
            RingSelector::build_attempts(Strategy::FewestCalls, 0, &roster, &mut c, &mut rr, Instant::now());

        let picked = RingSelector::next_candidates(&set, Strategy::FewestCalls);
        assert_eq!(set.get(picked[0]).unwrap().interface(), "PJSIP/b");
    }

    #[test]
    fn least_recent_prefers_never_called_then_oldest() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0), ("PJSIP/c", 0)]);
        let now = Instant::now();
        roster.get("PJSIP/a").unwrap().record_completed_call(now, 0);
        let mut c = caller();
        let mut rr = RrCursor::default();
        let set = RingSelector::build_attempts(Strategy::LeastRecent, 0, &roster, &mut c, &mut rr, now);

        // b and c never called: metric 0. a just called: ~1M.
        let picked = RingSelector::next_candidates(&set, Strategy::LeastRecent);
        assert_ne!(set.get(picked[0]).unwrap().interface(), "PJSIP/a");
    }

    #[test]
    fn penalty_window_gate_excludes_members_only_when_penalties_apply() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 8)]);
        let mut c = caller();
        c.window = PenaltyWindow { min: None, max: Some(5) };
        let mut rr = RrCursor::default();

        // Limit 1 with 2 members: penalties in effect, b excluded.
        let set = RingSelector::build_attempts(Strategy::RingAll, 1, &roster, &mut c, &mut rr, Instant::now());
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().interface(), "PJSIP/a");

        // Limit 0 disables penalty handling: both are candidates.
        let set = RingSelector::build_attempts(Strategy::RingAll, 0, &roster, &mut c, &mut rr, Instant::now());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn negative_penalty_always_excluded() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", -1), ("PJSIP/b", 0)]);
        let mut c = caller();
        let mut rr = RrCursor::default();
        let set = RingSelector::build_attempts(Strategy::RingAll, 0, &roster, &mut c, &mut rr, Instant::now());
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().interface(), "PJSIP/b");
    }

    #[test]
    fn already_dialed_interfaces_are_skipped() {
        let (_devices, roster) = roster_with(&[("PJSIP/a", 0), ("PJSIP/b", 0)]);
        let mut c = caller();
        c.note_dialed("PJSIP/a");
        let mut rr = RrCursor::default();
        let set = RingSelector::build_attempts(Strategy::RingAll, 0, &roster, &mut c, &mut rr, Instant::now());
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().interface(), "PJSIP/b");
    }

    #[test]
    fn weighted_random_spread_scales_with_penalty() {
        let (_devices, roster) = roster_with(&[("PJSIP/zero", 0), ("PJSIP/nine", 9)]);
        let mut c = caller();
        let mut rr = RrCursor::default();
        for _ in 0..50 {
            let set = RingSelector::build_attempts(
                Strategy::WeightedRandom,
                0,
                &roster,
                &mut c,
                &mut rr,
                Instant::now(),
            );
            for attempt in set.iter() {
                let cap = if attempt.interface() == "PJSIP/zero" { 1000 } else { 10_000 };
                assert!(attempt.metric < cap);
                assert!(attempt.metric >= 0);
            }
        }
    }
}
