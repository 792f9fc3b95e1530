//! # Transition Confirmation
//!
//! Debounces boundary crossings. One fix on the far side of a boundary is
//! not evidence of a real transition; a crossing is confirmed only after
//! enough consecutive same-direction observations spread over a minimum
//! elapsed time.
//!
//! ## Per-Zone State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            first inside fix                  policy satisfied           │
//! │  OUTSIDE ─────────────────► CONFIRMING_ENTRY ─────────────────► INSIDE  │
//! │     ▲                                                             │     │
//! │     │        policy satisfied,                 first outside fix  │     │
//! │     │        stale sweep, shutdown,                               │     │
//! │     │        displaced by another entry                           ▼     │
//! │     └──────────────────────────────────────────── CONFIRMING_EXIT       │
//! │                                                                         │
//! │  Confirm when BOTH:                                                     │
//! │    count >= required_count                                              │
//! │    fix.timestamp - first_observed_at >= min_interval                    │
//! │                                                                         │
//! │  The policy is chosen per fix: connected and offline modes can trade    │
//! │  confirmation latency against radio use independently.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Neutral Fixes
//! A fix that agrees with the confirmed state leaves any open candidate
//! untouched. An entering candidate opened by a stray fix therefore keeps
//! its `first_observed_at` until it confirms or the zone's counters are
//! cleared, and a later run of inside fixes may confirm sooner than a fresh
//! run would.
//!
//! ## Exclusivity
//! At most one zone is inside at a time. Confirming an entry into B while A
//! is inside first produces `Exit(A)` at A's last known position, then
//! `Entry(B)`. This is enforced when an entry confirms, not earlier.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventKind;
use crate::geo::{Fix, Position};
use crate::membership::{evaluate, ZoneObservation};
use crate::zone::Zone;

// =============================================================================
// Candidates and Tracks
// =============================================================================

/// Direction of a crossing being debounced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Entering,
    Exiting,
}

/// An open, unconfirmed crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Timestamp of the fix that opened the candidate. Never moves forward.
    pub first_observed_at: DateTime<Utc>,

    /// Same-direction observations so far, including the first.
    pub count: u32,
}

/// Observable phase of a zone, derived from its track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePhase {
    Outside,
    ConfirmingEntry,
    Inside,
    ConfirmingExit,
}

/// Everything persisted per zone: membership flag, both candidates, and the
/// bookkeeping that stale sweep and forced exits rely on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneTrack {
    /// Confirmed inside.
    pub inside: bool,
    pub entering: Option<Candidate>,
    pub exiting: Option<Candidate>,

    /// Instant of the last confirmed or synthesized event for this zone.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Last fix position observed inside this zone while confirmed inside.
    pub last_position: Option<Position>,
}

impl ZoneTrack {
    pub fn phase(&self) -> ZonePhase {
        match (self.inside, self.entering.is_some(), self.exiting.is_some()) {
            (true, _, true) => ZonePhase::ConfirmingExit,
            (true, _, false) => ZonePhase::Inside,
            (false, true, _) => ZonePhase::ConfirmingEntry,
            (false, false, _) => ZonePhase::Outside,
        }
    }

    pub fn clear_candidates(&mut self) {
        self.entering = None;
        self.exiting = None;
    }

    /// True when the track carries nothing worth persisting.
    pub fn is_idle(&self) -> bool {
        !self.inside && self.entering.is_none() && self.exiting.is_none()
    }

    fn advance(&mut self, direction: Direction, at: DateTime<Utc>) -> Candidate {
        let slot = match direction {
            Direction::Entering => &mut self.entering,
            Direction::Exiting => &mut self.exiting,
        };
        let candidate = slot.get_or_insert(Candidate {
            first_observed_at: at,
            count: 0,
        });
        candidate.count = candidate.count.saturating_add(1);
        *candidate
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Thresholds a candidate must meet to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub required_count: u32,
    pub min_interval: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        ConfirmationPolicy {
            required_count: 3,
            min_interval: Duration::minutes(2),
        }
    }
}

impl ConfirmationPolicy {
    pub fn is_satisfied(&self, candidate: &Candidate, now: DateTime<Utc>) -> bool {
        candidate.count >= self.required_count
            && now - candidate.first_observed_at >= self.min_interval
    }
}

/// Connected and offline policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicySet {
    pub online: ConfirmationPolicy,
    pub offline: ConfirmationPolicy,
}

impl PolicySet {
    pub fn select(&self, online: bool) -> &ConfirmationPolicy {
        if online {
            &self.online
        } else {
            &self.offline
        }
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    /// The confirmation policy was satisfied.
    Confirmed,
    /// Forced exit because an entry into `entered` confirmed.
    Displaced { entered: String },
    /// Inside longer than the idle threshold without a confirming exit.
    Stale,
    /// Device shutdown, critical battery, or recovery after a missed one.
    Shutdown,
}

/// A confirmed or synthesized change of membership.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: EventKind,
    pub zone_code: String,
    pub position: Position,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
}

/// Result of feeding the state machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Transitions in the order they must be emitted.
    pub transitions: Vec<Transition>,

    /// Zones whose track changed and must be persisted.
    pub changed: BTreeSet<String>,
}

impl StepOutcome {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.changed.is_empty()
    }
}

// =============================================================================
// Presence State
// =============================================================================

/// Membership and candidate state for every zone the actor has touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceState {
    tracks: BTreeMap<String, ZoneTrack>,
}

impl PresenceState {
    /// Rebuilds the state from persisted tracks.
    pub fn from_tracks(tracks: BTreeMap<String, ZoneTrack>) -> Self {
        PresenceState { tracks }
    }

    pub fn tracks(&self) -> &BTreeMap<String, ZoneTrack> {
        &self.tracks
    }

    pub fn track(&self, zone_code: &str) -> Option<&ZoneTrack> {
        self.tracks.get(zone_code)
    }

    pub fn phase(&self, zone_code: &str) -> ZonePhase {
        self.tracks
            .get(zone_code)
            .map_or(ZonePhase::Outside, ZoneTrack::phase)
    }

    pub fn is_inside(&self, zone_code: &str) -> bool {
        self.tracks.get(zone_code).is_some_and(|t| t.inside)
    }

    /// Codes of every zone currently confirmed inside.
    pub fn inside_zones(&self) -> Vec<String> {
        self.tracks
            .iter()
            .filter(|(_, t)| t.inside)
            .map(|(code, _)| code.clone())
            .collect()
    }

    /// Drops both candidates of one zone. Returns true if any existed.
    pub fn clear_counters(&mut self, zone_code: &str) -> bool {
        match self.tracks.get_mut(zone_code) {
            Some(track) if track.entering.is_some() || track.exiting.is_some() => {
                track.clear_candidates();
                true
            }
            _ => false,
        }
    }

    /// Evaluates `fix` against `zones` and feeds the result through the
    /// state machine.
    pub fn step(&mut self, fix: &Fix, zones: &[Zone], policy: &ConfirmationPolicy) -> StepOutcome {
        let observations = evaluate(fix, zones);
        self.observe(fix, &observations, zones, policy)
    }

    /// Feeds precomputed observations through the state machine.
    pub fn observe(
        &mut self,
        fix: &Fix,
        observations: &[ZoneObservation],
        zones: &[Zone],
        policy: &ConfirmationPolicy,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        let now = fix.timestamp;
        let position = fix.position();

        for obs in observations {
            let track = self.tracks.entry(obs.zone_code.clone()).or_default();

            let direction = match (obs.inside, track.inside) {
                (true, false) => Direction::Entering,
                (false, true) => Direction::Exiting,
                (true, true) => {
                    track.last_position = Some(position);
                    outcome.changed.insert(obs.zone_code.clone());
                    continue;
                }
                (false, false) => continue,
            };

            let candidate = track.advance(direction, now);
            outcome.changed.insert(obs.zone_code.clone());

            if !policy.is_satisfied(&candidate, now) {
                continue;
            }

            match direction {
                Direction::Entering => {
                    self.displace_others(&obs.zone_code, now, zones, &mut outcome);
                    self.confirm(&obs.zone_code, true, position, now);
                    outcome.transitions.push(Transition {
                        kind: EventKind::Entry,
                        zone_code: obs.zone_code.clone(),
                        position,
                        at: now,
                        reason: TransitionReason::Confirmed,
                    });
                }
                Direction::Exiting => {
                    self.confirm(&obs.zone_code, false, position, now);
                    outcome.transitions.push(Transition {
                        kind: EventKind::Exit,
                        zone_code: obs.zone_code.clone(),
                        position,
                        at: now,
                        reason: TransitionReason::Confirmed,
                    });
                }
            }
        }

        outcome
    }

    /// Synthesizes an automatic exit for every zone inside for longer than
    /// `threshold` since its last event. Uses the zone center as position.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>, threshold: Duration, zones: &[Zone]) -> StepOutcome {
        let stale: Vec<String> = self
            .tracks
            .iter()
            .filter(|(_, t)| t.inside)
            .filter(|(_, t)| t.last_event_at.map_or(true, |at| now - at > threshold))
            .map(|(code, _)| code.clone())
            .collect();

        let mut outcome = StepOutcome::default();
        for code in stale {
            let position = zones
                .iter()
                .find(|z| z.code == code)
                .map(Zone::center)
                .or_else(|| self.tracks.get(&code).and_then(|t| t.last_position))
                .unwrap_or_default();

            self.force_out(&code, now);
            outcome.changed.insert(code.clone());
            outcome.transitions.push(Transition {
                kind: EventKind::AutoExit,
                zone_code: code,
                position,
                at: now,
                reason: TransitionReason::Stale,
            });
        }
        outcome
    }

    /// Synthesizes a shutdown exit for every zone inside and clears them.
    pub fn force_exit_all(&mut self, at: DateTime<Utc>, zones: &[Zone]) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        for code in self.inside_zones() {
            let position = self.exit_position(&code, zones);
            self.force_out(&code, at);
            outcome.changed.insert(code.clone());
            outcome.transitions.push(Transition {
                kind: EventKind::ShutdownExit,
                zone_code: code,
                position,
                at,
                reason: TransitionReason::Shutdown,
            });
        }
        outcome
    }

    fn displace_others(
        &mut self,
        entered: &str,
        now: DateTime<Utc>,
        zones: &[Zone],
        outcome: &mut StepOutcome,
    ) {
        let others: Vec<String> = self
            .inside_zones()
            .into_iter()
            .filter(|code| code != entered)
            .collect();

        for code in others {
            let position = self.exit_position(&code, zones);
            self.force_out(&code, now);
            outcome.changed.insert(code.clone());
            outcome.transitions.push(Transition {
                kind: EventKind::Exit,
                zone_code: code,
                position,
                at: now,
                reason: TransitionReason::Displaced {
                    entered: entered.to_string(),
                },
            });
        }
    }

    /// Last known position inside the zone, else the zone center.
    fn exit_position(&self, code: &str, zones: &[Zone]) -> Position {
        self.tracks
            .get(code)
            .and_then(|t| t.last_position)
            .or_else(|| zones.iter().find(|z| z.code == code).map(Zone::center))
            .unwrap_or_default()
    }

    fn confirm(&mut self, code: &str, inside: bool, position: Position, at: DateTime<Utc>) {
        let track = self.tracks.entry(code.to_string()).or_default();
        track.inside = inside;
        track.clear_candidates();
        track.last_event_at = Some(at);
        track.last_position = inside.then_some(position);
    }

    fn force_out(&mut self, code: &str, at: DateTime<Utc>) {
        self.confirm(code, false, Position::default(), at);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_north;
    use proptest::prelude::*;

    fn zone(code: &str, latitude: f64) -> Zone {
        Zone {
            code: code.into(),
            name: format!("Zone {code}"),
            latitude,
            longitude: 0.0,
            radius_m: 100.0,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn fix(zone: &Zone, meters_north: f64, secs: i64) -> Fix {
        Fix::new(
            offset_north(&zone.center(), meters_north),
            5.0,
            t0() + Duration::seconds(secs),
        )
    }

    fn feed(state: &mut PresenceState, zones: &[Zone], fixes: &[Fix]) -> Vec<Transition> {
        let policy = ConfirmationPolicy::default();
        fixes
            .iter()
            .flat_map(|f| state.step(f, zones, &policy).transitions)
            .collect()
    }

    #[test]
    fn test_entry_confirms_after_count_and_interval() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();

        let out = feed(&mut state, &zones, &[fix(&a, 10.0, 0), fix(&a, 10.0, 60)]);
        assert!(out.is_empty());
        assert_eq!(state.phase("A"), ZonePhase::ConfirmingEntry);

        // Third fix but only 90 s elapsed
        let out = feed(&mut state, &zones, &[fix(&a, 10.0, 90)]);
        assert!(out.is_empty());

        let out = feed(&mut state, &zones, &[fix(&a, 10.0, 120)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::Entry);
        assert_eq!(state.phase("A"), ZonePhase::Inside);
        assert!(state.track("A").unwrap().entering.is_none());

        // Staying inside emits nothing more
        let out = feed(&mut state, &zones, &[fix(&a, 20.0, 180), fix(&a, 5.0, 600)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_interval_alone_does_not_confirm() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();

        let out = feed(&mut state, &zones, &[fix(&a, 10.0, 0), fix(&a, 10.0, 3600)]);
        assert!(out.is_empty());
        assert_eq!(state.track("A").unwrap().entering.unwrap().count, 2);
    }

    #[test]
    fn test_single_inside_fix_then_outside_emits_nothing() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();

        let out = feed(
            &mut state,
            &zones,
            &[
                fix(&a, 10.0, 0),
                fix(&a, 500.0, 130),
                fix(&a, 500.0, 260),
                fix(&a, 500.0, 390),
            ],
        );
        assert!(out.is_empty());
        assert!(!state.is_inside("A"));
    }

    #[test]
    fn test_neutral_fix_keeps_open_candidate() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();

        feed(&mut state, &zones, &[fix(&a, 10.0, 0), fix(&a, 500.0, 60)]);
        let candidate = state.track("A").unwrap().entering.unwrap();
        assert_eq!(candidate.count, 1);
        assert_eq!(candidate.first_observed_at, t0());

        // Two more inside fixes much later confirm against the original start
        let out = feed(&mut state, &zones, &[fix(&a, 10.0, 900), fix(&a, 10.0, 960)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::Entry);
    }

    #[test]
    fn test_exit_confirms_and_clears() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();

        feed(
            &mut state,
            &zones,
            &[fix(&a, 10.0, 0), fix(&a, 10.0, 60), fix(&a, 10.0, 120)],
        );
        assert!(state.is_inside("A"));

        let out = feed(&mut state, &zones, &[fix(&a, 300.0, 200)]);
        assert!(out.is_empty());
        assert_eq!(state.phase("A"), ZonePhase::ConfirmingExit);

        let out = feed(&mut state, &zones, &[fix(&a, 300.0, 260), fix(&a, 300.0, 320)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::Exit);
        assert_eq!(state.phase("A"), ZonePhase::Outside);
        assert!(state.track("A").unwrap().last_position.is_none());
    }

    #[test]
    fn test_boundary_fix_counts_as_outside() {
        let a = zone("A", 0.0);
        let observations = vec![ZoneObservation {
            zone_code: "A".into(),
            distance_m: 100.0,
            inside: a.contains_distance(100.0),
        }];
        let mut state = PresenceState::default();
        let policy = ConfirmationPolicy {
            required_count: 1,
            min_interval: Duration::zero(),
        };
        let out = state.observe(&fix(&a, 100.0, 0), &observations, &[a.clone()], &policy);
        assert!(out.transitions.is_empty());
        assert_eq!(state.phase("A"), ZonePhase::Outside);
    }

    #[test]
    fn test_entry_into_b_forces_exit_of_a_first() {
        let a = zone("A", 0.0);
        let b = zone("B", 0.01); // ~1.1 km north
        // B first: on the fix where both could confirm, B's entry is
        // evaluated while A is still inside
        let zones = vec![b.clone(), a.clone()];
        let mut state = PresenceState::default();

        feed(
            &mut state,
            &zones,
            &[fix(&a, 10.0, 0), fix(&a, 20.0, 60), fix(&a, 30.0, 120)],
        );
        assert_eq!(state.inside_zones(), vec!["A".to_string()]);
        let a_last = state.track("A").unwrap().last_position.unwrap();
        let out = feed(
            &mut state,
            &zones,
            &[fix(&b, 0.0, 200), fix(&b, 0.0, 260), fix(&b, 0.0, 320)],
        );

        let kinds: Vec<_> = out.iter().map(|t| (t.kind, t.zone_code.as_str())).collect();
        assert_eq!(
            kinds,
            vec![(EventKind::Exit, "A"), (EventKind::Entry, "B")]
        );
        assert_eq!(out[0].position, a_last);
        assert_eq!(
            out[0].reason,
            TransitionReason::Displaced {
                entered: "B".into()
            }
        );
        assert_eq!(state.inside_zones(), vec!["B".to_string()]);
        assert!(state.track("A").unwrap().exiting.is_none());
    }

    #[test]
    fn test_offline_policy_is_selected_independently() {
        let set = PolicySet {
            online: ConfirmationPolicy::default(),
            offline: ConfirmationPolicy {
                required_count: 5,
                min_interval: Duration::minutes(4),
            },
        };
        assert_eq!(set.select(true).required_count, 3);
        assert_eq!(set.select(false).required_count, 5);
    }

    #[test]
    fn test_stale_sweep_auto_exits_at_center() {
        let a = zone("A", 0.0);
        let zones = vec![a.clone()];
        let mut state = PresenceState::default();
        feed(
            &mut state,
            &zones,
            &[fix(&a, 40.0, 0), fix(&a, 40.0, 60), fix(&a, 40.0, 120)],
        );

        let threshold = Duration::hours(24);
        let early = state.sweep_stale(t0() + Duration::hours(23), threshold, &zones);
        assert!(early.is_empty());

        let late = state.sweep_stale(t0() + Duration::hours(25), threshold, &zones);
        assert_eq!(late.transitions.len(), 1);
        assert_eq!(late.transitions[0].kind, EventKind::AutoExit);
        assert_eq!(late.transitions[0].position, a.center());
        assert!(!state.is_inside("A"));
    }

    #[test]
    fn test_force_exit_all_and_clear_counters() {
        let a = zone("A", 0.0);
        let b = zone("B", 0.01);
        let zones = vec![a.clone(), b.clone()];
        let mut state = PresenceState::default();
        feed(
            &mut state,
            &zones,
            &[fix(&a, 10.0, 0), fix(&a, 10.0, 60), fix(&a, 10.0, 120)],
        );
        feed(&mut state, &zones, &[fix(&b, 0.0, 150)]);
        assert!(state.clear_counters("B"));
        assert!(!state.clear_counters("B"));

        let at = t0() + Duration::seconds(200);
        let out = state.force_exit_all(at, &zones);
        assert_eq!(out.transitions.len(), 1);
        assert_eq!(out.transitions[0].kind, EventKind::ShutdownExit);
        assert_eq!(out.transitions[0].at, at);
        assert!(state.inside_zones().is_empty());

        // Nothing left to force
        assert!(state.force_exit_all(at, &zones).transitions.is_empty());
    }

    proptest! {
        /// Rapid hopping between overlapping and disjoint zones never leaves
        /// two zones inside, and every displacement exit precedes its entry.
        #[test]
        fn prop_hopping_keeps_exclusivity(
            hops in proptest::collection::vec((0usize..4, 0u32..160, 1i64..200), 1..120)
        ) {
            let zones = vec![
                zone("A", 0.0),
                zone("B", 0.0012), // overlaps A by ~70 m
                zone("C", 0.01),
                zone("D", 0.0105), // overlaps C
            ];
            let policy = ConfirmationPolicy {
                required_count: 2,
                min_interval: Duration::seconds(30),
            };
            let mut state = PresenceState::default();
            let mut secs = 0i64;

            for (target, meters, gap) in hops {
                secs += gap;
                let f = fix(&zones[target], meters as f64, secs);
                let out = state.step(&f, &zones, &policy);

                prop_assert!(state.inside_zones().len() <= 1);

                for (i, t) in out.transitions.iter().enumerate() {
                    if let TransitionReason::Displaced { entered } = &t.reason {
                        let entry_at = out.transitions.iter().position(|e| {
                            e.kind == EventKind::Entry && &e.zone_code == entered
                        });
                        prop_assert!(matches!(entry_at, Some(j) if j > i));
                    }
                }
            }
        }
    }
}
