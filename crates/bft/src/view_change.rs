//! View change component for liveness.
//!
//! A node waits for each anchor before proposing the round that votes on
//! it. If the anchor does not reach strong quorum within the round timeout
//! the node asks for the next view. Once a weak quorum of members asks for
//! the same target, at least one honest node has stalled too: the target
//! view becomes active and the stalled anchor is released, so the committee
//! moves on to the next leader.
//!
//! Views only pace liveness. Leader designation and ordering never depend on
//! them, so two nodes in different views still commit the same prefix.
//!
//! # Exponential Backoff
//!
//! Escalation timeouts double with each consecutive escalation without
//! progress, up to a maximum cap.

use crate::config::BftConfig;
use blockmania_core::ConsensusEvent;
use blockmania_types::{Hash, Message, NodeId, Round, Topology, View};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum multiplier for exponential backoff (2^6 = 64x base timeout).
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Phase of the view-change machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Normal,
    ViewChanging { target: View, since: Duration },
}

/// What a view-change step wants the caller to do.
#[derive(Debug, Default)]
pub struct ViewChangeOutput {
    /// A request to sign and broadcast. Already counted locally.
    pub request: Option<Message>,
    /// Observability events.
    pub events: Vec<ConsensusEvent>,
    /// Set when a new view became active.
    pub adopted: Option<View>,
}

impl ViewChangeOutput {
    fn merge(&mut self, other: ViewChangeOutput) {
        if other.request.is_some() {
            self.request = other.request;
        }
        self.events.extend(other.events);
        if other.adopted.is_some() {
            self.adopted = other.adopted;
        }
    }
}

pub struct ViewChangeState {
    topology: Arc<dyn Topology>,

    round_timeout: Duration,
    escalation_timeout: Duration,
    max_view_spread: u32,
    degraded_after: u32,

    view: View,
    phase: ViewPhase,

    /// Time of last progress.
    last_progress: Duration,

    /// Anchor round the proposal gate is blocked on, and since when.
    awaiting: Option<(Round, Duration)>,

    /// Anchor rounds at or below this no longer block proposals.
    released_through: Round,

    /// Escalations since the last progress.
    escalations: u32,

    /// Whether degraded liveness was already reported this episode.
    degraded_reported: bool,

    /// target view -> requester -> requester's round.
    requests: BTreeMap<View, BTreeMap<NodeId, Round>>,

    now: Duration,
}

impl ViewChangeState {
    pub fn new(topology: Arc<dyn Topology>, config: &BftConfig) -> Self {
        Self {
            topology,
            round_timeout: config.round_timeout,
            escalation_timeout: config.escalation_timeout,
            max_view_spread: config.max_view_spread,
            degraded_after: config.degraded_after_escalations,
            view: View::INITIAL,
            phase: ViewPhase::Normal,
            last_progress: Duration::ZERO,
            awaiting: None,
            released_through: Round::ZERO,
            escalations: 0,
            degraded_reported: false,
            requests: BTreeMap::new(),
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    pub fn is_view_changing(&self) -> bool {
        matches!(self.phase, ViewPhase::ViewChanging { .. })
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// Distinct requesters seen for `target`.
    pub fn request_count(&self, target: View) -> usize {
        self.requests.get(&target).map_or(0, BTreeMap::len)
    }

    /// Current escalation timeout with exponential backoff.
    fn current_escalation_timeout(&self) -> Duration {
        let exponent = self.escalations.min(MAX_BACKOFF_EXPONENT);
        self.escalation_timeout * 2u32.pow(exponent)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Anchor wait
    // ═══════════════════════════════════════════════════════════════════════════

    /// Note that proposing is blocked on the anchor of `round`.
    pub fn await_anchor(&mut self, round: Round) {
        match self.awaiting {
            Some((waiting, _)) if waiting == round => {}
            _ => self.awaiting = Some((round, self.now)),
        }
    }

    /// Whether the anchor of `round` may be skipped.
    pub fn is_released(&self, round: Round) -> bool {
        round <= self.released_through
    }

    /// Progress was made: the awaited anchor arrived, a round advanced or
    /// something committed.
    pub fn on_progress(&mut self) {
        self.last_progress = self.now;
        self.awaiting = None;
        self.escalations = 0;
        self.degraded_reported = false;
        if let ViewPhase::ViewChanging { target, .. } = self.phase {
            debug!(view = %self.view, abandoned = %target, "Progress during view change, back to normal");
            self.phase = ViewPhase::Normal;
        }
    }

    /// Whether the awaited anchor has been missing for a full round timeout.
    pub fn should_change_view(&self) -> bool {
        if self.phase != ViewPhase::Normal {
            return false;
        }
        let Some((round, since)) = self.awaiting else {
            return false;
        };
        if self.is_released(round) {
            return false;
        }
        let started = since.max(self.last_progress);
        self.now.saturating_sub(started) >= self.round_timeout
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timer and requests
    // ═══════════════════════════════════════════════════════════════════════════

    /// Periodic stall check.
    ///
    /// `last_safe` is the hash carried by any request issued, `round` the
    /// local node's current round.
    pub fn on_timer(&mut self, last_safe: Hash, round: Round) -> ViewChangeOutput {
        match self.phase {
            ViewPhase::Normal => {
                if !self.should_change_view() {
                    return ViewChangeOutput::default();
                }
                let target = self.view.next();
                info!(
                    view = %self.view,
                    target = %target,
                    round = %round,
                    awaiting = ?self.awaiting.map(|(r, _)| r),
                    "Anchor stalled, requesting view change"
                );
                self.start_request(target, last_safe, round)
            }
            ViewPhase::ViewChanging { target, since } => {
                let timeout = self.current_escalation_timeout();
                if self.now.saturating_sub(since) < timeout {
                    return ViewChangeOutput::default();
                }
                let escalated = target.next();
                if self.view.distance_to(escalated) > self.max_view_spread {
                    warn!(view = %self.view, target = %target, "View change spread exhausted");
                    self.phase = ViewPhase::ViewChanging {
                        target,
                        since: self.now,
                    };
                    return ViewChangeOutput::default();
                }

                self.escalations += 1;
                warn!(
                    view = %self.view,
                    target = %escalated,
                    escalations = self.escalations,
                    "View change unresolved, escalating"
                );
                let mut output = ViewChangeOutput::default();
                if self.escalations >= self.degraded_after && !self.degraded_reported {
                    self.degraded_reported = true;
                    output.events.push(ConsensusEvent::LivenessDegraded {
                        view: self.view,
                        escalations: self.escalations,
                    });
                }
                output.merge(self.start_request(escalated, last_safe, round));
                output
            }
        }
    }

    fn start_request(&mut self, target: View, last_safe: Hash, round: Round) -> ViewChangeOutput {
        let local = self.topology.local_node_id();
        self.phase = ViewPhase::ViewChanging {
            target,
            since: self.now,
        };

        let mut output = ViewChangeOutput {
            request: Some(Message::view_change(last_safe, local, round, target)),
            events: vec![ConsensusEvent::ViewChangeStarted {
                view: self.view,
                target,
            }],
            adopted: None,
        };
        self.requests.entry(target).or_default().insert(local, round);
        output.merge(self.check_quorum());
        output
    }

    /// Count a verified view-change request from another member.
    pub fn on_request(&mut self, message: &Message) -> ViewChangeOutput {
        let target = message.view();
        if target <= self.view {
            debug!(target = %target, view = %self.view, "Ignoring view change for old view");
            return ViewChangeOutput::default();
        }
        if self.view.distance_to(target) > self.max_view_spread {
            warn!(
                target = %target,
                view = %self.view,
                sender = %message.sender(),
                "Ignoring view change beyond allowed spread"
            );
            return ViewChangeOutput::default();
        }

        self.requests
            .entry(target)
            .or_default()
            .insert(message.sender(), message.round());
        self.check_quorum()
    }

    /// Adopt the highest target with a weak quorum of requesters.
    fn check_quorum(&mut self) -> ViewChangeOutput {
        let threshold = self.topology.weak_quorum();
        let ready = self
            .requests
            .iter()
            .rev()
            .find(|(target, requesters)| **target > self.view && requesters.len() >= threshold)
            .map(|(target, requesters)| (*target, vouched_round(requesters, threshold)));

        match ready {
            Some((target, round)) => self.adopt(target, round),
            None => ViewChangeOutput::default(),
        }
    }

    fn adopt(&mut self, target: View, requested_round: Round) -> ViewChangeOutput {
        let from = self.view;
        let awaited = self.awaiting.map_or(Round::ZERO, |(round, _)| round);
        self.released_through = self.released_through.max(requested_round).max(awaited);

        self.view = target;
        self.phase = ViewPhase::Normal;
        self.last_progress = self.now;
        self.awaiting = None;
        self.escalations = 0;
        self.degraded_reported = false;
        self.requests = self.requests.split_off(&target.next());

        info!(
            from = %from,
            to = %target,
            released_through = %self.released_through,
            "View changed"
        );

        ViewChangeOutput {
            request: None,
            events: vec![ConsensusEvent::ViewChanged { from, to: target }],
            adopted: Some(target),
        }
    }
}

/// The `threshold`-th highest round claimed by the requesters.
///
/// Any `threshold` requesters include an honest one, so a single member
/// claiming an arbitrary round cannot release anchors nobody else stalled on.
fn vouched_round(requesters: &BTreeMap<NodeId, Round>, threshold: usize) -> Round {
    let mut rounds: Vec<Round> = requesters.values().copied().collect();
    rounds.sort_unstable_by(|a, b| b.cmp(a));
    rounds
        .get(threshold.saturating_sub(1))
        .copied()
        .unwrap_or(Round::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockmania_types::StaticTopology;

    fn make_state(local: u64) -> ViewChangeState {
        let topology = StaticTopology::with_size(NodeId(local), 4).unwrap().into_arc();
        let config = BftConfig::new().with_round_timeout(Duration::from_secs(3));
        ViewChangeState::new(topology, &config)
    }

    fn request(sender: u64, round: u64, target: u32) -> Message {
        Message::view_change(Hash::NIL, NodeId(sender), Round(round), View(target))
    }

    #[test]
    fn test_no_view_change_without_awaited_anchor() {
        let mut state = make_state(0);
        state.set_time(Duration::from_secs(100));
        assert!(!state.should_change_view());
        assert!(state.on_timer(Hash::NIL, Round(4)).request.is_none());
    }

    #[test]
    fn test_stall_emits_exactly_one_request() {
        let mut state = make_state(0);
        state.set_time(Duration::from_secs(1));
        state.await_anchor(Round(1));

        state.set_time(Duration::from_millis(3999));
        assert!(state.on_timer(Hash::NIL, Round(1)).request.is_none());

        state.set_time(Duration::from_secs(4));
        let output = state.on_timer(Hash::NIL, Round(1));
        let request = output.request.expect("view change request");
        assert_eq!(request.view(), View(1));
        assert_eq!(request.sender(), NodeId(0));
        assert_eq!(request.round(), Round(1));
        assert_eq!(
            output.events,
            vec![ConsensusEvent::ViewChangeStarted {
                view: View(0),
                target: View(1)
            }]
        );
        assert!(state.is_view_changing());

        // Further ticks before the escalation timeout stay quiet.
        state.set_time(Duration::from_secs(5));
        assert!(state.on_timer(Hash::NIL, Round(1)).request.is_none());
        assert_eq!(state.request_count(View(1)), 1);
    }

    #[test]
    fn test_weak_quorum_adopts_and_releases_anchor() {
        let mut state = make_state(0);
        state.await_anchor(Round(1));
        state.set_time(Duration::from_secs(3));
        state.on_timer(Hash::NIL, Round(1));

        let output = state.on_request(&request(2, 1, 1));
        assert_eq!(output.adopted, Some(View(1)));
        assert_eq!(
            output.events,
            vec![ConsensusEvent::ViewChanged {
                from: View(0),
                to: View(1)
            }]
        );
        assert_eq!(state.view(), View(1));
        assert_eq!(state.phase(), ViewPhase::Normal);
        assert!(state.is_released(Round(1)));
        assert!(!state.is_released(Round(3)));
    }

    #[test]
    fn test_duplicate_requests_count_once() {
        let mut state = make_state(0);
        assert!(state.on_request(&request(2, 1, 1)).adopted.is_none());
        assert!(state.on_request(&request(2, 1, 1)).adopted.is_none());
        assert_eq!(state.request_count(View(1)), 1);
        assert_eq!(state.view(), View(0));
    }

    #[test]
    fn test_adopt_from_normal_releases_requested_round() {
        let mut state = make_state(0);
        state.on_request(&request(1, 3, 1));
        let output = state.on_request(&request(2, 3, 1));
        assert_eq!(output.adopted, Some(View(1)));
        assert!(state.is_released(Round(3)));
    }

    #[test]
    fn test_single_requester_round_cannot_release_later_anchors() {
        let mut state = make_state(0);
        state.await_anchor(Round(1));
        state.set_time(Duration::from_secs(3));
        state.on_timer(Hash::NIL, Round(1));

        let output = state.on_request(&request(3, u64::MAX, 1));
        assert_eq!(output.adopted, Some(View(1)));
        assert!(state.is_released(Round(1)));
        assert!(!state.is_released(Round(3)));
        assert!(!state.is_released(Round(1_000_000_000_000_000_000)));
    }

    #[test]
    fn test_released_round_is_vouched_by_weak_quorum() {
        let mut state = make_state(0);
        state.on_request(&request(1, 9, 1));
        let output = state.on_request(&request(2, 5, 1));
        assert_eq!(output.adopted, Some(View(1)));
        assert!(state.is_released(Round(5)));
        assert!(!state.is_released(Round(7)));
    }

    #[test]
    fn test_old_and_far_targets_ignored() {
        let mut state = make_state(0);
        state.on_request(&request(1, 1, 1));
        state.on_request(&request(2, 1, 1));
        assert_eq!(state.view(), View(1));

        state.on_request(&request(3, 1, 1));
        assert_eq!(state.request_count(View(1)), 0);

        state.on_request(&request(3, 1, 20));
        assert_eq!(state.request_count(View(20)), 0);
    }

    #[test]
    fn test_progress_returns_to_normal() {
        let mut state = make_state(0);
        state.await_anchor(Round(1));
        state.set_time(Duration::from_secs(3));
        state.on_timer(Hash::NIL, Round(1));
        assert!(state.is_view_changing());

        state.on_progress();
        assert_eq!(state.phase(), ViewPhase::Normal);
        assert_eq!(state.view(), View(0));
        assert!(!state.should_change_view());
    }

    #[test]
    fn test_escalation_with_backoff_and_degraded_once() {
        let topology = StaticTopology::with_size(NodeId(0), 4).unwrap().into_arc();
        let config = BftConfig::new()
            .with_round_timeout(Duration::from_secs(1))
            .with_degraded_after_escalations(2);
        let mut state = ViewChangeState::new(topology, &config);

        state.await_anchor(Round(1));
        state.set_time(Duration::from_secs(1));
        assert_eq!(
            state.on_timer(Hash::NIL, Round(1)).request.map(|m| m.view()),
            Some(View(1))
        );

        // First escalation after 2s.
        state.set_time(Duration::from_secs(3));
        let output = state.on_timer(Hash::NIL, Round(1));
        assert_eq!(output.request.map(|m| m.view()), Some(View(2)));
        assert_eq!(state.escalations(), 1);

        // Backoff doubles: nothing at +2s, escalation at +4s.
        state.set_time(Duration::from_secs(5));
        assert!(state.on_timer(Hash::NIL, Round(1)).request.is_none());
        state.set_time(Duration::from_secs(7));
        let output = state.on_timer(Hash::NIL, Round(1));
        assert_eq!(output.request.map(|m| m.view()), Some(View(3)));
        assert!(output.events.contains(&ConsensusEvent::LivenessDegraded {
            view: View(0),
            escalations: 2
        }));

        state.set_time(Duration::from_secs(20));
        let output = state.on_timer(Hash::NIL, Round(1));
        assert!(!output
            .events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::LivenessDegraded { .. })));
    }

    #[test]
    fn test_higher_quorum_cancels_pending_escalation() {
        let mut state = make_state(0);
        state.await_anchor(Round(1));
        state.set_time(Duration::from_secs(3));
        state.on_timer(Hash::NIL, Round(1));

        state.on_request(&request(1, 1, 2));
        let output = state.on_request(&request(2, 1, 2));
        assert_eq!(output.adopted, Some(View(2)));
        assert_eq!(state.phase(), ViewPhase::Normal);
        assert_eq!(state.request_count(View(1)), 0);
    }
}
