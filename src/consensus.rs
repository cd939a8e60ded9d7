//! Weighted voting rounds
//!
//! A round is resolved after any vote that makes the outcome certain, or
//! lazily once its deadline has passed. At the deadline, voters who never
//! voted count against the proposal (they sit in the denominator), while
//! explicit abstentions are left out of the tally entirely.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::clock::SharedClock;
use crate::config::ConsensusConfig;
use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::types::{AgentId, RoundId};

const EPSILON: f64 = 1e-9;

/// A voter's choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Yes,
    No,
    Abstain,
}

/// Pass condition of a round
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// Weighted yes ratio that must be reached, in `[0, 1]`
    Fraction(f64),
    /// No `No` votes and no absent voters
    Unanimous,
}

/// Final result of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundResult {
    Passed,
    Failed,
    NoQuorum,
}

/// Weighted vote counts of a round
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tally {
    pub yes: f64,
    pub no: f64,
    pub abstain: f64,
    /// Weight of voters who have not voted
    pub absent: f64,
    /// Number of votes cast, abstentions included
    pub cast: usize,
    pub no_votes: usize,
    pub absent_voters: usize,
}

impl Tally {
    /// Yes weight over yes, no and absent weight
    pub fn ratio(&self) -> Option<f64> {
        let denominator = self.yes + self.no + self.absent;
        (denominator > EPSILON).then(|| self.yes / denominator)
    }
}

/// Decides rounds the threshold alone cannot
pub trait TieBreak: Send + Sync + Debug {
    /// Called when the ratio equals the threshold exactly or is undefined
    /// because every cast vote abstained
    fn decide(&self, tally: &Tally, threshold: f64) -> RoundResult;
}

/// Exact ties pass, empty tallies fail
#[derive(Debug, Default, Clone, Copy)]
pub struct InclusiveTieBreak;

impl TieBreak for InclusiveTieBreak {
    fn decide(&self, tally: &Tally, _threshold: f64) -> RoundResult {
        match tally.ratio() {
            Some(_) => RoundResult::Passed,
            None => RoundResult::Failed,
        }
    }
}

/// Anything short of a clear majority keeps the status quo
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusQuoTieBreak;

impl TieBreak for StatusQuoTieBreak {
    fn decide(&self, _tally: &Tally, _threshold: f64) -> RoundResult {
        RoundResult::Failed
    }
}

struct RoundState {
    weights: BTreeMap<AgentId, f64>,
    votes: HashMap<AgentId, Vote>,
    threshold: Threshold,
    deadline: Instant,
    min_participants: usize,
    result: Option<RoundResult>,
    resolved_at: Option<Instant>,
}

impl RoundState {
    fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for (voter, weight) in &self.weights {
            match self.votes.get(voter) {
                Some(Vote::Yes) => tally.yes += weight,
                Some(Vote::No) => {
                    tally.no += weight;
                    tally.no_votes += 1;
                }
                Some(Vote::Abstain) => tally.abstain += weight,
                None => {
                    tally.absent += weight;
                    tally.absent_voters += 1;
                }
            }
        }
        tally.cast = self.votes.len();
        tally
    }

    fn decide_final(&self, tie: &dyn TieBreak) -> RoundResult {
        let tally = self.tally();
        if tally.cast < self.min_participants {
            return RoundResult::NoQuorum;
        }
        match self.threshold {
            Threshold::Unanimous => {
                if tally.no_votes == 0 && tally.absent_voters == 0 {
                    RoundResult::Passed
                } else {
                    RoundResult::Failed
                }
            }
            Threshold::Fraction(t) => match tally.ratio() {
                None => tie.decide(&tally, t),
                Some(r) if (r - t).abs() < EPSILON => tie.decide(&tally, t),
                Some(r) if r > t => RoundResult::Passed,
                Some(_) => RoundResult::Failed,
            },
        }
    }

    /// Result that no remaining vote can change, if any
    fn decide_early(&self, tie: &dyn TieBreak) -> Option<RoundResult> {
        let tally = self.tally();
        if tally.absent_voters == 0 {
            return Some(self.decide_final(tie));
        }
        if tally.cast < self.min_participants {
            return None;
        }
        match self.threshold {
            Threshold::Unanimous => (tally.no_votes > 0).then_some(RoundResult::Failed),
            Threshold::Fraction(t) => {
                let remaining = tally.absent;
                // Everyone left votes no
                let worst = tally.yes / (tally.yes + tally.no + remaining);
                if worst > t + EPSILON {
                    return Some(RoundResult::Passed);
                }
                // Everyone left votes yes, or everyone left abstains
                let all_yes = (tally.yes + remaining) / (tally.yes + tally.no + remaining);
                let all_abstain = if tally.yes + tally.no > EPSILON {
                    tally.yes / (tally.yes + tally.no)
                } else {
                    0.0
                };
                if all_yes.max(all_abstain) < t - EPSILON {
                    return Some(RoundResult::Failed);
                }
                None
            }
        }
    }
}

struct RoundEntry {
    id: RoundId,
    state: Mutex<RoundState>,
    result_tx: watch::Sender<Option<RoundResult>>,
}

/// Opens rounds, records votes and resolves results
pub struct ConsensusEngine {
    config: ConsensusConfig,
    clock: SharedClock,
    events: EventLog,
    tie_break: Arc<dyn TieBreak>,
    rounds: RwLock<HashMap<RoundId, Arc<RoundEntry>>>,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig, clock: SharedClock, events: EventLog) -> Self {
        Self::with_tie_break(config, clock, events, Arc::new(InclusiveTieBreak))
    }

    pub fn with_tie_break(
        config: ConsensusConfig,
        clock: SharedClock,
        events: EventLog,
        tie_break: Arc<dyn TieBreak>,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            tie_break,
            rounds: RwLock::new(HashMap::new()),
        }
    }

    /// Open a round; `voters` pairs each agent with its weight
    #[instrument(skip(self, proposal, voters))]
    pub fn propose<I>(
        &self,
        proposal: Value,
        voters: I,
        threshold: Threshold,
        ttl: Duration,
    ) -> Result<RoundId>
    where
        I: IntoIterator<Item = (AgentId, f64)>,
    {
        let weights: BTreeMap<AgentId, f64> = voters.into_iter().collect();
        if weights.is_empty() {
            return Err(ConclaveError::InvalidArgument("a round needs voters".into()));
        }
        if weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConclaveError::InvalidArgument(
                "voter weights must be finite and non-negative".into(),
            ));
        }
        if let Threshold::Fraction(t) = threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConclaveError::InvalidArgument(format!(
                    "threshold {t} is outside [0, 1]"
                )));
            }
        }

        self.sweep();

        let id = RoundId::new();
        let (result_tx, _) = watch::channel(None);
        let entry = RoundEntry {
            id,
            state: Mutex::new(RoundState {
                weights,
                votes: HashMap::new(),
                threshold,
                deadline: self.clock.now() + ttl,
                min_participants: self.config.min_participants,
                result: None,
                resolved_at: None,
            }),
            result_tx,
        };
        self.rounds.write().insert(id, Arc::new(entry));
        info!(round_id = %id, ?threshold, "Consensus round opened");
        self.events.append(Event::ConsensusOpened {
            round_id: id,
            proposal,
        });
        Ok(id)
    }

    /// Resolve rounds past their deadline and drop those resolved longer
    /// than the retention period ago
    fn sweep(&self) {
        let now = self.clock.now();
        let retention = self.config.resolved_retention;
        let mut rounds = self.rounds.write();
        let before = rounds.len();
        rounds.retain(|_, entry| {
            let entry: &RoundEntry = entry;
            let mut state = entry.state.lock();
            self.resolve_if_expired(entry, &mut state);
            !state
                .resolved_at
                .is_some_and(|at| now.saturating_duration_since(at) > retention)
        });
        let dropped = before - rounds.len();
        if dropped > 0 {
            debug!(dropped, "Dropped resolved consensus rounds");
        }
    }

    fn entry(&self, round: &RoundId) -> Result<Arc<RoundEntry>> {
        self.rounds
            .read()
            .get(round)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownResource(format!("round {round}")))
    }

    fn resolve(&self, entry: &RoundEntry, state: &mut RoundState, result: RoundResult) {
        state.result = Some(result);
        state.resolved_at = Some(self.clock.now());
        entry.result_tx.send_replace(Some(result));
        info!(round_id = %entry.id, ?result, "Consensus round resolved");
        self.events.append(Event::ConsensusResolved {
            round_id: entry.id,
            result,
        });
    }

    fn resolve_if_expired(&self, entry: &RoundEntry, state: &mut RoundState) {
        if state.result.is_none() && self.clock.now() >= state.deadline {
            let result = state.decide_final(self.tie_break.as_ref());
            self.resolve(entry, state, result);
        }
    }

    /// Record a vote (last write wins); returns the result if this vote settled it
    pub fn vote(&self, round: RoundId, voter: AgentId, choice: Vote) -> Result<Option<RoundResult>> {
        let entry = self.entry(&round)?;
        let mut state = entry.state.lock();
        self.resolve_if_expired(&entry, &mut state);

        if state.result.is_some() {
            return Err(ConclaveError::RoundClosed(round));
        }
        if !state.weights.contains_key(&voter) {
            return Err(ConclaveError::InvalidArgument(format!(
                "agent {voter} is not a voter in round {round}"
            )));
        }

        state.votes.insert(voter, choice);
        debug!(round_id = %round, agent_id = %voter, ?choice, "Vote recorded");

        if let Some(result) = state.decide_early(self.tie_break.as_ref()) {
            self.resolve(&entry, &mut state, result);
        }
        Ok(state.result)
    }

    /// Result so far, resolving the round if its deadline passed
    pub fn outcome(&self, round: RoundId) -> Result<Option<RoundResult>> {
        let entry = self.entry(&round)?;
        let mut state = entry.state.lock();
        self.resolve_if_expired(&entry, &mut state);
        Ok(state.result)
    }

    /// Current weighted counts
    pub fn tally(&self, round: RoundId) -> Result<Tally> {
        Ok(self.entry(&round)?.state.lock().tally())
    }

    /// Wait for the round to resolve
    pub async fn await_outcome(&self, round: RoundId) -> Result<RoundResult> {
        let entry = self.entry(&round)?;
        let mut rx = entry.result_tx.subscribe();
        loop {
            let remaining = {
                let mut state = entry.state.lock();
                self.resolve_if_expired(&entry, &mut state);
                if let Some(result) = state.result {
                    return Ok(result);
                }
                state.deadline.saturating_duration_since(self.clock.now())
            };

            // Measured on the injected clock, so an unresolved round always
            // has time left here
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = rx.changed() => {}
            }
        }
    }

    /// Drop a resolved round
    pub fn forget(&self, round: &RoundId) -> bool {
        let mut rounds = self.rounds.write();
        let resolved = rounds
            .get(round)
            .is_some_and(|e| e.state.lock().result.is_some());
        if resolved {
            rounds.remove(round);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use serde_json::json;

    fn engine(min_participants: usize) -> ConsensusEngine {
        ConsensusEngine::new(
            ConsensusConfig::new(min_participants),
            SystemClock::shared(),
            EventLog::new(64),
        )
    }

    fn agents(n: usize) -> Vec<AgentId> {
        (0..n).map(|_| AgentId::new()).collect()
    }

    const TTL: Duration = Duration::from_secs(30);

    // === Weighted tally ===

    #[test]
    fn test_weighted_round_passes() {
        let engine = engine(3);
        let v = agents(3);
        let round = engine
            .propose(
                json!("deploy"),
                [(v[0], 3.0), (v[1], 2.0), (v[2], 1.0)],
                Threshold::Fraction(0.66),
                TTL,
            )
            .unwrap();

        assert_eq!(engine.vote(round, v[0], Vote::Yes).unwrap(), None);
        assert_eq!(engine.vote(round, v[1], Vote::Yes).unwrap(), None);
        assert_eq!(
            engine.vote(round, v[2], Vote::No).unwrap(),
            Some(RoundResult::Passed)
        );
        let ratio = engine.tally(round).unwrap().ratio().unwrap();
        assert!((ratio - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_unanimous_fails_on_single_no() {
        let engine = engine(1);
        let v = agents(4);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Unanimous, TTL)
            .unwrap();

        engine.vote(round, v[0], Vote::Yes).unwrap();
        engine.vote(round, v[1], Vote::Yes).unwrap();
        assert_eq!(
            engine.vote(round, v[2], Vote::No).unwrap(),
            Some(RoundResult::Failed)
        );
        assert!(matches!(
            engine.vote(round, v[3], Vote::Yes),
            Err(ConclaveError::RoundClosed(_))
        ));
    }

    #[test]
    fn test_unanimous_passes_with_abstention() {
        let engine = engine(2);
        let v = agents(2);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Unanimous, TTL)
            .unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();
        assert_eq!(
            engine.vote(round, v[1], Vote::Abstain).unwrap(),
            Some(RoundResult::Passed)
        );
    }

    #[test]
    fn test_abstentions_leave_denominator() {
        let engine = engine(1);
        let v = agents(3);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Fraction(0.6), TTL)
            .unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();
        engine.vote(round, v[1], Vote::Abstain).unwrap();
        // 1 yes / (1 yes + 1 no) = 0.5 < 0.6
        assert_eq!(
            engine.vote(round, v[2], Vote::No).unwrap(),
            Some(RoundResult::Failed)
        );
    }

    #[test]
    fn test_last_vote_wins() {
        let engine = engine(1);
        let v = agents(2);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Fraction(0.5), TTL)
            .unwrap();
        engine.vote(round, v[0], Vote::No).unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();
        let tally = engine.tally(round).unwrap();
        assert_eq!(tally.yes, 1.0);
        assert_eq!(tally.no, 0.0);
        assert_eq!(tally.cast, 1);
    }

    #[test]
    fn test_early_pass_when_outcome_is_certain() {
        let engine = engine(1);
        let v = agents(3);
        let round = engine
            .propose(
                json!(1),
                [(v[0], 5.0), (v[1], 1.0), (v[2], 1.0)],
                Threshold::Fraction(0.7),
                TTL,
            )
            .unwrap();
        // 5 / 7 > 0.7 even if both others vote no
        assert_eq!(
            engine.vote(round, v[0], Vote::Yes).unwrap(),
            Some(RoundResult::Passed)
        );
    }

    // === Tie-breaking ===

    #[test]
    fn test_exact_threshold_tie_strategies() {
        let v = agents(2);
        let voters = [(v[0], 1.0), (v[1], 1.0)];

        let inclusive = engine(2);
        let round = inclusive
            .propose(json!(1), voters, Threshold::Fraction(0.5), TTL)
            .unwrap();
        inclusive.vote(round, v[0], Vote::Yes).unwrap();
        assert_eq!(
            inclusive.vote(round, v[1], Vote::No).unwrap(),
            Some(RoundResult::Passed)
        );

        let status_quo = ConsensusEngine::with_tie_break(
            ConsensusConfig::new(2),
            SystemClock::shared(),
            EventLog::new(8),
            Arc::new(StatusQuoTieBreak),
        );
        let round = status_quo
            .propose(json!(1), voters, Threshold::Fraction(0.5), TTL)
            .unwrap();
        status_quo.vote(round, v[0], Vote::Yes).unwrap();
        assert_eq!(
            status_quo.vote(round, v[1], Vote::No).unwrap(),
            Some(RoundResult::Failed)
        );
    }

    // === Deadline ===

    #[test]
    fn test_deadline_without_quorum() {
        let clock = Arc::new(ManualClock::new());
        let engine = ConsensusEngine::new(
            ConsensusConfig::new(2),
            clock.clone(),
            EventLog::new(8),
        );
        let v = agents(3);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Fraction(0.5), TTL)
            .unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();
        assert_eq!(engine.outcome(round).unwrap(), None);

        clock.advance(TTL);
        assert_eq!(engine.outcome(round).unwrap(), Some(RoundResult::NoQuorum));
        assert!(matches!(
            engine.vote(round, v[1], Vote::Yes),
            Err(ConclaveError::RoundClosed(_))
        ));
    }

    #[test]
    fn test_absent_voters_count_against_at_deadline() {
        let clock = Arc::new(ManualClock::new());
        let engine = ConsensusEngine::new(
            ConsensusConfig::new(2),
            clock.clone(),
            EventLog::new(8),
        );
        let v = agents(4);
        let round = engine
            .propose(json!(1), v.iter().map(|a| (*a, 1.0)), Threshold::Fraction(0.6), TTL)
            .unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();
        engine.vote(round, v[1], Vote::Yes).unwrap();

        clock.advance(TTL);
        // 2 yes / (2 yes + 2 absent) = 0.5
        assert_eq!(engine.outcome(round).unwrap(), Some(RoundResult::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_outcome_resolves_at_deadline() {
        let engine = Arc::new(engine(1));
        let v = agents(2);
        let round = engine
            .propose(
                json!(1),
                v.iter().map(|a| (*a, 1.0)),
                Threshold::Fraction(0.5),
                Duration::from_secs(5),
            )
            .unwrap();
        engine.vote(round, v[0], Vote::Yes).unwrap();

        let result = engine.await_outcome(round).await.unwrap();
        assert_eq!(result, RoundResult::Passed);
        assert!(engine.forget(&round));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_outcome_follows_injected_clock() {
        let clock = Arc::new(ManualClock::new());
        let engine = Arc::new(ConsensusEngine::new(
            ConsensusConfig::new(1),
            clock.clone(),
            EventLog::new(64),
        ));
        let v = agents(1);
        let round = engine
            .propose(json!(1), [(v[0], 1.0)], Threshold::Unanimous, Duration::from_secs(5))
            .unwrap();

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.await_outcome(round).await })
        };
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!waiter.is_finished());

        clock.advance(Duration::from_secs(5));
        assert_eq!(waiter.await.unwrap().unwrap(), RoundResult::NoQuorum);
    }

    #[test]
    fn test_resolved_rounds_are_dropped_after_retention() {
        let clock = Arc::new(ManualClock::new());
        let events = EventLog::new(64);
        let config = ConsensusConfig {
            resolved_retention: Duration::from_secs(60),
            ..ConsensusConfig::new(1)
        };
        let engine = ConsensusEngine::new(config, clock.clone(), events.clone());
        let v = agents(1);

        let decided = engine
            .propose(json!("decided"), [(v[0], 1.0)], Threshold::Unanimous, TTL)
            .unwrap();
        engine.vote(decided, v[0], Vote::Yes).unwrap();
        let expired = engine
            .propose(json!("expired"), [(v[0], 1.0)], Threshold::Unanimous, TTL)
            .unwrap();
        assert!(events.records().iter().any(|r| matches!(
            &r.event,
            Event::ConsensusOpened { round_id, proposal } if *round_id == decided && *proposal == json!("decided")
        )));

        clock.advance(TTL);
        engine.propose(json!("next"), [(v[0], 1.0)], Threshold::Unanimous, TTL).unwrap();
        assert_eq!(engine.outcome(decided).unwrap(), Some(RoundResult::Passed));
        assert_eq!(engine.outcome(expired).unwrap(), Some(RoundResult::NoQuorum));

        clock.advance(Duration::from_secs(61));
        engine.propose(json!("later"), [(v[0], 1.0)], Threshold::Unanimous, TTL).unwrap();
        assert!(matches!(
            engine.outcome(decided),
            Err(ConclaveError::UnknownResource(_))
        ));
        assert!(matches!(
            engine.outcome(expired),
            Err(ConclaveError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_await_outcome_wakes_on_vote() {
        let engine = Arc::new(engine(1));
        let v = agents(1);
        let round = engine
            .propose(json!(1), [(v[0], 1.0)], Threshold::Unanimous, TTL)
            .unwrap();

        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.await_outcome(round).await })
        };
        tokio::task::yield_now().await;
        engine.vote(round, v[0], Vote::Yes).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), RoundResult::Passed);
    }

    #[test]
    fn test_rejects_non_voters_and_bad_thresholds() {
        let engine = engine(1);
        let v = agents(1);
        assert!(engine
            .propose(json!(1), [(v[0], 1.0)], Threshold::Fraction(1.5), TTL)
            .is_err());
        let round = engine
            .propose(json!(1), [(v[0], 1.0)], Threshold::Fraction(0.5), TTL)
            .unwrap();
        assert!(matches!(
            engine.vote(round, AgentId::new(), Vote::Yes),
            Err(ConclaveError::InvalidArgument(_))
        ));
    }
}
