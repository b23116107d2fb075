//! The state manager (C4): the Paxos invariants for all three
//! co-located roles — proposer, acceptor, learner — guarded by one
//! instance lock, as the design notes require.

use crate::codec::ProposalNumber;
use log::warn;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The per-attempt proposer budget (§4.4, combining phase 1 and phase 2
/// into one timeout).
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// The maximum number of archived rounds kept by [`StateManager::begin_new_round`].
const HISTORY_CAPACITY: usize = 100;

/// The lifecycle of the single `Instance` this peer is currently running.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
  Idle,
  Phase1,
  Phase2,
  Decided,
  Failed,
}

/// The proposer's state for the currently active attempt, if any.
#[derive(Clone, Debug, Default)]
pub struct ProposerState {
  pub current_number: Option<ProposalNumber>,
  pub current_value: Option<String>,
  pub promise_set: HashSet<String>,
  pub accept_set: HashSet<String>,
  pub adopted_prior: Option<(ProposalNumber, String)>,
  pub deadline: Option<Instant>,
}

/// The acceptor's state. Persists for the life of the peer process and is
/// never reset by a round change, only overwritten by strictly
/// higher-numbered proposals (§3).
#[derive(Clone, Debug, Default)]
pub struct AcceptorState {
  pub highest_promised: Option<ProposalNumber>,
  pub highest_accepted: Option<ProposalNumber>,
  pub accepted_value: Option<String>,
}

impl AcceptorState {
  /// The invariant from §3 and §8: `highest_accepted <= highest_promised`,
  /// and `accepted_value` is defined iff `highest_accepted` is.
  fn check_invariants(&self) {
    debug_assert!(self.highest_accepted <= self.highest_promised);
    debug_assert_eq!(self.highest_accepted.is_some(), self.accepted_value.is_some());
  }
}

/// The learner's state. Persists for the life of the peer process.
#[derive(Clone, Debug, Default)]
pub struct LearnerState {
  pub decided_number: Option<ProposalNumber>,
  pub decided_value: Option<String>,
  pub accepted_by_number: HashMap<ProposalNumber, (String, HashSet<String>)>,
}

/// One Paxos instance: one phase plus the three role bundles, all
/// protected by a single lock in [`StateManager`].
#[derive(Clone, Debug, Default)]
pub struct Instance {
  pub phase: Phase,
  pub proposer: ProposerState,
  pub acceptor: AcceptorState,
  pub learner: LearnerState,
}

impl Default for Phase {
  fn default() -> Self {
    Phase::Idle
  }
}

/// The result of [`StateManager::start_phase_1`].
#[derive(Debug, Eq, PartialEq)]
pub enum StartPhase1Result {
  Started,
  /// The proposer already has an attempt in flight (or is decided); the
  /// phase named is the one that blocked the new attempt.
  Rejected(Phase),
}

/// The result of [`StateManager::on_promise`].
#[derive(Debug, Eq, PartialEq)]
pub enum PromiseOutcome {
  /// The promise was stale (wrong phase, or a duplicate already counted)
  /// and caused no transition.
  Ignored,
  /// The quorum has not yet been reached.
  Accumulating,
  /// A quorum of promises has been gathered; phase 2 may begin with the
  /// returned value.
  ReadyForPhase2 { number: ProposalNumber, value: String },
}

/// The result of [`StateManager::on_accepted`].
#[derive(Debug, Eq, PartialEq)]
pub enum AcceptedOutcome {
  Ignored,
  Accumulating,
  Decided { number: ProposalNumber, value: String },
}

/// The acceptor's response to a PREPARE message.
#[derive(Debug, Eq, PartialEq)]
pub enum PrepareResponse {
  Promise { prior: Option<(ProposalNumber, String)> },
  Rejected,
}

/// The acceptor's response to an ACCEPT_REQUEST message.
#[derive(Debug, Eq, PartialEq)]
pub enum AcceptResponse {
  Accepted,
  Rejected,
}

/// The result of [`StateManager::on_accepted_observed`].
#[derive(Debug, Eq, PartialEq)]
pub enum LearnOutcome {
  NoChange,
  Decided { number: ProposalNumber, value: String },
}

struct History {
  rounds: HashMap<u64, Instance>,
  order: VecDeque<u64>,
  next_round: u64,
}

impl Default for History {
  fn default() -> Self {
    History { rounds: HashMap::new(), order: VecDeque::new(), next_round: 0 }
  }
}

/// Owns one `Instance` at a time behind a single lock, plus the archived
/// round history used by [`StateManager::begin_new_round`].
pub struct StateManager {
  instance: Mutex<Instance>,
  history: Mutex<History>,
}

impl Default for StateManager {
  fn default() -> Self {
    StateManager::new()
  }
}

impl StateManager {
  #[must_use]
  pub fn new() -> Self {
    StateManager { instance: Mutex::new(Instance::default()), history: Mutex::new(History::default()) }
  }

  #[must_use]
  pub fn phase(&self) -> Phase {
    self.instance.lock().unwrap().phase
  }

  #[must_use]
  pub fn has_learned(&self) -> bool {
    self.instance.lock().unwrap().learner.decided_value.is_some()
  }

  #[must_use]
  pub fn learned_value(&self) -> Option<String> {
    self.instance.lock().unwrap().learner.decided_value.clone()
  }

  #[must_use]
  pub fn acceptor_snapshot(&self) -> AcceptorState {
    self.instance.lock().unwrap().acceptor.clone()
  }

  /// Starts a new phase-1 attempt. Valid only from `IDLE` or `FAILED`.
  pub fn start_phase_1(&self, number: ProposalNumber, value: String) -> StartPhase1Result {
    let mut instance = self.instance.lock().unwrap();
    if instance.phase != Phase::Idle && instance.phase != Phase::Failed {
      return StartPhase1Result::Rejected(instance.phase);
    }

    instance.proposer = ProposerState {
      current_number: Some(number),
      current_value: Some(value),
      promise_set: HashSet::new(),
      accept_set: HashSet::new(),
      adopted_prior: None,
      deadline: Some(Instant::now() + PHASE_TIMEOUT),
    };
    instance.phase = Phase::Phase1;
    StartPhase1Result::Started
  }

  /// Records a PROMISE from `sender`. Adopts `prior` if it is the
  /// numerically highest prior acceptance seen so far (§9's mandated
  /// safety rule, not the teacher's "most recent" rule).
  pub fn on_promise(
    &self,
    sender: &str,
    prior: Option<(ProposalNumber, String)>,
    quorum: usize,
  ) -> PromiseOutcome {
    let mut instance = self.instance.lock().unwrap();
    if instance.phase != Phase::Phase1 {
      return PromiseOutcome::Ignored;
    }

    let was_new = instance.proposer.promise_set.insert(sender.to_string());
    if let Some((prior_number, prior_value)) = &prior {
      let adopt = match &instance.proposer.adopted_prior {
        Some((current_number, _)) => prior_number > current_number,
        None => true,
      };
      if adopt {
        instance.proposer.adopted_prior = Some((*prior_number, prior_value.clone()));
      }
    }

    if !was_new && instance.proposer.promise_set.len() < quorum {
      return PromiseOutcome::Ignored;
    }

    if instance.proposer.promise_set.len() < quorum {
      return PromiseOutcome::Accumulating;
    }

    if let Some((_, adopted_value)) = instance.proposer.adopted_prior.clone() {
      instance.proposer.current_value = Some(adopted_value);
    }
    instance.phase = Phase::Phase2;

    // Safe: `start_phase_1` always sets `current_number`/`current_value`
    // before a transition into `PHASE_1` can occur.
    let number = instance.proposer.current_number.unwrap();
    let value = instance.proposer.current_value.clone().unwrap();
    PromiseOutcome::ReadyForPhase2 { number, value }
  }

  /// Records an ACCEPTED addressed back to this proposer.
  pub fn on_accepted(&self, sender: &str, quorum: usize) -> AcceptedOutcome {
    let mut instance = self.instance.lock().unwrap();
    if instance.phase != Phase::Phase2 {
      return AcceptedOutcome::Ignored;
    }

    instance.proposer.accept_set.insert(sender.to_string());
    if instance.proposer.accept_set.len() < quorum {
      return AcceptedOutcome::Accumulating;
    }

    let number = instance.proposer.current_number.unwrap();
    let value = instance.proposer.current_value.clone().unwrap();
    instance.phase = Phase::Decided;
    instance.learner.decided_number = Some(number);
    instance.learner.decided_value = Some(value.clone());
    AcceptedOutcome::Decided { number, value }
  }

  /// Fails any in-flight proposer attempt whose deadline has elapsed.
  /// Intended to be polled by the scheduled-timer thread.
  pub fn check_timeout(&self) -> bool {
    let mut instance = self.instance.lock().unwrap();
    if !matches!(instance.phase, Phase::Phase1 | Phase::Phase2) {
      return false;
    }
    let elapsed = instance.proposer.deadline.is_some_and(|deadline| Instant::now() >= deadline);
    if elapsed {
      instance.phase = Phase::Failed;
      instance.proposer = ProposerState::default();
    }
    elapsed
  }

  /// The acceptor's reaction to a PREPARE, independent of proposer phase.
  pub fn on_prepare(&self, number: ProposalNumber) -> PrepareResponse {
    let mut instance = self.instance.lock().unwrap();
    let should_promise = match instance.acceptor.highest_promised {
      None => true,
      Some(highest) => number > highest,
    };

    if !should_promise {
      return PrepareResponse::Rejected;
    }

    instance.acceptor.highest_promised = Some(number);
    let prior = instance
      .acceptor
      .highest_accepted
      .zip(instance.acceptor.accepted_value.clone());
    instance.acceptor.check_invariants();
    PrepareResponse::Promise { prior }
  }

  /// The acceptor's reaction to an ACCEPT_REQUEST, independent of proposer
  /// phase.
  pub fn on_accept_request(&self, number: ProposalNumber, value: String) -> AcceptResponse {
    let mut instance = self.instance.lock().unwrap();
    let should_accept = match instance.acceptor.highest_promised {
      None => true,
      Some(highest) => number >= highest,
    };

    if !should_accept {
      return AcceptResponse::Rejected;
    }

    instance.acceptor.highest_promised = Some(number);
    instance.acceptor.highest_accepted = Some(number);
    instance.acceptor.accepted_value = Some(value);
    instance.acceptor.check_invariants();
    AcceptResponse::Accepted
  }

  /// Records an ACCEPTED observed for any reason (addressed to us as
  /// proposer, or overheard via the acceptor's learner-notification
  /// broadcast). This is the path that actually drives learning; a value
  /// is decided as soon as any number reaches a quorum of acceptors.
  pub fn on_accepted_observed(
    &self,
    number: ProposalNumber,
    value: &str,
    acceptor: &str,
    quorum: usize,
  ) -> LearnOutcome {
    let mut instance = self.instance.lock().unwrap();

    let entry = instance
      .learner
      .accepted_by_number
      .entry(number)
      .or_insert_with(|| (value.to_string(), HashSet::new()));

    if entry.0 != value {
      warn!(
        "learner saw two different values accepted under the same proposal number {number}; keeping the first"
      );
    } else {
      entry.1.insert(acceptor.to_string());
    }

    let acceptors = entry.1.len();
    let recorded_value = entry.0.clone();

    if acceptors >= quorum && instance.learner.decided_value.is_none() {
      instance.learner.decided_number = Some(number);
      instance.learner.decided_value = Some(recorded_value.clone());
      if instance.phase != Phase::Decided {
        instance.phase = Phase::Decided;
      }
      return LearnOutcome::Decided { number, value: recorded_value };
    }

    LearnOutcome::NoChange
  }

  /// Force-learns a decision announced via LEARN, if none is recorded yet.
  pub fn on_learn(&self, number: ProposalNumber, value: String) -> bool {
    let mut instance = self.instance.lock().unwrap();
    if instance.learner.decided_value.is_some() {
      return false;
    }
    instance.learner.decided_number = Some(number);
    instance.learner.decided_value = Some(value);
    instance.phase = Phase::Decided;
    true
  }

  /// Clears proposer state and returns to `IDLE`, unless the instance has
  /// already decided. Acceptor and learner state are always preserved.
  pub fn reset(&self) {
    let mut instance = self.instance.lock().unwrap();
    if instance.phase == Phase::Decided {
      return;
    }
    instance.proposer = ProposerState::default();
    instance.phase = Phase::Idle;
  }

  /// Archives the current instance into the capped, LRU-evicted history
  /// map and installs a fresh one. Used only by the multi-decree façade
  /// hook; the single-decree scope never calls this, but it must remain
  /// callable.
  pub fn begin_new_round(&self) -> u64 {
    let archived = {
      let mut instance = self.instance.lock().unwrap();
      std::mem::take(&mut *instance)
    };

    let mut history = self.history.lock().unwrap();
    let round = history.next_round;
    history.next_round += 1;
    history.rounds.insert(round, archived);
    history.order.push_back(round);
    if history.order.len() > HISTORY_CAPACITY {
      if let Some(oldest) = history.order.pop_front() {
        history.rounds.remove(&oldest);
      }
    }

    round
  }

  #[must_use]
  pub fn history_len(&self) -> usize {
    self.history.lock().unwrap().rounds.len()
  }
}
