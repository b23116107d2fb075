//! The participant façade (C5): integrates the codec, transport, network
//! model and state manager into the five operations a caller actually
//! drives, plus the embedded conflict resolver and backoff scheduler.
//!
//! Cyclic-reference note: the dispatch loop polls the transport's inbound
//! queue rather than handing the transport a back-reference to the façade,
//! per the design notes' preferred resolution.

use crate::codec::{self, peer_ordinal, MessageKind, PaxosMessage, ProposalNumber};
use crate::config::PeerRecord;
use crate::error::PaxosError;
use crate::network::{NetworkBehavior, NetworkDecision, Profile};
use crate::state::{
  AcceptResponse, AcceptedOutcome, PrepareResponse, PromiseOutcome, StateManager,
};
use crate::transport::{self, Transport};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long the dispatch thread blocks on the inbound queue before
/// re-checking the shutdown flag.
const DISPATCH_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// The sliding window the conflict resolver considers "recent".
const CONFLICT_WINDOW: Duration = Duration::from_secs(10);

/// The threshold past which a conflict is treated as "started well before
/// mine" (strategy 4 of §4.5).
const CONFLICT_STALE_THRESHOLD: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;

/// The outcome of [`Participant::propose`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProposeResult {
  Accepted,
  Rejected { reason: String },
}

/// A verdict from the conflict resolver's ordered strategy list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Verdict {
  Continue,
  Yield,
  Backoff,
}

struct ConflictRecord {
  number: ProposalNumber,
  peer_ordinal: u32,
  first_seen: Instant,
}

/// Tracks recently observed proposal attempts (own and foreign) and decides
/// whether a new attempt should proceed, yield, or back off.
struct ConflictResolver {
  window: Mutex<Vec<ConflictRecord>>,
}

impl ConflictResolver {
  fn new() -> Self {
    ConflictResolver { window: Mutex::new(Vec::new()) }
  }

  fn prune(window: &mut Vec<ConflictRecord>) {
    let now = Instant::now();
    window.retain(|record| now.duration_since(record.first_seen) < CONFLICT_WINDOW);
  }

  /// Records an observed attempt (our own, or one inferred from an inbound
  /// PREPARE/ACCEPT_REQUEST). Refreshes `first_seen` only on first sighting
  /// of a given `(number, peer_ordinal)` pair.
  fn observe(&self, number: ProposalNumber, peer_ordinal: u32) {
    let mut window = self.window.lock().unwrap();
    Self::prune(&mut window);
    if !window.iter().any(|r| r.number == number && r.peer_ordinal == peer_ordinal) {
      window.push(ConflictRecord { number, peer_ordinal, first_seen: Instant::now() });
    }
  }

  #[must_use]
  fn recent_conflict_count(&self) -> usize {
    let mut window = self.window.lock().unwrap();
    Self::prune(&mut window);
    window.len()
  }

  /// Evaluates the ordered strategy list from §4.5 against everything
  /// currently in the window other than the candidate attempt itself.
  fn evaluate(&self, candidate: ProposalNumber, my_ordinal: u32, attempt_started_at: Instant) -> Verdict {
    let mut window = self.window.lock().unwrap();
    Self::prune(&mut window);

    let others: Vec<&ConflictRecord> = window
      .iter()
      .filter(|r| !(r.number == candidate && r.peer_ordinal == my_ordinal))
      .collect();

    if others.iter().any(|r| r.number > candidate) {
      return Verdict::Yield;
    }
    if others.iter().any(|r| r.number == candidate && r.peer_ordinal < my_ordinal) {
      return Verdict::Backoff;
    }
    if others.len() >= 3 {
      return Verdict::Backoff;
    }
    if others
      .iter()
      .any(|r| attempt_started_at.duration_since(r.first_seen) >= CONFLICT_STALE_THRESHOLD)
    {
      return Verdict::Backoff;
    }
    Verdict::Continue
  }
}

struct Backoff {
  current_ms: Mutex<u64>,
}

impl Backoff {
  fn new() -> Self {
    Backoff { current_ms: Mutex::new(INITIAL_BACKOFF_MS) }
  }

  /// `delay = current + U[0, current/2]`, then `current <- min(current *
  /// 1.5, 5000)`.
  fn next_delay(&self, rng: &mut StdRng) -> Duration {
    let mut current = self.current_ms.lock().unwrap();
    let jitter = if *current == 0 { 0 } else { rng.random_range(0..=*current / 2) };
    let delay = *current + jitter;
    *current = ((*current as f64 * 1.5) as u64).min(MAX_BACKOFF_MS);
    Duration::from_millis(delay)
  }

  fn reset(&self) {
    *self.current_ms.lock().unwrap() = INITIAL_BACKOFF_MS;
  }
}

struct PendingRetry {
  due_at: Instant,
  value: String,
}

/// The participant façade. Owns the transport, network model and state
/// manager, and runs the dispatch and scheduled-timer threads.
pub struct Participant {
  self_id: String,
  self_ordinal: u32,
  quorum: usize,
  transport: Arc<Transport>,
  network: Arc<NetworkBehavior>,
  state: Arc<StateManager>,
  conflict_resolver: ConflictResolver,
  backoff: Backoff,
  rng: Mutex<StdRng>,
  local_counter: Mutex<u64>,
  backoff_events: AtomicU64,
  pending_retries: Mutex<Vec<PendingRetry>>,
  shutdown: Arc<AtomicBool>,
  dispatch_handle: Mutex<Option<JoinHandle<()>>>,
  timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Participant {
  /// Binds the transport on `self_id`'s port and spawns the dispatch and
  /// scheduled-timer threads. Returns an `Arc` since both threads need a
  /// shared handle back into the façade.
  pub fn spawn(self_id: &str, peers: &[PeerRecord], seed: u64) -> Result<Arc<Self>, PaxosError> {
    let own_record = peers
      .iter()
      .find(|record| record.peer_id == self_id)
      .ok_or_else(|| PaxosError::Config(format!("`{self_id}` is not a member of this cluster")))?;

    let self_ordinal = peer_ordinal(self_id)?;
    let quorum = peers.len() / 2 + 1;
    let directory = transport::build_directory(peers);
    let transport = Arc::new(Transport::bind(self_id, own_record.port, directory)?);
    let network = Arc::new(NetworkBehavior::new(own_record.profile, seed));
    let state = Arc::new(StateManager::new());

    let participant = Arc::new(Participant {
      self_id: self_id.to_string(),
      self_ordinal,
      quorum,
      transport,
      network,
      state,
      conflict_resolver: ConflictResolver::new(),
      backoff: Backoff::new(),
      rng: Mutex::new(StdRng::seed_from_u64(seed ^ 0xC5)),
      local_counter: Mutex::new(0),
      backoff_events: AtomicU64::new(0),
      pending_retries: Mutex::new(Vec::new()),
      shutdown: Arc::new(AtomicBool::new(false)),
      dispatch_handle: Mutex::new(None),
      timer_handle: Mutex::new(None),
    });

    let dispatch_handle = {
      let participant = Arc::clone(&participant);
      thread::spawn(move || participant.dispatch_loop())
    };
    *participant.dispatch_handle.lock().unwrap() = Some(dispatch_handle);

    let timer_handle = {
      let participant = Arc::clone(&participant);
      thread::spawn(move || participant.timer_loop())
    };
    *participant.timer_handle.lock().unwrap() = Some(timer_handle);

    Ok(participant)
  }

  #[must_use]
  pub fn self_id(&self) -> &str {
    &self.self_id
  }

  #[must_use]
  pub fn quorum(&self) -> usize {
    self.quorum
  }

  #[must_use]
  pub fn network(&self) -> &NetworkBehavior {
    &self.network
  }

  #[must_use]
  pub fn has_learned(&self) -> bool {
    self.state.has_learned()
  }

  #[must_use]
  pub fn learned_value(&self) -> Option<String> {
    self.state.learned_value()
  }

  #[must_use]
  pub fn backoff_count(&self) -> u64 {
    self.backoff_events.load(AtomicOrdering::Relaxed)
  }

  pub fn set_profile(&self, profile: Profile) {
    self.network.set_profile(profile);
  }

  pub fn simulate_partition(&self, peers: &[String], duration: Duration) {
    self.network.simulate_partition(peers, duration);
  }

  pub fn simulate_offline(&self, duration: Duration) {
    self.network.simulate_offline(duration);
  }

  /// Clears proposer state only, as §4.5 specifies.
  pub fn reset(&self) {
    self.state.reset();
  }

  /// Allocates a proposal number, asks the conflict resolver whether to
  /// proceed, and if so starts phase 1 and broadcasts PREPARE.
  pub fn propose(&self, value: &str) -> ProposeResult {
    if value.contains(':') || value.contains('\n') {
      return ProposeResult::Rejected { reason: "value contains forbidden characters".to_string() };
    }
    if self.state.has_learned() {
      return ProposeResult::Rejected { reason: "instance already decided".to_string() };
    }

    let attempt_started_at = Instant::now();
    let candidate = self.next_proposal_number();

    match self.conflict_resolver.evaluate(candidate, self.self_ordinal, attempt_started_at) {
      Verdict::Yield => ProposeResult::Rejected { reason: "yielding to a higher proposal number".to_string() },
      Verdict::Backoff => {
        self.backoff_events.fetch_add(1, AtomicOrdering::Relaxed);
        let delay = self.backoff.next_delay(&mut self.rng.lock().unwrap());
        info!("BACKOFF: deferring proposal of `{value}` by {delay:?} due to contention");
        self.schedule_retry(value, delay);
        ProposeResult::Rejected { reason: format!("backing off due to contention, retrying in {delay:?}") }
      }
      Verdict::Continue => {
        self.conflict_resolver.observe(candidate, self.self_ordinal);
        match self.state.start_phase_1(candidate, value.to_string()) {
          crate::state::StartPhase1Result::Started => {
            debug!("{}: starting phase 1 with {candidate}", self.self_id);
            self.broadcast(PaxosMessage::prepare(&self.self_id, candidate));
            ProposeResult::Accepted
          }
          crate::state::StartPhase1Result::Rejected(phase) => {
            ProposeResult::Rejected { reason: format!("cannot propose while phase is {phase:?}") }
          }
        }
      }
    }
  }

  /// Signals the dispatch and timer threads to stop, closes the transport
  /// and network model, and joins.
  pub fn stop(&self) {
    self.shutdown.store(true, AtomicOrdering::SeqCst);
    self.network.stop();
    self.transport.stop();
    if let Some(handle) = self.dispatch_handle.lock().unwrap().take() {
      let _ = handle.join();
    }
    if let Some(handle) = self.timer_handle.lock().unwrap().take() {
      let _ = handle.join();
    }
  }

  fn next_proposal_number(&self) -> ProposalNumber {
    let mut counter_guard = self.local_counter.lock().unwrap();
    let mut counter = *counter_guard + 1;
    if self.conflict_resolver.recent_conflict_count() > 0 {
      let bump = self.rng.lock().unwrap().random_range(1..=10);
      counter += bump;
    }
    *counter_guard = counter;
    ProposalNumber { counter, peer_ordinal: self.self_ordinal }
  }

  fn schedule_retry(&self, value: &str, delay: Duration) {
    self
      .pending_retries
      .lock()
      .unwrap()
      .push(PendingRetry { due_at: Instant::now() + delay, value: value.to_string() });
  }

  fn dispatch_loop(&self) {
    debug!("{}: dispatch thread started", self.self_id);
    while !self.shutdown.load(AtomicOrdering::SeqCst) {
      if let Some(msg) = self.transport.inbound_timeout(DISPATCH_POLL_TIMEOUT) {
        self.on_inbound(msg);
      }
    }
    debug!("{}: dispatch thread stopped", self.self_id);
  }

  fn timer_loop(&self) {
    debug!("{}: scheduled-timer thread started", self.self_id);
    while !self.shutdown.load(AtomicOrdering::SeqCst) {
      self.network.tick();

      if self.state.check_timeout() {
        warn!("{}: proposal attempt timed out", self.self_id);
      }

      let due: Vec<String> = {
        let mut retries = self.pending_retries.lock().unwrap();
        let now = Instant::now();
        let (due, rest): (Vec<_>, Vec<_>) = retries.drain(..).partition(|r| now >= r.due_at);
        *retries = rest;
        due.into_iter().map(|r| r.value).collect()
      };
      for value in due {
        debug!("{}: retrying deferred proposal of `{value}`", self.self_id);
        let _ = self.propose(&value);
      }

      thread::sleep(crate::network::TICK_INTERVAL);
    }
    debug!("{}: scheduled-timer thread stopped", self.self_id);
  }

  /// Routes one inbound message by kind, applying state transitions and
  /// emitting whatever outbound messages the transition requires.
  fn on_inbound(&self, msg: PaxosMessage) {
    match msg.kind {
      MessageKind::Prepare => {
        self.conflict_resolver.observe(msg.proposal_number, ordinal_of(&msg.sender));
        match self.state.on_prepare(msg.proposal_number) {
          PrepareResponse::Promise { prior } => {
            let reply = PaxosMessage::promise(&self.self_id, msg.proposal_number, prior);
            self.send_to(&msg.sender, reply);
          }
          PrepareResponse::Rejected => {
            debug!("{}: rejected PREPARE {} from {}", self.self_id, msg.proposal_number, msg.sender);
          }
        }
      }
      MessageKind::AcceptRequest => {
        self.conflict_resolver.observe(msg.proposal_number, ordinal_of(&msg.sender));
        let value = msg.proposal_value.clone().unwrap_or_default();
        match self.state.on_accept_request(msg.proposal_number, value.clone()) {
          AcceptResponse::Accepted => {
            let reply = PaxosMessage::accepted(&self.self_id, msg.proposal_number, value.clone());
            self.send_to(&msg.sender, reply.clone());
            self.broadcast(reply);
          }
          AcceptResponse::Rejected => {
            debug!(
              "{}: rejected ACCEPT_REQUEST {} from {}",
              self.self_id, msg.proposal_number, msg.sender
            );
          }
        }
      }
      MessageKind::Promise => {
        if !self.is_known_peer(&msg.sender) {
          return;
        }
        match self.state.on_promise(&msg.sender, msg.prior.clone(), self.quorum) {
          PromiseOutcome::ReadyForPhase2 { number, value } => {
            debug!("{}: quorum of promises for {number}, entering phase 2", self.self_id);
            self.broadcast(PaxosMessage::accept_request(&self.self_id, number, value));
          }
          PromiseOutcome::Accumulating | PromiseOutcome::Ignored => {}
        }
      }
      MessageKind::Accepted => {
        let value = msg.proposal_value.clone().unwrap_or_default();

        if self.is_known_peer(&msg.sender) {
          if let AcceptedOutcome::Decided { number, value } = self.state.on_accepted(&msg.sender, self.quorum) {
            info!("{}: decided {number} = `{value}`", self.self_id);
            self.backoff.reset();
            self.broadcast(PaxosMessage::learn(&self.self_id, number, value));
          }
        }

        if let crate::state::LearnOutcome::Decided { number, value } =
          self.state.on_accepted_observed(msg.proposal_number, &value, &msg.sender, self.quorum)
        {
          info!("{}: learned {number} = `{value}` via observed ACCEPTED", self.self_id);
        }
      }
      MessageKind::Learn => {
        let value = msg.proposal_value.clone().unwrap_or_default();
        if self.state.on_learn(msg.proposal_number, value.clone()) {
          info!("{}: learned {} = `{value}` via LEARN broadcast", self.self_id, msg.proposal_number);
        }
      }
    }
  }

  #[must_use]
  fn is_known_peer(&self, peer: &str) -> bool {
    peer == self.self_id || self.transport.known_peers().iter().any(|known| known == peer)
  }

  fn send_to(&self, target: &str, msg: PaxosMessage) {
    let target = target.to_string();
    let size = codec::serialize(&msg).len();
    match self.network.decide(&target, size) {
      NetworkDecision::Deliver { latency } => {
        let transport = Arc::clone(&self.transport);
        let self_id = self.self_id.clone();
        thread::spawn(move || {
          if !latency.is_zero() {
            thread::sleep(latency);
          }
          if let Err(err) = transport.send(&target, &msg) {
            warn!("{self_id}: send to {target} failed: {err}");
          }
        });
      }
      NetworkDecision::Drop { reason } => {
        debug!("{}: dropped outbound {:?} to {target}: {reason}", self.self_id, msg.kind);
      }
    }
  }

  /// Addresses every member of the cluster, self included — matching
  /// quorum counts against the full membership the way the state manager's
  /// `Q = peers.len() / 2 + 1` expects (see [`Transport::all_peers`]).
  fn broadcast(&self, msg: PaxosMessage) {
    for peer in self.transport.all_peers() {
      self.send_to(&peer, msg.clone());
    }
  }
}

fn ordinal_of(peer_id: &str) -> u32 {
  peer_ordinal(peer_id).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::Profile;

  fn records(specs: &[(&str, u16)]) -> Vec<PeerRecord> {
    specs
      .iter()
      .map(|(id, port)| PeerRecord {
        peer_id: (*id).to_string(),
        host: "127.0.0.1".to_string(),
        port: *port,
        profile: Profile::Reliable,
      })
      .collect()
  }

  #[test]
  fn propose_rejects_values_with_colons() {
    let peers = records(&[("M1", 20001), ("M2", 20002), ("M3", 20003)]);
    let participant = Participant::spawn("M1", &peers, 1).unwrap();
    match participant.propose("bad:value") {
      ProposeResult::Rejected { reason } => assert!(reason.contains("forbidden")),
      ProposeResult::Accepted => panic!("expected rejection"),
    }
    participant.stop();
  }

  #[test]
  fn propose_starts_phase_1_and_broadcasts_prepare() {
    let peers = records(&[("M1", 20011), ("M2", 20012), ("M3", 20013)]);
    let m1 = Participant::spawn("M1", &peers, 2).unwrap();
    let m2 = Participant::spawn("M2", &peers, 3).unwrap();
    let m3 = Participant::spawn("M3", &peers, 4).unwrap();

    assert_eq!(m1.propose("V"), ProposeResult::Accepted);

    // Give the dispatch threads time to exchange PREPARE/PROMISE/ACCEPT.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !m1.has_learned() {
      thread::sleep(Duration::from_millis(50));
    }

    assert!(m1.has_learned());
    assert_eq!(m1.learned_value(), Some("V".to_string()));

    m1.stop();
    m2.stop();
    m3.stop();
  }

  #[test]
  fn second_propose_while_active_is_rejected() {
    let peers = records(&[("M1", 20021), ("M2", 20022), ("M3", 20023)]);
    let participant = Participant::spawn("M1", &peers, 5).unwrap();
    assert_eq!(participant.propose("A"), ProposeResult::Accepted);
    match participant.propose("B") {
      ProposeResult::Rejected { .. } => {}
      ProposeResult::Accepted => panic!("expected the second concurrent proposal to be rejected"),
    }
    participant.stop();
  }

  #[test]
  fn conflict_resolver_yields_to_a_higher_number() {
    let resolver = ConflictResolver::new();
    let higher = ProposalNumber { counter: 9, peer_ordinal: 2 };
    resolver.observe(higher, 2);
    let mine = ProposalNumber { counter: 3, peer_ordinal: 1 };
    assert_eq!(resolver.evaluate(mine, 1, Instant::now()), Verdict::Yield);
  }

  #[test]
  fn conflict_resolver_backs_off_on_many_concurrent_attempts() {
    let resolver = ConflictResolver::new();
    let mine = ProposalNumber { counter: 5, peer_ordinal: 1 };
    for ordinal in [2u32, 3, 4] {
      resolver.observe(ProposalNumber { counter: 5, peer_ordinal: ordinal }, ordinal);
    }
    assert_eq!(resolver.evaluate(mine, 1, Instant::now()), Verdict::Backoff);
  }

  #[test]
  fn conflict_resolver_continues_when_window_is_empty() {
    let resolver = ConflictResolver::new();
    let mine = ProposalNumber { counter: 1, peer_ordinal: 1 };
    assert_eq!(resolver.evaluate(mine, 1, Instant::now()), Verdict::Continue);
  }

  #[test]
  fn backoff_grows_and_resets() {
    let backoff = Backoff::new();
    let mut rng = StdRng::seed_from_u64(1);
    let first = backoff.next_delay(&mut rng);
    let second = backoff.next_delay(&mut rng);
    assert!(second >= first || second.as_millis() >= (INITIAL_BACKOFF_MS as f64 * 1.0) as u128);
    backoff.reset();
    assert_eq!(*backoff.current_ms.lock().unwrap(), INITIAL_BACKOFF_MS);
  }
}
