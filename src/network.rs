//! The network-behavior model (C3): a pluggable wrapper around the
//! transport's `send` that injects latency, loss, partitions and offline
//! periods according to a named profile, and that publishes a bounded
//! rolling event log and counters.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often the scheduled-timer thread should call [`NetworkBehavior::tick`].
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The four named profiles from the spec's default parameter table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
  Reliable,
  Latent,
  Failure,
  Standard,
}

impl FromStr for Profile {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "RELIABLE" => Ok(Profile::Reliable),
      "LATENT" => Ok(Profile::Latent),
      "FAILURE" => Ok(Profile::Failure),
      "STANDARD" => Ok(Profile::Standard),
      _ => Err(()),
    }
  }
}

impl fmt::Display for Profile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Profile::Reliable => "reliable",
      Profile::Latent => "latent",
      Profile::Failure => "failure",
      Profile::Standard => "standard",
    };
    write!(f, "{s}")
  }
}

/// The parameter bundle behind a profile (§4.3's default table).
#[derive(Clone, Copy, Debug)]
pub struct ProfileParams {
  pub base_ms: u64,
  pub max_ms: u64,
  pub jitter_ms: u64,
  pub spike_rate: f64,
  pub drop_rate: f64,
  pub conn_fail_rate: f64,
  pub avg_down_ms: u64,
  pub recovery_ms: u64,
  pub stability: f64,
}

const RELIABLE: ProfileParams = ProfileParams {
  base_ms: 0,
  max_ms: 10,
  jitter_ms: 2,
  spike_rate: 0.00,
  drop_rate: 0.00,
  conn_fail_rate: 0.00,
  avg_down_ms: 0,
  recovery_ms: 100,
  stability: 0.99,
};

const LATENT: ProfileParams = ProfileParams {
  base_ms: 800,
  max_ms: 4000,
  jitter_ms: 1200,
  spike_rate: 0.30,
  drop_rate: 0.15,
  conn_fail_rate: 0.05,
  avg_down_ms: 3000,
  recovery_ms: 2000,
  stability: 0.60,
};

const FAILURE: ProfileParams = ProfileParams {
  base_ms: 100,
  max_ms: 1500,
  jitter_ms: 400,
  spike_rate: 0.20,
  drop_rate: 0.35,
  conn_fail_rate: 0.15,
  avg_down_ms: 5000,
  recovery_ms: 1500,
  stability: 0.40,
};

const STANDARD: ProfileParams = ProfileParams {
  base_ms: 30,
  max_ms: 200,
  jitter_ms: 80,
  spike_rate: 0.10,
  drop_rate: 0.05,
  conn_fail_rate: 0.01,
  avg_down_ms: 1000,
  recovery_ms: 500,
  stability: 0.85,
};

impl Profile {
  #[must_use]
  pub fn params(self) -> ProfileParams {
    match self {
      Profile::Reliable => RELIABLE,
      Profile::Latent => LATENT,
      Profile::Failure => FAILURE,
      Profile::Standard => STANDARD,
    }
  }

  /// Whether this profile schedules spontaneous condition transitions on
  /// the periodic tick, independent of per-send draws.
  fn has_spontaneous_transitions(self) -> bool {
    matches!(self, Profile::Latent | Profile::Failure)
  }
}

/// The network-behavior model's current mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Condition {
  Normal,
  Degraded,
  Partitioned,
  Offline,
  Recovering,
}

impl Condition {
  /// `(drop_rate multiplier, latency multiplier)`. `Offline` has no
  /// multiplier because it forces a drop before rates are even consulted.
  fn multipliers(self) -> (f64, f64) {
    match self {
      Condition::Normal => (1.0, 1.0),
      Condition::Degraded => (3.0, 2.0),
      Condition::Partitioned => (5.0, 5.0),
      Condition::Recovering => (2.0, 1.5),
      Condition::Offline => (1.0, 1.0),
    }
  }
}

impl fmt::Display for Condition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Condition::Normal => "NORMAL",
      Condition::Degraded => "DEGRADED",
      Condition::Partitioned => "PARTITIONED",
      Condition::Offline => "OFFLINE",
      Condition::Recovering => "RECOVERING",
    };
    write!(f, "{s}")
  }
}

/// The kind of a logged network event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
  MessageSent,
  MessageDelayed,
  MessageDropped,
  ConnectionFailed,
  ConnectionRecovered,
  PartitionStarted,
  PartitionEnded,
  ConditionChanged,
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      EventKind::MessageSent => "MESSAGE_SENT",
      EventKind::MessageDelayed => "MESSAGE_DELAYED",
      EventKind::MessageDropped => "MESSAGE_DROPPED",
      EventKind::ConnectionFailed => "CONNECTION_FAILED",
      EventKind::ConnectionRecovered => "CONNECTION_RECOVERED",
      EventKind::PartitionStarted => "PARTITION_STARTED",
      EventKind::PartitionEnded => "PARTITION_ENDED",
      EventKind::ConditionChanged => "CONDITION_CHANGED",
    };
    write!(f, "{s}")
  }
}

/// One entry in the rolling event log.
#[derive(Clone, Debug)]
pub struct Event {
  pub at: Instant,
  pub kind: EventKind,
  pub description: String,
}

/// The ring buffer's bounds (§4.3 "Events").
const EVENT_LOG_CAPACITY: usize = 100;
const EVENT_LOG_MAX_AGE: Duration = Duration::from_secs(60);

/// The outcome of a per-send decision.
#[derive(Clone, Debug)]
pub enum NetworkDecision {
  Deliver { latency: Duration },
  Drop { reason: &'static str },
}

/// Cumulative, monotonic send counters.
#[derive(Default)]
struct Counters {
  total_sent: AtomicU64,
  total_lost: AtomicU64,
  total_delay_ms: AtomicU64,
}

/// A snapshot of [`Counters`] for reporting (the `stats`/`metrics` REPL
/// commands).
#[derive(Clone, Copy, Debug)]
pub struct Stats {
  pub total_sent: u64,
  pub total_lost: u64,
  pub total_delay_ms: u64,
  pub loss_rate: f64,
}

struct Scheduled {
  offline_until: Option<Instant>,
  partition_until: Option<Instant>,
  recovery_until: Option<Instant>,
  temporary_improvement_until: Option<Instant>,
  condition_before_improvement: Option<Condition>,
}

impl Default for Scheduled {
  fn default() -> Self {
    Scheduled {
      offline_until: None,
      partition_until: None,
      recovery_until: None,
      temporary_improvement_until: None,
      condition_before_improvement: None,
    }
  }
}

/// The per-peer network-behavior model. One instance wraps one peer's
/// outbound path; it holds no knowledge of message contents, only size and
/// destination.
pub struct NetworkBehavior {
  profile: Mutex<Profile>,
  condition: Mutex<Condition>,
  partitioned_peers: Mutex<HashSet<String>>,
  active: AtomicBool,
  counters: Counters,
  events: Mutex<VecDeque<Event>>,
  rng: Mutex<StdRng>,
  scheduled: Mutex<Scheduled>,
  created_at: Instant,
}

impl NetworkBehavior {
  #[must_use]
  pub fn new(profile: Profile, seed: u64) -> Self {
    NetworkBehavior {
      profile: Mutex::new(profile),
      condition: Mutex::new(Condition::Normal),
      partitioned_peers: Mutex::new(HashSet::new()),
      active: AtomicBool::new(true),
      counters: Counters::default(),
      events: Mutex::new(VecDeque::new()),
      rng: Mutex::new(StdRng::seed_from_u64(seed)),
      scheduled: Mutex::new(Scheduled::default()),
      created_at: Instant::now(),
    }
  }

  #[must_use]
  pub fn profile(&self) -> Profile {
    // The lock can only be poisoned by a prior panic in this module.
    *self.profile.lock().unwrap()
  }

  #[must_use]
  pub fn condition(&self) -> Condition {
    *self.condition.lock().unwrap()
  }

  /// Changes the active profile. Takes effect immediately; transitioning
  /// into `LATENT` has a 30% chance of a 10s "temporary improvement"
  /// window that pins the condition to `NORMAL`.
  pub fn set_profile(&self, profile: Profile) {
    *self.profile.lock().unwrap() = profile;
    self.log(EventKind::ConditionChanged, format!("profile changed to {profile}"));

    if profile == Profile::Latent {
      let roll = self.rng.lock().unwrap().random::<f64>();
      if roll < 0.30 {
        let mut scheduled = self.scheduled.lock().unwrap();
        let mut condition = self.condition.lock().unwrap();
        scheduled.condition_before_improvement = Some(*condition);
        scheduled.temporary_improvement_until = Some(Instant::now() + Duration::from_secs(10));
        *condition = Condition::Normal;
        drop(condition);
        drop(scheduled);
        self.log(
          EventKind::ConditionChanged,
          "temporary improvement window opened".to_string(),
        );
      }
    }
  }

  pub fn stop(&self) {
    self.active.store(false, AtomicOrdering::SeqCst);
  }

  #[must_use]
  pub fn is_active(&self) -> bool {
    self.active.load(AtomicOrdering::SeqCst)
  }

  /// Blocks sends to the given peers for `duration` and enters
  /// `Condition::Partitioned` for that span, so the ×5 drop/latency
  /// multipliers apply to any send that isn't to a partitioned peer.
  pub fn simulate_partition(&self, peers: &[String], duration: Duration) {
    {
      let mut partitioned = self.partitioned_peers.lock().unwrap();
      partitioned.extend(peers.iter().cloned());
    }
    *self.condition.lock().unwrap() = Condition::Partitioned;
    self.scheduled.lock().unwrap().partition_until = Some(Instant::now() + duration);
    self.log(
      EventKind::PartitionStarted,
      format!("partitioned from {}", peers.join(", ")),
    );
  }

  /// Takes the peer fully offline for `duration`, regardless of any
  /// connection-failure draw.
  pub fn simulate_offline(&self, duration: Duration) {
    *self.condition.lock().unwrap() = Condition::Offline;
    self.scheduled.lock().unwrap().offline_until = Some(Instant::now() + duration);
    self.log(EventKind::ConnectionFailed, format!("offline for {duration:?} (simulated)"));
  }

  /// Decides the fate of one outbound message of `size` bytes to `target`.
  /// Ordering follows §4.3 exactly: inactive, then partition, then
  /// offline, then a connection-failure draw, then a drop draw, then
  /// latency.
  pub fn decide(&self, target: &str, size: usize) -> NetworkDecision {
    if !self.is_active() {
      return self.drop_with("inactive");
    }

    if self.partitioned_peers.lock().unwrap().contains(target) {
      return self.drop_with("partition");
    }

    let condition = self.condition();
    if condition == Condition::Offline {
      return self.drop_with("offline");
    }

    let params = self.profile().params();
    let (drop_mult, latency_mult) = condition.multipliers();

    let conn_fail_roll = self.rng.lock().unwrap().random::<f64>();
    if conn_fail_roll < params.conn_fail_rate {
      let extra = if params.avg_down_ms == 0 {
        0
      } else {
        self.rng.lock().unwrap().random_range(0..=params.avg_down_ms)
      };
      let down_for = Duration::from_millis(params.avg_down_ms + extra);
      *self.condition.lock().unwrap() = Condition::Offline;
      self.scheduled.lock().unwrap().offline_until = Some(Instant::now() + down_for);
      self.log(
        EventKind::ConnectionFailed,
        format!("connection to {target} failed, down for {down_for:?}"),
      );
      return self.drop_with("connection failure");
    }

    let adjusted_drop_rate = (params.drop_rate * drop_mult).min(1.0);
    let drop_roll = self.rng.lock().unwrap().random::<f64>();
    if drop_roll < adjusted_drop_rate {
      return self.drop_with("message dropped");
    }

    let latency = self.compute_latency(&params, latency_mult, size);
    self.counters.total_sent.fetch_add(1, AtomicOrdering::Relaxed);
    self
      .counters
      .total_delay_ms
      .fetch_add(latency.as_millis() as u64, AtomicOrdering::Relaxed);

    let kind = if latency.is_zero() { EventKind::MessageSent } else { EventKind::MessageDelayed };
    self.log(kind, format!("to {target}: {latency:?}"));

    NetworkDecision::Deliver { latency }
  }

  fn compute_latency(&self, params: &ProfileParams, latency_mult: f64, size: usize) -> Duration {
    let mut rng = self.rng.lock().unwrap();

    let base = if rng.random::<f64>() < params.spike_rate {
      if params.max_ms > params.base_ms {
        rng.random_range(params.base_ms..=params.max_ms)
      } else {
        params.base_ms
      }
    } else {
      params.base_ms
    };

    let jitter = if params.jitter_ms == 0 {
      0i64
    } else {
      // `i64` comfortably holds a millisecond jitter bound of any profile.
      rng.random_range(-(params.jitter_ms as i64)..=(params.jitter_ms as i64))
    };
    drop(rng);

    // `size / 100` mirrors the spec's size-dependent term, in milliseconds.
    let size_term = (size / 100) as i64;
    let raw = base as i64 + jitter + size_term;
    let scaled = (raw.max(0) as f64) * latency_mult;
    Duration::from_millis(scaled.max(0.0) as u64)
  }

  fn drop_with(&self, reason: &'static str) -> NetworkDecision {
    self.counters.total_sent.fetch_add(1, AtomicOrdering::Relaxed);
    self.counters.total_lost.fetch_add(1, AtomicOrdering::Relaxed);
    self.log(EventKind::MessageDropped, reason.to_string());
    NetworkDecision::Drop { reason }
  }

  fn log(&self, kind: EventKind, description: String) {
    let mut events = self.events.lock().unwrap();
    events.push_back(Event { at: Instant::now(), kind, description });
    prune_events(&mut events);
  }

  #[must_use]
  pub fn stats(&self) -> Stats {
    let total_sent = self.counters.total_sent.load(AtomicOrdering::Relaxed);
    let total_lost = self.counters.total_lost.load(AtomicOrdering::Relaxed);
    let total_delay_ms = self.counters.total_delay_ms.load(AtomicOrdering::Relaxed);
    let loss_rate = if total_sent == 0 { 0.0 } else { total_lost as f64 / total_sent as f64 };
    Stats { total_sent, total_lost, total_delay_ms, loss_rate }
  }

  /// Returns the most recent `n` events, oldest first.
  #[must_use]
  pub fn recent_events(&self, n: usize) -> Vec<Event> {
    let events = self.events.lock().unwrap();
    let skip = events.len().saturating_sub(n);
    events.iter().skip(skip).cloned().collect()
  }

  /// Drives all time-based transitions: partition/offline/temporary
  /// improvement expirations, the recovery backstop, and (for LATENT and
  /// FAILURE profiles) spontaneous condition drift. Intended to be called
  /// regularly by the scheduled-timer thread.
  pub fn tick(&self) {
    let now = Instant::now();
    let mut scheduled = self.scheduled.lock().unwrap();

    if let Some(until) = scheduled.partition_until {
      if now >= until {
        scheduled.partition_until = None;
        self.partitioned_peers.lock().unwrap().clear();
        let resolved = self.resolve_downtime_end(now, &mut scheduled);
        drop(scheduled);
        self.log(EventKind::PartitionEnded, format!("partition lifted, condition is {resolved}"));
        scheduled = self.scheduled.lock().unwrap();
      }
    }

    if let Some(until) = scheduled.offline_until {
      if now >= until {
        scheduled.offline_until = None;
        let resolved = self.resolve_downtime_end(now, &mut scheduled);
        drop(scheduled);
        self.log(EventKind::ConnectionRecovered, format!("came back online as {resolved}"));
        scheduled = self.scheduled.lock().unwrap();
      }
    }

    if let Some(until) = scheduled.recovery_until {
      if now >= until {
        scheduled.recovery_until = None;
        let mut condition = self.condition.lock().unwrap();
        if *condition == Condition::Degraded || *condition == Condition::Recovering {
          *condition = Condition::Normal;
          drop(condition);
          drop(scheduled);
          self.log(EventKind::ConditionChanged, "recovery complete, condition is NORMAL".to_string());
          scheduled = self.scheduled.lock().unwrap();
        }
      }
    }

    if let Some(until) = scheduled.temporary_improvement_until {
      if now >= until {
        scheduled.temporary_improvement_until = None;
        if let Some(prior) = scheduled.condition_before_improvement.take() {
          *self.condition.lock().unwrap() = prior;
          drop(scheduled);
          self.log(EventKind::ConditionChanged, format!("temporary improvement elapsed, restored {prior}"));
          scheduled = self.scheduled.lock().unwrap();
        }
      }
    }

    drop(scheduled);

    let profile = self.profile();
    if profile.has_spontaneous_transitions() {
      self.spontaneous_drift(&profile);
    }
  }

  /// Resolves the end of a downtime span (offline or partition): draws
  /// against `stability` to decide between `Recovering` and `Degraded`,
  /// arms the `recovery_ms` backstop that will force `Normal`, and
  /// returns the resolved condition for logging.
  fn resolve_downtime_end(&self, now: Instant, scheduled: &mut Scheduled) -> Condition {
    let params = self.profile().params();
    let roll = self.rng.lock().unwrap().random::<f64>();
    let resolved = if roll < params.stability { Condition::Recovering } else { Condition::Degraded };
    *self.condition.lock().unwrap() = resolved;
    scheduled.recovery_until = Some(now + Duration::from_millis(params.recovery_ms));
    resolved
  }

  /// Spontaneous `NORMAL <-> DEGRADED` drift for profiles prone to it.
  /// The tick interval is short relative to `stability`, so the per-tick
  /// probability is scaled down from the profile's raw rate.
  fn spontaneous_drift(&self, profile: &Profile) {
    let params = profile.params();
    let scale = TICK_INTERVAL.as_secs_f64();
    let mut condition = self.condition.lock().unwrap();
    match *condition {
      Condition::Normal => {
        let roll = self.rng.lock().unwrap().random::<f64>();
        if roll < (1.0 - params.stability) * scale {
          *condition = Condition::Degraded;
          drop(condition);
          self.log(EventKind::ConditionChanged, "drifted to DEGRADED".to_string());
        }
      }
      Condition::Degraded => {
        let roll = self.rng.lock().unwrap().random::<f64>();
        if roll < params.stability * scale {
          *condition = Condition::Normal;
          drop(condition);
          self.log(EventKind::ConditionChanged, "recovered to NORMAL".to_string());
        }
      }
      _ => {}
    }
  }

  #[must_use]
  pub fn age(&self) -> Duration {
    self.created_at.elapsed()
  }
}

fn prune_events(events: &mut VecDeque<Event>) {
  while events.len() > EVENT_LOG_CAPACITY {
    events.pop_front();
  }
  let now = Instant::now();
  while let Some(front) = events.front() {
    if now.duration_since(front.at) > EVENT_LOG_MAX_AGE {
      events.pop_front();
    } else {
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn reliable_profile_almost_never_drops() {
    let net = NetworkBehavior::new(Profile::Reliable, 42);
    let mut delivered = 0;
    for _ in 0..200 {
      if let NetworkDecision::Deliver { .. } = net.decide("M2", 64) {
        delivered += 1;
      }
    }
    assert!(delivered > 190, "expected RELIABLE to deliver nearly everything, got {delivered}/200");
  }

  #[test]
  fn inactive_always_drops() {
    let net = NetworkBehavior::new(Profile::Reliable, 1);
    net.stop();
    match net.decide("M2", 10) {
      NetworkDecision::Drop { reason } => assert_eq!(reason, "inactive"),
      NetworkDecision::Deliver { .. } => panic!("inactive network must not deliver"),
    }
  }

  #[test]
  fn partitioned_peer_always_drops() {
    let net = NetworkBehavior::new(Profile::Reliable, 7);
    net.simulate_partition(&["M3".to_string()], Duration::from_secs(5));
    match net.decide("M3", 10) {
      NetworkDecision::Drop { reason } => assert_eq!(reason, "partition"),
      NetworkDecision::Deliver { .. } => panic!("partitioned peer must not receive"),
    }
    // An unrelated peer is unaffected.
    assert!(matches!(net.decide("M4", 10), NetworkDecision::Deliver { .. } | NetworkDecision::Drop { .. }));
  }

  #[test]
  fn simulate_partition_enters_and_clears_the_partitioned_condition() {
    let net = NetworkBehavior::new(Profile::Reliable, 11);
    net.simulate_partition(&["M3".to_string()], Duration::from_millis(1));
    assert_eq!(net.condition(), Condition::Partitioned);

    thread::sleep(Duration::from_millis(5));
    net.tick();
    assert_ne!(net.condition(), Condition::Partitioned);
  }

  #[test]
  fn stats_track_sent_and_lost() {
    let net = NetworkBehavior::new(Profile::Failure, 99);
    for _ in 0..50 {
      net.decide("M2", 16);
    }
    let stats = net.stats();
    assert_eq!(stats.total_sent, 50);
    assert!(stats.total_lost <= 50);
    assert!((stats.loss_rate - (stats.total_lost as f64 / 50.0)).abs() < f64::EPSILON);
  }

  #[test]
  fn event_log_is_capped() {
    let net = NetworkBehavior::new(Profile::Standard, 3);
    for _ in 0..(EVENT_LOG_CAPACITY * 2) {
      net.decide("M2", 8);
    }
    assert!(net.recent_events(usize::MAX).len() <= EVENT_LOG_CAPACITY);
  }

  #[test]
  fn profile_parses_case_insensitively() {
    assert_eq!("latent".parse::<Profile>().unwrap(), Profile::Latent);
    assert_eq!("LATENT".parse::<Profile>().unwrap(), Profile::Latent);
    assert!("bogus".parse::<Profile>().is_err());
  }
}
