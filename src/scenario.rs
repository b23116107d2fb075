//! The six named scenarios (§4.6, §6). These are driver code, not part of
//! the Paxos core: each one configures this peer's network profile and,
//! where applicable, schedules a partition/offline window and issues a
//! `propose`, then polls for the documented outcome or a generous timeout.

use crate::network::Profile;
use crate::participant::{Participant, ProposeResult};
use log::info;
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScenarioName {
  Ideal,
  HighLatency,
  NetworkPartition,
  MemberFailures,
  RecoveryTest,
  StressTest,
}

impl FromStr for ScenarioName {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "ideal" => Ok(ScenarioName::Ideal),
      "high_latency" => Ok(ScenarioName::HighLatency),
      "network_partition" => Ok(ScenarioName::NetworkPartition),
      "member_failures" => Ok(ScenarioName::MemberFailures),
      "recovery_test" => Ok(ScenarioName::RecoveryTest),
      "stress_test" => Ok(ScenarioName::StressTest),
      _ => Err(()),
    }
  }
}

impl fmt::Display for ScenarioName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ScenarioName::Ideal => "ideal",
      ScenarioName::HighLatency => "high_latency",
      ScenarioName::NetworkPartition => "network_partition",
      ScenarioName::MemberFailures => "member_failures",
      ScenarioName::RecoveryTest => "recovery_test",
      ScenarioName::StressTest => "stress_test",
    };
    write!(f, "{s}")
  }
}

/// What a scenario run produced, as observed from this one peer.
#[derive(Clone, Debug)]
pub struct ScenarioOutcome {
  pub name: ScenarioName,
  pub proposed: Option<ProposeResult>,
  pub learned: bool,
  pub learned_value: Option<String>,
  pub elapsed: Duration,
}

/// Runs the named scenario against this peer. `self_id` decides whether
/// this peer is the scenario's designated proposer.
pub fn run(name: ScenarioName, participant: &Participant, self_id: &str) -> ScenarioOutcome {
  let started = Instant::now();
  let proposed = match name {
    ScenarioName::Ideal => {
      participant.set_profile(Profile::Reliable);
      propose_if_self(participant, self_id, "M5", "M7")
    }
    ScenarioName::HighLatency => {
      participant.set_profile(Profile::Latent);
      propose_if_self(participant, self_id, "M2", "M4")
    }
    ScenarioName::NetworkPartition => {
      let minority = ["M1", "M2", "M3", "M4"].map(str::to_string);
      let majority = ["M5", "M6", "M7", "M8", "M9"].map(str::to_string);
      if minority.contains(&self_id.to_string()) {
        participant.simulate_partition(&majority, Duration::from_secs(20));
      } else if majority.contains(&self_id.to_string()) {
        participant.simulate_partition(&minority, Duration::from_secs(20));
      }
      propose_if_self(participant, self_id, "M6", "M8")
    }
    ScenarioName::MemberFailures => {
      participant.set_profile(Profile::Failure);
      propose_if_self(participant, self_id, "M1", "M1")
    }
    ScenarioName::RecoveryTest => {
      participant.simulate_offline(Duration::from_secs(5));
      None
    }
    ScenarioName::StressTest => {
      participant.set_profile(Profile::Standard);
      propose_if_self(participant, self_id, "M1", "M1").or_else(|| propose_if_self(participant, self_id, "M8", "M8"))
    }
  };

  let budget = match name {
    ScenarioName::Ideal => Duration::from_secs(15),
    ScenarioName::HighLatency => Duration::from_secs(35),
    ScenarioName::NetworkPartition => Duration::from_secs(30),
    ScenarioName::MemberFailures | ScenarioName::StressTest => Duration::from_secs(30),
    ScenarioName::RecoveryTest => Duration::from_secs(10),
  };

  wait_for_learning(participant, budget);

  let outcome = ScenarioOutcome {
    name,
    proposed,
    learned: participant.has_learned(),
    learned_value: participant.learned_value(),
    elapsed: started.elapsed(),
  };
  info!(
    "scenario {} finished after {:?}: learned={} value={:?}",
    outcome.name, outcome.elapsed, outcome.learned, outcome.learned_value
  );
  outcome
}

fn propose_if_self(
  participant: &Participant,
  self_id: &str,
  proposer_id: &str,
  value: &str,
) -> Option<ProposeResult> {
  if self_id == proposer_id {
    Some(participant.propose(value))
  } else {
    None
  }
}

fn wait_for_learning(participant: &Participant, budget: Duration) {
  let deadline = Instant::now() + budget;
  while Instant::now() < deadline && !participant.has_learned() {
    thread::sleep(Duration::from_millis(100));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scenario_name_parses_case_insensitively() {
    assert_eq!("IDEAL".parse::<ScenarioName>().unwrap(), ScenarioName::Ideal);
    assert_eq!("high_latency".parse::<ScenarioName>().unwrap(), ScenarioName::HighLatency);
    assert!("bogus".parse::<ScenarioName>().is_err());
  }

  #[test]
  fn scenario_name_round_trips_through_display() {
    for name in [
      ScenarioName::Ideal,
      ScenarioName::HighLatency,
      ScenarioName::NetworkPartition,
      ScenarioName::MemberFailures,
      ScenarioName::RecoveryTest,
      ScenarioName::StressTest,
    ] {
      assert_eq!(name.to_string().parse::<ScenarioName>().unwrap(), name);
    }
  }
}
