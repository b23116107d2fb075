//! End-to-end scenario tests (spec §8) exercising a small real cluster of
//! participants talking over loopback TCP. Ports are spread out per test to
//! avoid collisions when the suite runs in parallel.

use paxos_sim::config::PeerRecord;
use paxos_sim::network::Profile;
use paxos_sim::participant::{Participant, ProposeResult};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn cluster(base_port: u16, count: u16, profile: Profile) -> Vec<PeerRecord> {
  (1..=count)
    .map(|i| PeerRecord {
      peer_id: format!("M{i}"),
      host: "127.0.0.1".to_string(),
      port: base_port + i,
      profile,
    })
    .collect()
}

fn spawn_all(peers: &[PeerRecord]) -> Vec<Arc<Participant>> {
  peers
    .iter()
    .enumerate()
    .map(|(i, record)| Participant::spawn(&record.peer_id, peers, u64::from(i as u16) + 1).unwrap())
    .collect()
}

fn wait_until_all_learned(participants: &[Arc<Participant>], timeout: Duration) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if participants.iter().all(|p| p.has_learned()) {
      return true;
    }
    thread::sleep(Duration::from_millis(100));
  }
  participants.iter().all(|p| p.has_learned())
}

fn stop_all(participants: &[Arc<Participant>]) {
  for participant in participants {
    participant.stop();
  }
}

/// Scenario 1: ideal-network decision. A reliable 5-peer cluster agrees on
/// the proposed value and every peer learns it.
#[test]
fn ideal_network_decision() {
  let peers = cluster(21100, 5, Profile::Reliable);
  let participants = spawn_all(&peers);

  assert_eq!(participants[4].propose("hello"), ProposeResult::Accepted);
  assert!(wait_until_all_learned(&participants, Duration::from_secs(15)));

  for participant in &participants {
    assert_eq!(participant.learned_value(), Some("hello".to_string()));
  }

  stop_all(&participants);
}

/// Scenario 2 (condensed): dueling proposers under a standard profile still
/// converge on a single agreed value across the cluster.
#[test]
fn dueling_proposers_converge() {
  let peers = cluster(21200, 5, Profile::Standard);
  let participants = spawn_all(&peers);

  let first = Arc::clone(&participants[0]);
  let second = Arc::clone(&participants[4]);
  let handle_a = thread::spawn(move || first.propose("A"));
  let handle_b = thread::spawn(move || second.propose("B"));
  let _ = handle_a.join();
  let _ = handle_b.join();

  assert!(wait_until_all_learned(&participants, Duration::from_secs(20)));

  let decided: Vec<Option<String>> = participants.iter().map(|p| p.learned_value()).collect();
  let first_value = decided[0].clone();
  assert!(first_value == Some("A".to_string()) || first_value == Some("B".to_string()));
  assert!(decided.iter().all(|v| *v == first_value), "every peer must agree on the same value");

  stop_all(&participants);
}

/// Scenario 3 (condensed): a minority partition cannot prevent the majority
/// from deciding.
#[test]
fn minority_partition_does_not_block_majority() {
  let peers = cluster(21300, 5, Profile::Reliable);
  let participants = spawn_all(&peers);

  let minority = ["M1".to_string(), "M2".to_string()];
  let majority = ["M3".to_string(), "M4".to_string(), "M5".to_string()];

  participants[0].simulate_partition(&majority, Duration::from_secs(60));
  participants[1].simulate_partition(&majority, Duration::from_secs(60));
  for participant in &participants[2..] {
    participant.simulate_partition(&minority, Duration::from_secs(60));
  }

  assert_eq!(participants[2].propose("majority-wins"), ProposeResult::Accepted);

  let deadline = Instant::now() + Duration::from_secs(15);
  while Instant::now() < deadline && !participants[2..].iter().all(|p| p.has_learned()) {
    thread::sleep(Duration::from_millis(100));
  }
  assert!(participants[2..].iter().all(|p| p.has_learned()));
  assert!(!participants[0].has_learned());
  assert!(!participants[1].has_learned());

  stop_all(&participants);
}
