//! The wire codec (C1): proposal numbers, the five Paxos message kinds, and
//! the colon-delimited line format they're serialized to.

use crate::error::PaxosError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A totally-ordered `(counter, peer_ordinal)` pair. Lexicographic order on
/// `counter` first, then `peer_ordinal`. `Option<ProposalNumber>::None` is
/// strictly less than any `Some` value, which falls out of the derived
/// `Option` ordering without any extra code.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ProposalNumber {
  pub counter: u64,
  pub peer_ordinal: u32,
}

impl Ord for ProposalNumber {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .counter
      .cmp(&other.counter)
      .then_with(|| self.peer_ordinal.cmp(&other.peer_ordinal))
  }
}

impl PartialOrd for ProposalNumber {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Display for ProposalNumber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.counter, self.peer_ordinal)
  }
}

impl FromStr for ProposalNumber {
  type Err = PaxosError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (counter_str, ordinal_str) = s
      .split_once('.')
      .ok_or_else(|| PaxosError::Framing(s.to_string()))?;
    let counter = counter_str
      .parse()
      .map_err(|_| PaxosError::Framing(s.to_string()))?;
    let peer_ordinal = ordinal_str
      .parse()
      .map_err(|_| PaxosError::Framing(s.to_string()))?;
    Ok(ProposalNumber { counter, peer_ordinal })
  }
}

/// Compares two proposal numbers in their wire (string) form. Parses both
/// sides as `(counter, ordinal)` and compares lexicographically; if either
/// side fails to parse, falls back to byte-wise comparison of the raw
/// strings (defensive — this should not happen for well-formed input).
#[must_use]
pub fn compare_wire(a: &str, b: &str) -> Ordering {
  match (a.parse::<ProposalNumber>(), b.parse::<ProposalNumber>()) {
    (Ok(pa), Ok(pb)) => pa.cmp(&pb),
    _ => a.cmp(b),
  }
}

/// Extracts the numeric ordinal from a peer identifier of the form `M<k>`.
pub fn peer_ordinal(peer_id: &str) -> Result<u32, PaxosError> {
  peer_id
    .strip_prefix('M')
    .and_then(|rest| rest.parse().ok())
    .ok_or_else(|| PaxosError::Config(format!("`{peer_id}` is not a valid peer identifier")))
}

/// The five Paxos message kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
  Prepare,
  Promise,
  AcceptRequest,
  Accepted,
  Learn,
}

impl MessageKind {
  fn as_str(self) -> &'static str {
    match self {
      MessageKind::Prepare => "PREPARE",
      MessageKind::Promise => "PROMISE",
      MessageKind::AcceptRequest => "ACCEPT_REQUEST",
      MessageKind::Accepted => "ACCEPTED",
      MessageKind::Learn => "LEARN",
    }
  }

  fn from_str(s: &str) -> Option<Self> {
    match s {
      "PREPARE" => Some(MessageKind::Prepare),
      "PROMISE" => Some(MessageKind::Promise),
      "ACCEPT_REQUEST" => Some(MessageKind::AcceptRequest),
      "ACCEPTED" => Some(MessageKind::Accepted),
      "LEARN" => Some(MessageKind::Learn),
      _ => None,
    }
  }
}

/// A single Paxos protocol message in its parsed form.
#[derive(Clone, Debug, PartialEq)]
pub struct PaxosMessage {
  pub kind: MessageKind,
  pub sender: String,
  pub proposal_number: ProposalNumber,
  pub proposal_value: Option<String>,
  pub prior: Option<(ProposalNumber, String)>,
}

impl PaxosMessage {
  #[must_use]
  pub fn prepare(sender: impl Into<String>, proposal_number: ProposalNumber) -> Self {
    PaxosMessage {
      kind: MessageKind::Prepare,
      sender: sender.into(),
      proposal_number,
      proposal_value: None,
      prior: None,
    }
  }

  #[must_use]
  pub fn promise(
    sender: impl Into<String>,
    proposal_number: ProposalNumber,
    prior: Option<(ProposalNumber, String)>,
  ) -> Self {
    PaxosMessage {
      kind: MessageKind::Promise,
      sender: sender.into(),
      proposal_number,
      proposal_value: None,
      prior,
    }
  }

  #[must_use]
  pub fn accept_request(
    sender: impl Into<String>,
    proposal_number: ProposalNumber,
    value: impl Into<String>,
  ) -> Self {
    PaxosMessage {
      kind: MessageKind::AcceptRequest,
      sender: sender.into(),
      proposal_number,
      proposal_value: Some(value.into()),
      prior: None,
    }
  }

  #[must_use]
  pub fn accepted(
    sender: impl Into<String>,
    proposal_number: ProposalNumber,
    value: impl Into<String>,
  ) -> Self {
    PaxosMessage {
      kind: MessageKind::Accepted,
      sender: sender.into(),
      proposal_number,
      proposal_value: Some(value.into()),
      prior: None,
    }
  }

  #[must_use]
  pub fn learn(
    sender: impl Into<String>,
    proposal_number: ProposalNumber,
    value: impl Into<String>,
  ) -> Self {
    PaxosMessage {
      kind: MessageKind::Learn,
      sender: sender.into(),
      proposal_number,
      proposal_value: Some(value.into()),
      prior: None,
    }
  }
}

/// Serializes a message to its colon-delimited wire form. Callers guarantee
/// `sender` and `proposal_value` contain no colons or newlines.
#[must_use]
pub fn serialize(msg: &PaxosMessage) -> String {
  let value = msg.proposal_value.as_deref().unwrap_or("");
  let mut line = format!(
    "{}:{}:{}:{}",
    msg.kind.as_str(),
    msg.sender,
    msg.proposal_number,
    value
  );
  if let Some((prior_number, prior_value)) = &msg.prior {
    line.push(':');
    line.push_str(&prior_number.to_string());
    line.push(':');
    line.push_str(prior_value);
  }
  line
}

/// Parses a wire-form line back into a `PaxosMessage`. Accepts exactly 4 or
/// 6 colon-delimited fields; anything else is a framing error.
pub fn deserialize(line: &str) -> Result<PaxosMessage, PaxosError> {
  let fields: Vec<&str> = line.split(':').collect();
  if fields.len() != 4 && fields.len() != 6 {
    return Err(PaxosError::Framing(line.to_string()));
  }

  let kind = MessageKind::from_str(fields[0]).ok_or_else(|| PaxosError::Framing(line.to_string()))?;
  let sender = fields[1].to_string();
  let proposal_number = fields[2]
    .parse::<ProposalNumber>()
    .map_err(|_| PaxosError::Framing(line.to_string()))?;
  let proposal_value = if fields[3].is_empty() {
    None
  } else {
    Some(fields[3].to_string())
  };

  let prior = if fields.len() == 6 {
    let prior_number = fields[4]
      .parse::<ProposalNumber>()
      .map_err(|_| PaxosError::Framing(line.to_string()))?;
    Some((prior_number, fields[5].to_string()))
  } else {
    None
  };

  Ok(PaxosMessage {
    kind,
    sender,
    proposal_number,
    proposal_value,
    prior,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn proposal_number_display_and_parse_round_trip() {
    let pn = ProposalNumber { counter: 7, peer_ordinal: 3 };
    assert_eq!(pn.to_string(), "7.3");
    assert_eq!("7.3".parse::<ProposalNumber>().unwrap(), pn);
  }

  #[test]
  fn proposal_number_ordering_is_lexicographic() {
    let low = ProposalNumber { counter: 3, peer_ordinal: 5 };
    let high = ProposalNumber { counter: 3, peer_ordinal: 2 };
    assert!(low > high); // same counter, higher ordinal wins
    assert!(
      ProposalNumber { counter: 4, peer_ordinal: 0 }
        > ProposalNumber { counter: 3, peer_ordinal: 999 }
    );
  }

  #[test]
  fn none_is_less_than_any_proposal_number() {
    let none: Option<ProposalNumber> = None;
    let some = Some(ProposalNumber { counter: 0, peer_ordinal: 1 });
    assert!(none < some);
  }

  #[test]
  fn compare_wire_matches_scenario_6() {
    assert!(compare_wire("10.1", "9.9") == Ordering::Greater);
    assert!(compare_wire("3.2", "3.5") == Ordering::Less);
    assert!(compare_wire("3.2", "3.2") == Ordering::Equal);
  }

  #[test]
  fn compare_wire_falls_back_to_lexicographic_on_garbage() {
    // Neither side parses as a proposal number, so we fall back to a raw
    // string comparison rather than panicking.
    assert_eq!(compare_wire("garbage", "zzz"), "garbage".cmp("zzz"));
  }

  #[test]
  fn peer_ordinal_parses_suffix() {
    assert_eq!(peer_ordinal("M7").unwrap(), 7);
    assert!(peer_ordinal("X7").is_err());
    assert!(peer_ordinal("M").is_err());
  }

  #[test]
  fn round_trips_all_message_kinds() {
    let messages = vec![
      PaxosMessage::prepare("M1", ProposalNumber { counter: 1, peer_ordinal: 1 }),
      PaxosMessage::promise("M2", ProposalNumber { counter: 1, peer_ordinal: 1 }, None),
      PaxosMessage::promise(
        "M3",
        ProposalNumber { counter: 7, peer_ordinal: 3 },
        Some((ProposalNumber { counter: 5, peer_ordinal: 1 }, "X".to_string())),
      ),
      PaxosMessage::accept_request("M1", ProposalNumber { counter: 1, peer_ordinal: 1 }, "V"),
      PaxosMessage::accepted("M2", ProposalNumber { counter: 1, peer_ordinal: 1 }, "V"),
      PaxosMessage::learn("M1", ProposalNumber { counter: 1, peer_ordinal: 1 }, "V"),
    ];

    for msg in messages {
      let line = serialize(&msg);
      assert_eq!(deserialize(&line).unwrap(), msg);
    }
  }

  #[test]
  fn scenario_5_codec_round_trip() {
    let msg = PaxosMessage::promise(
      "M3",
      ProposalNumber { counter: 7, peer_ordinal: 3 },
      Some((ProposalNumber { counter: 5, peer_ordinal: 1 }, "X".to_string())),
    );
    assert_eq!(serialize(&msg), "PROMISE:M3:7.3::5.1:X");
    assert_eq!(deserialize("PROMISE:M3:7.3::5.1:X").unwrap(), msg);
  }

  #[test]
  fn rejects_wrong_field_count() {
    assert!(deserialize("PREPARE:M1:1.1").is_err());
    assert!(deserialize("PREPARE:M1:1.1:x:y").is_err());
    assert!(deserialize("PREPARE:M1:1.1:x:y:z:w").is_err());
  }

  #[test]
  fn rejects_unknown_kind() {
    assert!(deserialize("REJECT:M1:1.1:").is_err());
  }

  #[test]
  fn rejects_malformed_proposal_number() {
    assert!(deserialize("PREPARE:M1:abc:").is_err());
  }
}
