//! The static membership file loader (§6). Generalizes the teacher crate's
//! `config::parse` — there a list of YAML nodes, here a plain
//! comma-separated `peer_id,host,port[,profile]` format, since the spec
//! fixes that exact wire shape for the membership file.

use crate::codec::peer_ordinal;
use crate::error::PaxosError;
use crate::network::Profile;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One line of the membership file, fully parsed and defaulted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRecord {
  pub peer_id: String,
  pub host: String,
  pub port: u16,
  pub profile: Profile,
}

/// Parses and validates the contents of a membership file.
///
/// Blank lines and `#`-prefixed comments are ignored. Every remaining line
/// must have the form `peer_id,host,port[,profile]`; `profile` is
/// case-insensitive and defaults to `Profile::Standard`. After parsing, the
/// cluster must have at least 3 members, all ports must be unique, and
/// every `peer_id` must match `M<positive int>`.
pub fn parse(contents: &str) -> Result<Vec<PeerRecord>, PaxosError> {
  let mut records = Vec::new();

  for (line_number, raw_line) in contents.lines().enumerate() {
    let line = raw_line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 && fields.len() != 4 {
      return Err(PaxosError::Config(format!(
        "line {}: expected `peer_id,host,port[,profile]`, got `{}`",
        line_number + 1,
        raw_line
      )));
    }

    let peer_id = fields[0].to_string();
    peer_ordinal(&peer_id).map_err(|_| {
      PaxosError::Config(format!(
        "line {}: `{}` is not a valid peer identifier (expected `M<positive int>`)",
        line_number + 1,
        peer_id
      ))
    })?;

    let host = fields[1].to_string();
    let port: u16 = fields[2].parse().map_err(|_| {
      PaxosError::Config(format!(
        "line {}: `{}` is not a valid port",
        line_number + 1,
        fields[2]
      ))
    })?;

    let profile = match fields.get(3) {
      Some(raw) => raw
        .parse()
        .map_err(|()| PaxosError::Config(format!("line {}: unknown profile `{raw}`", line_number + 1)))?,
      None => Profile::Standard,
    };

    records.push(PeerRecord { peer_id, host, port, profile });
  }

  if records.len() < 3 {
    return Err(PaxosError::Config(format!(
      "a cluster needs at least 3 members, found {}",
      records.len()
    )));
  }

  let mut seen_ports = HashSet::new();
  for record in &records {
    if !seen_ports.insert(record.port) {
      return Err(PaxosError::Config(format!("duplicate port {}", record.port)));
    }
  }

  let mut seen_ids = HashSet::new();
  for record in &records {
    if !seen_ids.insert(record.peer_id.clone()) {
      return Err(PaxosError::Config(format!("duplicate peer id {}", record.peer_id)));
    }
  }

  Ok(records)
}

/// Reads and parses a membership file from disk.
pub fn read(path: &Path) -> Result<Vec<PeerRecord>, PaxosError> {
  let contents = fs::read_to_string(path)
    .map_err(|err| PaxosError::Config(format!("unable to read `{}`: {err}", path.display())))?;
  parse(&contents)
}

/// Computes the default port for a peer: `9000 + suffix(peer_id)`.
#[must_use]
pub fn default_port(peer_id: &str) -> u16 {
  // The `as` cast is safe for any realistically sized cluster; ordinals
  // above ~56000 would overflow a u16 port and are rejected by callers
  // long before this function is reached.
  9000 + peer_ordinal(peer_id).unwrap_or(0) as u16
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn parses_minimal_cluster() {
    let config = "M1,127.0.0.1,9001\nM2,127.0.0.1,9002\nM3,127.0.0.1,9003\n";
    let records = parse(config).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].profile, Profile::Standard);
  }

  #[test]
  fn ignores_comments_and_blank_lines() {
    let config = "\
# cluster of three
M1,127.0.0.1,9001

# a latent peer
M2,127.0.0.1,9002,latent
M3,127.0.0.1,9003,RELIABLE
";
    let records = parse(config).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].profile, Profile::Latent);
    assert_eq!(records[2].profile, Profile::Reliable);
  }

  #[test]
  fn rejects_fewer_than_three_members() {
    let config = "M1,127.0.0.1,9001\nM2,127.0.0.1,9002\n";
    assert!(parse(config).is_err());
  }

  #[test]
  fn rejects_duplicate_ports() {
    let config = "M1,127.0.0.1,9001\nM2,127.0.0.1,9001\nM3,127.0.0.1,9003\n";
    assert!(parse(config).is_err());
  }

  #[test]
  fn rejects_bad_peer_id() {
    let config = "X1,127.0.0.1,9001\nM2,127.0.0.1,9002\nM3,127.0.0.1,9003\n";
    assert!(parse(config).is_err());
  }

  #[test]
  fn default_port_uses_peer_ordinal() {
    assert_eq!(default_port("M7"), 9007);
  }

  #[test]
  fn read_parses_a_real_membership_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# three-node cluster").unwrap();
    writeln!(file, "M1,127.0.0.1,9001").unwrap();
    writeln!(file, "M2,127.0.0.1,9002,latent").unwrap();
    writeln!(file, "M3,127.0.0.1,9003").unwrap();

    let records = read(file.path()).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].profile, Profile::Latent);
  }

  #[test]
  fn read_reports_a_config_error_for_a_missing_file() {
    let err = read(Path::new("/nonexistent/membership.txt")).unwrap_err();
    assert!(matches!(err, PaxosError::Config(_)));
  }
}
