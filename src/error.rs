//! The error model for the peer (see the error handling design in the spec).
//!
//! Errors are split by where they originate rather than lumped into one
//! opaque `String`, so that callers can decide per kind whether to log and
//! absorb it (framing, transport, invariant, timeout) or abort (config).

use std::fmt;
use std::io;

/// A classified failure somewhere in the peer.
#[derive(Debug)]
pub enum PaxosError {
  /// A wire line could not be parsed into a `PaxosMessage`.
  Framing(String),

  /// A send or accept failed at the socket layer.
  Transport(io::Error),

  /// A state transition was requested from a phase that forbids it. This
  /// should be unreachable; if it happens, the event is logged and dropped.
  Invariant(String),

  /// A proposer's phase budget elapsed before reaching a quorum.
  Timeout,

  /// The static membership file is malformed.
  Config(String),
}

impl fmt::Display for PaxosError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PaxosError::Framing(line) => write!(f, "malformed message: `{line}`"),
      PaxosError::Transport(err) => write!(f, "transport error: {err}"),
      PaxosError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
      PaxosError::Timeout => write!(f, "proposal attempt timed out"),
      PaxosError::Config(msg) => write!(f, "configuration error: {msg}"),
    }
  }
}

impl std::error::Error for PaxosError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      PaxosError::Transport(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for PaxosError {
  fn from(err: io::Error) -> Self {
    PaxosError::Transport(err)
  }
}

pub type Result<T> = std::result::Result<T, PaxosError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn displays_framing_reason() {
    let err = PaxosError::Framing("PREPARE:M1".to_string());
    assert_eq!(err.to_string(), "malformed message: `PREPARE:M1`");
  }

  #[test]
  fn wraps_io_error_as_transport() {
    let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
    let err: PaxosError = io_err.into();
    assert!(matches!(err, PaxosError::Transport(_)));
  }
}
