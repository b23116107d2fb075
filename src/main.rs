#![deny(clippy::all, clippy::pedantic, warnings)]

use clap::Parser;
use env_logger::fmt::Color;
use env_logger::Builder;
use log::{error, info, Level, LevelFilter};
use paxos_sim::config::{self, PeerRecord};
use paxos_sim::network::Profile;
use paxos_sim::participant::{Participant, ProposeResult};
use paxos_sim::scenario::{self, ScenarioName};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// A single-decree Paxos participant with a pluggable adversarial network
/// simulator.
#[derive(Parser)]
#[command(name = "paxos-sim", version, about)]
struct Cli {
  /// This peer's identifier, e.g. `M1`.
  peer_id: String,

  /// Overrides this peer's network profile from the membership file.
  #[arg(long, value_name = "NAME")]
  profile: Option<String>,

  /// Sets the path of the membership file.
  #[arg(long, value_name = "PATH", default_value = "membership.txt")]
  config: PathBuf,

  /// Overrides this peer's port from the membership file.
  #[arg(long, value_name = "PORT")]
  port: Option<u16>,

  /// Runs a named scenario and exits once it completes.
  #[arg(long, value_name = "NAME")]
  scenario: Option<String>,

  /// Drops into an interactive command REPL after startup.
  #[arg(long)]
  interactive: bool,
}

fn set_up_logging() {
  Builder::new()
    .filter_level(
      LevelFilter::from_str(&env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()))
        .unwrap_or(DEFAULT_LOG_LEVEL),
    )
    .format(|buf, record| {
      let mut style = buf.style();
      style.set_bold(true);
      match record.level() {
        Level::Error => {
          style.set_color(Color::Red);
        }
        Level::Warn => {
          style.set_color(Color::Yellow);
        }
        Level::Info => {
          style.set_color(Color::Green);
        }
        Level::Debug | Level::Trace => {
          style.set_color(Color::Blue);
        }
      }
      let indent_size = record.level().to_string().len() + 3;
      let indent = &" ".repeat(indent_size);
      let options = textwrap::Options::with_termwidth().initial_indent(indent).subsequent_indent(indent);
      writeln!(
        buf,
        "{} {}",
        style.value(format!("[{}]", record.level())),
        &textwrap::fill(&record.args().to_string(), &options)[indent_size..],
      )
    })
    .init();
}

/// Loads the membership file and applies the `--profile`/`--port`
/// overrides to this peer's own record.
fn load_membership(cli: &Cli) -> Result<Vec<PeerRecord>, String> {
  let mut peers = config::read(&cli.config).map_err(|err| err.to_string())?;

  if let Some(raw_profile) = &cli.profile {
    let profile: Profile =
      raw_profile.parse().map_err(|()| format!("`{raw_profile}` is not a known network profile"))?;
    if let Some(record) = peers.iter_mut().find(|record| record.peer_id == cli.peer_id) {
      record.profile = profile;
    }
  }

  if let Some(port) = cli.port {
    if let Some(record) = peers.iter_mut().find(|record| record.peer_id == cli.peer_id) {
      record.port = port;
    }
  }

  Ok(peers)
}

fn main() {
  set_up_logging();

  let cli = Cli::parse();

  let peers = match load_membership(&cli) {
    Ok(peers) => peers,
    Err(reason) => {
      error!("{reason}");
      exit(1);
    }
  };

  let participant = match Participant::spawn(&cli.peer_id, &peers, seed_for(&cli.peer_id)) {
    Ok(participant) => participant,
    Err(err) => {
      error!("unable to start `{}`: {err}", cli.peer_id);
      exit(1);
    }
  };
  info!("{} is up, listening for {} known peer(s)", cli.peer_id, peers.len() - 1);

  if let Some(raw_scenario) = &cli.scenario {
    match raw_scenario.parse::<ScenarioName>() {
      Ok(name) => {
        let outcome = scenario::run(name, &participant, &cli.peer_id);
        println!(
          "scenario {} finished after {:?}: learned={} value={:?}",
          outcome.name, outcome.elapsed, outcome.learned, outcome.learned_value
        );
      }
      Err(()) => {
        error!("`{raw_scenario}` is not a known scenario");
        participant.stop();
        exit(1);
      }
    }
  }

  if cli.interactive {
    run_repl(&participant);
  }

  participant.stop();
}

fn seed_for(peer_id: &str) -> u64 {
  peer_id.bytes().fold(0u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)))
}

/// The interactive command loop (§6 "Runtime commands"). Every command
/// failure is reported on stderr with a human-readable reason; nothing
/// here panics on bad input.
fn run_repl(participant: &Arc<Participant>) {
  let stdin = io::stdin();
  print!("> ");
  let _ = io::stdout().flush();

  for line in stdin.lock().lines() {
    let Ok(line) = line else { break };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
      [] => {}
      ["propose", value @ ..] if !value.is_empty() => match participant.propose(&value.join(" ")) {
        ProposeResult::Accepted => println!("proposal accepted"),
        ProposeResult::Rejected { reason } => println!("proposal rejected: {reason}"),
      },
      ["profile", name] => match name.parse::<Profile>() {
        Ok(profile) => {
          participant.set_profile(profile);
          println!("profile set to {profile}");
        }
        Err(()) => println!("`{name}` is not a known network profile"),
      },
      ["scenario", name] => match name.parse::<ScenarioName>() {
        Ok(name) => {
          let outcome = scenario::run(name, participant, participant.self_id());
          println!("scenario {} finished: learned={} value={:?}", outcome.name, outcome.learned, outcome.learned_value);
        }
        Err(()) => println!("`{name}` is not a known scenario"),
      },
      ["partition", seconds, rest @ ..] if !rest.is_empty() => match seconds.parse::<u64>() {
        Ok(seconds) => {
          let peers: Vec<String> = rest.iter().map(|s| (*s).to_string()).collect();
          participant.simulate_partition(&peers, Duration::from_secs(seconds));
          println!("partitioned from {}", peers.join(", "));
        }
        Err(_) => println!("`{seconds}` is not a valid number of seconds"),
      },
      ["offline", seconds] => match seconds.parse::<u64>() {
        Ok(seconds) => {
          participant.simulate_offline(Duration::from_secs(seconds));
          println!("offline for {seconds}s");
        }
        Err(_) => println!("`{seconds}` is not a valid number of seconds"),
      },
      ["stats"] => {
        let stats = participant.network().stats();
        println!(
          "sent={} lost={} delay_ms={} loss_rate={:.3}",
          stats.total_sent, stats.total_lost, stats.total_delay_ms, stats.loss_rate
        );
      }
      ["metrics"] => {
        println!("condition={}", participant.network().condition());
        println!("has_learned={}", participant.has_learned());
        println!("backoff_events={}", participant.backoff_count());
      }
      ["events"] => print_events(participant, 20),
      ["events", n] => match n.parse::<usize>() {
        Ok(n) => print_events(participant, n),
        Err(_) => println!("`{n}` is not a valid count"),
      },
      ["reset"] => {
        participant.reset();
        println!("proposer state reset");
      }
      ["quit" | "exit"] => break,
      _ => println!("unrecognized command: {line}"),
    }
    print!("> ");
    let _ = io::stdout().flush();
  }
}

fn print_events(participant: &Participant, n: usize) {
  for event in participant.network().recent_events(n) {
    println!("{:?} {} {}", event.at.elapsed(), event.kind, event.description);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn seed_for_is_deterministic_per_peer() {
    assert_eq!(seed_for("M1"), seed_for("M1"));
    assert_ne!(seed_for("M1"), seed_for("M2"));
  }
}
