//! A single-decree Paxos participant with a pluggable adversarial network
//! simulator, split into the five components described in the design: the
//! wire codec, the point-to-point transport, the network-behavior model,
//! the state manager, and the participant façade that integrates them.

pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod participant;
pub mod scenario;
pub mod state;
pub mod transport;
