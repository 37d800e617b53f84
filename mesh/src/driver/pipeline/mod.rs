//! The three transport layers, each a stateless stage between PDU representations.
//!
//! Outbound a message flows upper -> lower -> network; inbound the reverse. State that
//! outlives a single PDU (reassembly, replay, timers) is owned by the transport.

pub mod lower;
pub mod network;
pub mod upper;
