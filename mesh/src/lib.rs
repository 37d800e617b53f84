#![macro_use]
#![allow(dead_code)]
//! Bluetooth mesh network and transport layers.
//!
//! This crate turns access and transport control messages into obfuscated, encrypted and
//! possibly segmented network PDUs, and reverses the process for inbound PDUs including
//! reassembly, replay protection, block acknowledgements and retransmission.
//!
//! # Layers
//!
//! * [`driver::pipeline::upper`] protects access payloads with an application or device key.
//! * [`driver::pipeline::lower`] segments and reassembles upper transport PDUs.
//! * [`driver::pipeline::network`] encrypts and obfuscates network PDUs.
//!
//! The [`driver::transport::MeshTransport`] drives the layers in order, owns the per-node
//! reassembly state and schedules the incomplete and acknowledgement timers.

pub(crate) mod fmt;

pub mod address;
pub mod app;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod keys;
pub mod message;
pub mod pdu;

pub use config::TransportConfig;
pub use driver::transport::{BearerSink, MeshTransport, StatusSink};
pub use driver::DeviceError;
pub use keys::KeyStore;
pub use message::{AccessMessage, ControlMessage, Message};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct InsufficientBuffer;
