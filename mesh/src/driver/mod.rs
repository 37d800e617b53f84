use crate::address::{InvalidAddress, UnicastAddress};
use crate::pdu::ParseError;
use crate::InsufficientBuffer;
use cmac::crypto_mac::InvalidKeyLength;

pub mod pipeline;
pub mod transport;

/// Layer whose authentication failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Layer {
    Network,
    UpperTransport,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError {
    CryptoError(&'static str),
    InvalidKeyLength,
    InsufficientBuffer,
    ParseError(ParseError),
    InvalidSrcAddress,
    InvalidDstAddress,
    AuthenticationFailed(Layer),
    ReplayRejected,
    ReassemblyTimeout,
    UnknownNetworkKey,
    UnknownNode(UnicastAddress),
    MissingKey,
    InvalidState,
    ShutDown,
    Runtime,
}

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceError::CryptoError(context) => write!(f, "crypto failure: {}", context),
            DeviceError::AuthenticationFailed(layer) => {
                write!(f, "authentication failed at {:?} layer", layer)
            }
            DeviceError::UnknownNode(address) => write!(f, "unknown node {}", address),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<InvalidKeyLength> for DeviceError {
    fn from(_: InvalidKeyLength) -> Self {
        DeviceError::InvalidKeyLength
    }
}

impl From<ParseError> for DeviceError {
    fn from(inner: ParseError) -> Self {
        DeviceError::ParseError(inner)
    }
}

impl From<InsufficientBuffer> for DeviceError {
    fn from(_: InsufficientBuffer) -> Self {
        DeviceError::InsufficientBuffer
    }
}

impl From<InvalidAddress> for DeviceError {
    fn from(_: InvalidAddress) -> Self {
        DeviceError::InvalidDstAddress
    }
}
