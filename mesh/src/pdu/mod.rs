pub mod access;
pub mod lower;
pub mod network;
pub mod proxy;
pub mod upper;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ParseError {
    InvalidPDUFormat,
    InvalidValue,
    InvalidLength,
    InsufficientBuffer,
}

impl From<()> for ParseError {
    fn from(_: ()) -> Self {
        Self::InsufficientBuffer
    }
}

impl From<crate::InsufficientBuffer> for ParseError {
    fn from(_: crate::InsufficientBuffer) -> Self {
        Self::InsufficientBuffer
    }
}
