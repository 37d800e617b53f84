use serde::{Deserialize, Serialize};

/// Six bit identifier of an application key, carried in the lower transport header.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApplicationKeyIdentifier(u8);

impl From<u8> for ApplicationKeyIdentifier {
    fn from(val: u8) -> Self {
        Self(val & 0b00111111)
    }
}

impl From<ApplicationKeyIdentifier> for u8 {
    fn from(val: ApplicationKeyIdentifier) -> Self {
        val.0
    }
}
