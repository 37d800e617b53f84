use crate::address::{Address, UnicastAddress};
use crate::pdu::lower::SzMic;
use core::ops::Deref;

fn build_nonce(
    nonce_type: u8,
    second: u8,
    seq: u32,
    src: UnicastAddress,
    dst: [u8; 2],
    iv_index: u32,
) -> [u8; 13] {
    let mut nonce = [0; 13];
    nonce[0] = nonce_type;
    nonce[1] = second;

    let seq = seq.to_be_bytes();
    nonce[2..5].copy_from_slice(&seq[1..4]);
    nonce[5..7].copy_from_slice(&src.as_bytes());
    nonce[7..9].copy_from_slice(&dst);
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());

    nonce
}

fn aszmic_bit(aszmic: SzMic) -> u8 {
    match aszmic {
        SzMic::Bit32 => 0b00000000,
        SzMic::Bit64 => 0b10000000,
    }
}

/// Nonce protecting network PDUs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NetworkNonce([u8; 13]);

impl NetworkNonce {
    const NONCE_TYPE: u8 = 0x00;

    pub fn new(ctl_ttl: u8, seq: u32, src: UnicastAddress, iv_index: u32) -> Self {
        Self(build_nonce(
            Self::NONCE_TYPE,
            ctl_ttl,
            seq,
            src,
            [0x00, 0x00],
            iv_index,
        ))
    }
}

impl Deref for NetworkNonce {
    type Target = [u8; 13];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Nonce protecting proxy configuration PDUs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProxyNonce([u8; 13]);

impl ProxyNonce {
    const NONCE_TYPE: u8 = 0x03;

    pub fn new(seq: u32, src: UnicastAddress, iv_index: u32) -> Self {
        Self(build_nonce(
            Self::NONCE_TYPE,
            0x00,
            seq,
            src,
            [0x00, 0x00],
            iv_index,
        ))
    }
}

impl Deref for ProxyNonce {
    type Target = [u8; 13];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ApplicationNonce([u8; 13]);

impl ApplicationNonce {
    const NONCE_TYPE: u8 = 0x01;

    pub fn new(aszmic: SzMic, seq: u32, src: UnicastAddress, dst: Address, iv_index: u32) -> Self {
        Self(build_nonce(
            Self::NONCE_TYPE,
            aszmic_bit(aszmic),
            seq,
            src,
            dst.as_bytes(),
            iv_index,
        ))
    }
}

impl Deref for ApplicationNonce {
    type Target = [u8; 13];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceNonce([u8; 13]);

impl DeviceNonce {
    const NONCE_TYPE: u8 = 0x02;

    pub fn new(aszmic: SzMic, seq: u32, src: UnicastAddress, dst: Address, iv_index: u32) -> Self {
        Self(build_nonce(
            Self::NONCE_TYPE,
            aszmic_bit(aszmic),
            seq,
            src,
            dst.as_bytes(),
            iv_index,
        ))
    }
}

impl Deref for DeviceNonce {
    type Target = [u8; 13];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
