use crate::address::{Address, LabelUuid, UnicastAddress};
use crate::crypto::nonce::{ApplicationNonce, DeviceNonce};
use crate::crypto::{aes_ccm_decrypt_detached, aes_ccm_encrypt_detached};
use crate::driver::{DeviceError, Layer};
use crate::keys::KeyStore;
use crate::message::{
    AccessKey, AccessMessage, ControlMessage, ControlOpcode, TransportControlMessage,
};
use crate::pdu::access::MAX_ACCESS_PAYLOAD;
use crate::pdu::lower::{self, SegmentAck, SzMic, MAX_UNSEGMENTED_ACCESS_PAYLOAD};
use crate::pdu::proxy::ProxyConfigurationPDU;
use crate::pdu::upper::{UpperAccess, UpperControl, MAX_UPPER_ACCESS_LEN};
use heapless::Vec;

/// Plaintext of an inbound access message and the key that authenticated it.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedAccess {
    pub key: AccessKey,
    /// Destination, upgraded to its label UUID when a virtual address was used.
    pub dst: Address,
    pub access_pdu: Vec<u8, MAX_ACCESS_PAYLOAD>,
}

/// Control payload ready for the lower transport, or a proxy configuration PDU which
/// bypasses it.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundControl {
    Transport(UpperControl),
    Proxy(ProxyConfigurationPDU),
}

/// Addressing needed to build the application and device nonces.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UpperContext {
    pub seq: u32,
    pub src: UnicastAddress,
    pub dst: Address,
    pub iv_index: u32,
    pub net_key_index: u16,
}

/// Access payload protection and transport control framing.
pub struct Upper;

impl Upper {
    /// TransMIC size for an access PDU of `access_len` octets.
    ///
    /// Messages that fit a single unsegmented PDU with a 32 bit TransMIC always use it.
    pub fn szmic(access_len: usize, aszmic: bool) -> SzMic {
        if access_len + SzMic::Bit32.mic_len() <= MAX_UNSEGMENTED_ACCESS_PAYLOAD {
            SzMic::Bit32
        } else {
            SzMic::from(aszmic)
        }
    }

    /// Encrypts the access payload of `message`. Header `seq`, `src`, `dst` and `iv_index`
    /// must already be assigned. Fills `access_pdu` and `upper_transport_pdu`.
    pub fn process_outbound_access(
        message: &mut AccessMessage,
    ) -> Result<UpperAccess, DeviceError> {
        message.access_pdu.clear();
        message.payload.emit(&mut message.access_pdu)?;

        let szmic = Self::szmic(message.access_pdu.len(), message.aszmic);
        let mic_len = szmic.mic_len();
        if message.access_pdu.len() + mic_len > MAX_UPPER_ACCESS_LEN {
            return Err(DeviceError::InsufficientBuffer);
        }

        let header = &message.header;
        let mut payload: Vec<u8, MAX_UPPER_ACCESS_LEN> =
            Vec::from_slice(&message.access_pdu).map_err(|_| DeviceError::InsufficientBuffer)?;
        let mut mic = [0; 8];
        let mic = &mut mic[..mic_len];
        let label = message.header.dst.label_uuid().map(|label| &label.label_uuid()[..]);

        let result = match &message.key {
            AccessKey::Application(key) => {
                let nonce = ApplicationNonce::new(
                    szmic,
                    header.seq,
                    header.src,
                    header.dst,
                    header.iv_index,
                );
                aes_ccm_encrypt_detached(key.key(), &*nonce, &mut payload, mic, label)
            }
            AccessKey::Device(key) => {
                let nonce =
                    DeviceNonce::new(szmic, header.seq, header.src, header.dst, header.iv_index);
                aes_ccm_encrypt_detached(key.key(), &*nonce, &mut payload, mic, label)
            }
        };
        result.map_err(|_| DeviceError::CryptoError("upper transport encryption"))?;
        payload
            .extend_from_slice(mic)
            .map_err(|_| DeviceError::InsufficientBuffer)?;

        debug!(
            "access pdu of {} octets protected with {} bit TransMIC",
            message.access_pdu.len(),
            mic_len * 8
        );
        message.upper_transport_pdu = payload.clone();

        Ok(UpperAccess {
            akf: message.key.akf(),
            aid: message.key.aid(),
            szmic,
            payload,
        })
    }

    /// Frames a control message as `opcode || parameters`.
    pub fn process_outbound_control(
        message: &mut ControlMessage,
    ) -> Result<OutboundControl, DeviceError> {
        message.transport_control_pdu.clear();
        message
            .transport_control_pdu
            .push(message.opcode.value())
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        message
            .transport_control_pdu
            .extend_from_slice(&message.parameters)
            .map_err(|_| DeviceError::InsufficientBuffer)?;
        match message.opcode {
            ControlOpcode::Transport(opcode) => Ok(OutboundControl::Transport(UpperControl::new(
                opcode,
                &message.parameters,
            )?)),
            ControlOpcode::Proxy(opcode) => Ok(OutboundControl::Proxy(
                ProxyConfigurationPDU::new(opcode, &message.parameters)?,
            )),
        }
    }

    /// Decrypts an inbound access PDU with every candidate key until one authenticates.
    pub fn process_inbound_access<C: KeyStore + ?Sized>(
        ctx: &C,
        upper: &UpperAccess,
        addressing: &UpperContext,
    ) -> Result<DecryptedAccess, DeviceError> {
        let (ciphertext, mic) = upper.split_mic(upper.szmic.mic_len())?;

        let labels = Self::label_candidates(ctx, &addressing.dst)?;
        let keys = Self::key_candidates(ctx, upper, addressing);
        if keys.is_empty() {
            warn!(
                "no key for akf {} aid {:x} from {:x}",
                upper.akf,
                u8::from(upper.aid),
                addressing.src.0
            );
            return Err(DeviceError::MissingKey);
        }

        for label in labels.iter() {
            let additional_data = label.as_ref().map(|label| &label.label_uuid()[..]);
            for (material, key) in keys.iter() {
                let mut access_pdu: Vec<u8, MAX_ACCESS_PAYLOAD> =
                    Vec::from_slice(ciphertext).map_err(|_| DeviceError::InsufficientBuffer)?;
                let result = match key {
                    AccessKey::Application(_) => {
                        let nonce = ApplicationNonce::new(
                            upper.szmic,
                            addressing.seq,
                            addressing.src,
                            addressing.dst,
                            addressing.iv_index,
                        );
                        aes_ccm_decrypt_detached(
                            material,
                            &*nonce,
                            &mut access_pdu,
                            mic,
                            additional_data,
                        )
                    }
                    AccessKey::Device(_) => {
                        let nonce = DeviceNonce::new(
                            upper.szmic,
                            addressing.seq,
                            addressing.src,
                            addressing.dst,
                            addressing.iv_index,
                        );
                        aes_ccm_decrypt_detached(
                            material,
                            &*nonce,
                            &mut access_pdu,
                            mic,
                            additional_data,
                        )
                    }
                };
                if result.is_ok() {
                    let dst = match label {
                        Some(label) => Address::LabelUuid(*label),
                        None => addressing.dst,
                    };
                    return Ok(DecryptedAccess {
                        key: *key,
                        dst,
                        access_pdu,
                    });
                }
            }
        }

        Err(DeviceError::AuthenticationFailed(Layer::UpperTransport))
    }

    fn key_candidates<C: KeyStore + ?Sized>(
        ctx: &C,
        upper: &UpperAccess,
        addressing: &UpperContext,
    ) -> std::vec::Vec<([u8; 16], AccessKey)> {
        let mut candidates = std::vec::Vec::new();
        if upper.akf {
            for app_key in ctx.application_keys(addressing.net_key_index) {
                for material in app_key.candidates(upper.aid) {
                    candidates.push((*material, AccessKey::Application(app_key)));
                }
            }
        } else {
            let mut nodes = std::vec![addressing.src];
            if let Address::Unicast(dst) = addressing.dst {
                if dst != addressing.src {
                    nodes.push(dst);
                }
            }
            for node in nodes {
                if let Some(device_key) = ctx.node(node).and_then(|details| details.device_key) {
                    candidates.push((*device_key.key(), AccessKey::Device(device_key)));
                }
            }
        }
        candidates
    }

    /// Label UUIDs to try as additional data. `None` stands for no additional data.
    fn label_candidates<C: KeyStore + ?Sized>(
        ctx: &C,
        dst: &Address,
    ) -> Result<std::vec::Vec<Option<LabelUuid>>, DeviceError> {
        match dst {
            Address::Virtual(address) => {
                let labels: std::vec::Vec<_> = ctx
                    .label_uuids()
                    .into_iter()
                    .filter(|label| label.virtual_address() == *address)
                    .map(Some)
                    .collect();
                if labels.is_empty() {
                    warn!("no label uuid for virtual address {:x}", address.0);
                    Err(DeviceError::MissingKey)
                } else {
                    Ok(labels)
                }
            }
            Address::LabelUuid(label) => Ok(std::vec![Some(*label)]),
            _ => Ok(std::vec![None]),
        }
    }

    /// Parses the control payloads the transport handles itself.
    pub fn process_inbound_control(
        control: &UpperControl,
    ) -> Result<Option<TransportControlMessage>, DeviceError> {
        match control.opcode {
            lower::Opcode::SegmentedAcknowledgement => Ok(Some(
                TransportControlMessage::SegmentAcknowledgement(SegmentAck::parse(
                    &control.parameters,
                )?),
            )),
            _ => Ok(None),
        }
    }
}
