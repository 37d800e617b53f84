use crate::address::{Address, UnicastAddress};
use crate::crypto::nonce::{NetworkNonce, ProxyNonce};
use crate::crypto::{aes_ccm_decrypt_detached, aes_ccm_encrypt_detached, e};
use crate::driver::{DeviceError, Layer};
use crate::keys::{KeyStore, NetworkKeyDerivatives};
use crate::pdu::network::{
    net_mic_len, CleartextNetworkPDU, ObfuscatedAndEncryptedNetworkPDU, PduType,
    MAX_ENCRYPTED_LEN,
};
use heapless::Vec;

/// Network layer encryption and header obfuscation.
pub struct Authentication;

impl Authentication {
    /// IV index an inbound PDU was sent with, judged by its IVI bit.
    ///
    /// A node accepts the current IV index and the one before it.
    pub fn inbound_iv_index(current: u32, ivi: u8) -> Option<u32> {
        if (current & 1) as u8 == (ivi & 1) {
            Some(current)
        } else {
            current.checked_sub(1)
        }
    }

    pub fn process_inbound<C: KeyStore + ?Sized>(
        ctx: &C,
        pdu: &ObfuscatedAndEncryptedNetworkPDU,
    ) -> Result<CleartextNetworkPDU, DeviceError> {
        let iv_index =
            Self::inbound_iv_index(ctx.iv_index(), pdu.ivi).ok_or(DeviceError::UnknownNetworkKey)?;
        let privacy_plaintext = Self::privacy_plaintext(iv_index, &pdu.encrypted_and_mic);

        let mut candidates = 0;
        for network_key in ctx.network_keys() {
            for derivatives in network_key.candidates(pdu.nid) {
                candidates += 1;
                if let Some(cleartext) =
                    Self::try_decrypt(pdu, derivatives, iv_index, privacy_plaintext)?
                {
                    return Ok(CleartextNetworkPDU {
                        net_key_index: network_key.index(),
                        ..cleartext
                    });
                }
                debug!("nid {:x} matched but network key {} failed", pdu.nid, network_key.index());
            }
        }

        if candidates == 0 {
            Err(DeviceError::UnknownNetworkKey)
        } else {
            Err(DeviceError::AuthenticationFailed(Layer::Network))
        }
    }

    fn try_decrypt(
        pdu: &ObfuscatedAndEncryptedNetworkPDU,
        derivatives: &NetworkKeyDerivatives,
        iv_index: u32,
        privacy_plaintext: [u8; 16],
    ) -> Result<Option<CleartextNetworkPDU>, DeviceError> {
        let pecb = e(&derivatives.privacy_key, privacy_plaintext)?;
        let unobfuscated = Self::xor(pecb, pdu.obfuscated);

        let ctl_ttl = unobfuscated[0];
        let ctl = (ctl_ttl & 0b10000000) != 0;
        let seq = u32::from_be_bytes([0, unobfuscated[1], unobfuscated[2], unobfuscated[3]]);
        let raw_src = UnicastAddress(u16::from_be_bytes([unobfuscated[4], unobfuscated[5]]));

        let mic_len = net_mic_len(ctl);
        let encrypted_len = pdu.encrypted_and_mic.len();
        if encrypted_len < 2 + 1 + mic_len {
            return Ok(None);
        }
        let (encrypted, mic) = pdu.encrypted_and_mic.split_at(encrypted_len - mic_len);
        let mut payload: Vec<u8, MAX_ENCRYPTED_LEN> =
            Vec::from_slice(encrypted).map_err(|_| DeviceError::InsufficientBuffer)?;

        let result = match pdu.pdu_type {
            PduType::Network => {
                let nonce = NetworkNonce::new(ctl_ttl, seq, raw_src, iv_index);
                aes_ccm_decrypt_detached(
                    &derivatives.encryption_key,
                    &*nonce,
                    &mut payload,
                    mic,
                    None,
                )
            }
            PduType::ProxyConfiguration => {
                let nonce = ProxyNonce::new(seq, raw_src, iv_index);
                aes_ccm_decrypt_detached(
                    &derivatives.encryption_key,
                    &*nonce,
                    &mut payload,
                    mic,
                    None,
                )
            }
        };
        if result.is_err() {
            return Ok(None);
        }

        let src = UnicastAddress::parse(raw_src.as_bytes())
            .map_err(|_| DeviceError::InvalidSrcAddress)?;
        let (dst, transport_pdu) = CleartextNetworkPDU::parse_payload(pdu.pdu_type, ctl, &payload)?;

        Ok(Some(CleartextNetworkPDU {
            pdu_type: pdu.pdu_type,
            network_key: *derivatives,
            net_key_index: 0,
            iv_index,
            ttl: ctl_ttl & 0b01111111,
            seq,
            src,
            dst,
            transport_pdu,
        }))
    }

    pub fn process_outbound(
        pdu: &CleartextNetworkPDU,
    ) -> Result<ObfuscatedAndEncryptedNetworkPDU, DeviceError> {
        if let Address::Unassigned = pdu.dst {
            if pdu.pdu_type == PduType::Network {
                return Err(DeviceError::InvalidDstAddress);
            }
        }
        let ctl_ttl = pdu.ctl_ttl();

        let mut encrypted_and_mic: Vec<u8, MAX_ENCRYPTED_LEN> = Vec::new();
        pdu.emit_payload(&mut encrypted_and_mic)?;

        let mut mic = [0; 8];
        let mic = &mut mic[..pdu.net_mic_len()];
        let result = match pdu.pdu_type {
            PduType::Network => {
                let nonce = NetworkNonce::new(ctl_ttl, pdu.seq, pdu.src, pdu.iv_index);
                aes_ccm_encrypt_detached(
                    &pdu.network_key.encryption_key,
                    &*nonce,
                    &mut encrypted_and_mic,
                    mic,
                    None,
                )
            }
            PduType::ProxyConfiguration => {
                let nonce = ProxyNonce::new(pdu.seq, pdu.src, pdu.iv_index);
                aes_ccm_encrypt_detached(
                    &pdu.network_key.encryption_key,
                    &*nonce,
                    &mut encrypted_and_mic,
                    mic,
                    None,
                )
            }
        };
        result.map_err(|_| DeviceError::CryptoError("outbound network pdu"))?;
        encrypted_and_mic
            .extend_from_slice(mic)
            .map_err(|_| DeviceError::InsufficientBuffer)?;

        let privacy_plaintext = Self::privacy_plaintext(pdu.iv_index, &encrypted_and_mic);
        let pecb = e(&pdu.network_key.privacy_key, privacy_plaintext)?;

        let mut unobfuscated = [0; 6];
        unobfuscated[0] = ctl_ttl;
        unobfuscated[1..4].copy_from_slice(&pdu.seq.to_be_bytes()[1..4]);
        unobfuscated[4..6].copy_from_slice(&pdu.src.as_bytes());
        let obfuscated = Self::xor(pecb, unobfuscated);

        Ok(ObfuscatedAndEncryptedNetworkPDU {
            pdu_type: pdu.pdu_type,
            ivi: pdu.ivi(),
            nid: pdu.nid(),
            obfuscated,
            encrypted_and_mic,
        })
    }

    fn privacy_plaintext(iv_index: u32, encrypted_and_mic: &[u8]) -> [u8; 16] {
        let mut privacy_plaintext = [0; 16];

        // 0x0000000000 || IV index || privacy random
        privacy_plaintext[5..9].copy_from_slice(&iv_index.to_be_bytes());
        let random = encrypted_and_mic.len().min(7);
        privacy_plaintext[9..9 + random].copy_from_slice(&encrypted_and_mic[..random]);

        privacy_plaintext
    }

    fn xor(pecb: [u8; 16], bytes: [u8; 6]) -> [u8; 6] {
        let mut output = [0; 6];
        for (i, b) in bytes.iter().enumerate() {
            output[i] = pecb[i] ^ *b;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::LabelUuid;
    use crate::driver::pipeline::network::NetworkMessageCache;
    use crate::keys::{ApplicationKey, NetworkKey, NodeDetails};
    use crate::pdu::lower::{
        LowerAccess, LowerAccessMessage, LowerControl, LowerControlMessage, LowerPDU, Opcode,
    };
    use crate::pdu::network::TransportPDU;
    use crate::pdu::proxy::ProxyConfigurationPDU;

    struct Keys {
        iv_index: u32,
        network_keys: std::vec::Vec<NetworkKey>,
    }

    impl KeyStore for Keys {
        fn iv_index(&self) -> u32 {
            self.iv_index
        }

        fn primary_network_key(&self) -> Option<NetworkKey> {
            self.network_keys.first().copied()
        }

        fn network_key(&self, index: u16) -> Option<NetworkKey> {
            self.network_keys.iter().find(|k| k.index() == index).copied()
        }

        fn network_keys(&self) -> std::vec::Vec<NetworkKey> {
            self.network_keys.clone()
        }

        fn application_keys(&self, _: u16) -> std::vec::Vec<ApplicationKey> {
            std::vec::Vec::new()
        }

        fn label_uuids(&self) -> std::vec::Vec<LabelUuid> {
            std::vec::Vec::new()
        }

        fn node(&self, _: UnicastAddress) -> Option<NodeDetails> {
            None
        }
    }

    fn network_key(index: u16, key: u8) -> NetworkKey {
        NetworkKey::new(index, [key; 16]).unwrap()
    }

    fn cleartext(network_key: &NetworkKey, iv_index: u32) -> CleartextNetworkPDU {
        CleartextNetworkPDU {
            pdu_type: PduType::Network,
            network_key: *network_key.derivatives(),
            net_key_index: network_key.index(),
            iv_index,
            ttl: 3,
            seq: 0x000102,
            src: UnicastAddress(0x1201),
            dst: Address::from(0xFFFD),
            transport_pdu: TransportPDU::Lower(LowerPDU::Access(LowerAccess {
                akf: true,
                aid: 0x21.into(),
                message: LowerAccessMessage::Unsegmented(
                    Vec::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap(),
                ),
            })),
        }
    }

    fn round_trip(
        keys: &Keys,
        pdu: &CleartextNetworkPDU,
    ) -> Result<CleartextNetworkPDU, DeviceError> {
        let encrypted = Authentication::process_outbound(pdu)?;
        let mut wire: Vec<u8, 36> = Vec::new();
        encrypted.emit(&mut wire).unwrap();
        let parsed = ObfuscatedAndEncryptedNetworkPDU::parse(&wire).unwrap();
        Authentication::process_inbound(keys, &parsed)
    }

    fn sample_network_key() -> NetworkKey {
        let mut key = [0; 16];
        key.copy_from_slice(&hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap());
        NetworkKey::new(0, key).unwrap()
    }

    // Friend Request from 0x1201 with IV index 0x12345678 and sequence number 1
    fn friend_request(network_key: &NetworkKey) -> CleartextNetworkPDU {
        CleartextNetworkPDU {
            pdu_type: PduType::Network,
            network_key: *network_key.derivatives(),
            net_key_index: network_key.index(),
            iv_index: 0x12345678,
            ttl: 0,
            seq: 1,
            src: UnicastAddress(0x1201),
            dst: Address::from(0xFFFD),
            transport_pdu: TransportPDU::Lower(LowerPDU::Control(LowerControl {
                opcode: Opcode::FriendRequest,
                message: LowerControlMessage::Unsegmented {
                    parameters: Vec::from_slice(&hex::decode("4b50057e400000010000").unwrap())
                        .unwrap(),
                },
            })),
        }
    }

    const FRIEND_REQUEST_WIRE: &str = "0068eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df";

    #[test]
    fn test_friend_request_sample_outbound() {
        let network_key = sample_network_key();
        assert_eq!(0x68, network_key.derivatives().nid());

        let encrypted = Authentication::process_outbound(&friend_request(&network_key)).unwrap();
        let mut wire: Vec<u8, 36> = Vec::new();
        encrypted.emit(&mut wire).unwrap();
        assert_eq!(hex::decode(FRIEND_REQUEST_WIRE).unwrap(), &wire[..]);
    }

    #[test]
    fn test_friend_request_sample_inbound() {
        let network_key = sample_network_key();
        let keys = Keys {
            iv_index: 0x12345678,
            network_keys: std::vec![network_key],
        };
        let wire = hex::decode(FRIEND_REQUEST_WIRE).unwrap();
        let parsed = ObfuscatedAndEncryptedNetworkPDU::parse(&wire).unwrap();
        assert_eq!(
            friend_request(&network_key),
            Authentication::process_inbound(&keys, &parsed).unwrap()
        );
    }

    #[test]
    fn test_round_trip_with_second_key() {
        let keys = Keys {
            iv_index: 0x12345678,
            network_keys: std::vec![network_key(0, 0x11), network_key(1, 0x22)],
        };
        let pdu = cleartext(&keys.network_keys[1], keys.iv_index);
        let decrypted = round_trip(&keys, &pdu).unwrap();
        assert_eq!(pdu, decrypted);
        assert_eq!(1, decrypted.net_key_index);
    }

    #[test]
    fn test_header_is_obfuscated() {
        let key = network_key(0, 0x11);
        let pdu = cleartext(&key, 0);
        let encrypted = Authentication::process_outbound(&pdu).unwrap();
        assert_eq!(key.derivatives().nid(), encrypted.nid);
        assert_eq!(0, encrypted.ivi);
        assert_ne!([0x03, 0x00, 0x01, 0x02, 0x12, 0x01], encrypted.obfuscated);
        // dst + 10 octet lower pdu + 32 bit NetMIC
        assert_eq!(2 + 10 + 4, encrypted.encrypted_and_mic.len());
    }

    #[test]
    fn test_unknown_key_and_tampering() {
        let sender = network_key(0, 0x11);
        let pdu = cleartext(&sender, 0);

        let strangers = Keys {
            iv_index: 0,
            network_keys: std::vec![network_key(0, 0x33)],
        };
        let encrypted = Authentication::process_outbound(&pdu).unwrap();
        if strangers.network_keys[0].derivatives().nid() != sender.derivatives().nid() {
            assert_eq!(
                Err(DeviceError::UnknownNetworkKey),
                Authentication::process_inbound(&strangers, &encrypted)
            );
        }

        let keys = Keys {
            iv_index: 0,
            network_keys: std::vec![sender],
        };
        let mut tampered = encrypted;
        tampered.encrypted_and_mic[3] ^= 0x01;
        assert_eq!(
            Err(DeviceError::AuthenticationFailed(Layer::Network)),
            Authentication::process_inbound(&keys, &tampered)
        );
    }

    #[test]
    fn test_control_pdu_uses_64_bit_mic() {
        let key = network_key(0, 0x11);
        let mut pdu = cleartext(&key, 7);
        pdu.transport_pdu = TransportPDU::Proxy(ProxyConfigurationPDU::set_filter_type(
            crate::pdu::proxy::FilterType::AcceptList,
        ));
        pdu.pdu_type = PduType::ProxyConfiguration;
        pdu.ttl = 0;
        pdu.dst = Address::Unassigned;

        let encrypted = Authentication::process_outbound(&pdu).unwrap();
        assert_eq!(2 + 2 + 8, encrypted.encrypted_and_mic.len());
        assert_eq!(1, encrypted.ivi);

        let keys = Keys {
            iv_index: 7,
            network_keys: std::vec![key],
        };
        assert_eq!(pdu, Authentication::process_inbound(&keys, &encrypted).unwrap());
    }

    #[test]
    fn test_previous_iv_index_accepted() {
        assert_eq!(Some(4), Authentication::inbound_iv_index(4, 0));
        assert_eq!(Some(3), Authentication::inbound_iv_index(4, 1));
        assert_eq!(None, Authentication::inbound_iv_index(0, 1));

        let key = network_key(0, 0x11);
        let pdu = cleartext(&key, 3);
        let keys = Keys {
            iv_index: 4,
            network_keys: std::vec![key],
        };
        assert_eq!(3, round_trip(&keys, &pdu).unwrap().iv_index);
    }

    #[test]
    fn test_network_message_cache() {
        let key = network_key(0, 0x11);
        let mut cache: NetworkMessageCache<4> = NetworkMessageCache::new();
        let mut pdu = cleartext(&key, 0);
        assert!(!cache.has_seen(&pdu));
        assert!(cache.has_seen(&pdu));
        pdu.seq += 1;
        assert!(!cache.has_seen(&pdu));
    }
}
