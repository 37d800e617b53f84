//! Key material consumed by the transport and the [`KeyStore`] collaborator that provides it.

use crate::address::{LabelUuid, UnicastAddress};
use crate::app::ApplicationKeyIdentifier;
use crate::crypto;
use cmac::crypto_mac::InvalidKeyLength;
use serde::{Deserialize, Serialize};

/// Material derived from a network key with K2.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkKeyDerivatives {
    pub(crate) nid: u8,
    pub(crate) encryption_key: [u8; 16],
    pub(crate) privacy_key: [u8; 16],
}

impl NetworkKeyDerivatives {
    pub fn derive(network_key: &[u8; 16]) -> Result<Self, InvalidKeyLength> {
        let (nid, encryption_key, privacy_key) = crypto::k2(network_key, &[0x00])?;
        Ok(Self {
            nid,
            encryption_key,
            privacy_key,
        })
    }

    pub fn nid(&self) -> u8 {
        self.nid
    }
}

impl core::fmt::Debug for NetworkKeyDerivatives {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkKeyDerivatives")
            .field("nid", &self.nid)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkKey {
    pub(crate) index: u16,
    pub(crate) key: [u8; 16],
    pub(crate) derivatives: NetworkKeyDerivatives,
    pub(crate) old: Option<NetworkKeyDerivatives>,
}

impl NetworkKey {
    pub fn new(index: u16, key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        Ok(Self {
            index,
            key,
            derivatives: NetworkKeyDerivatives::derive(&key)?,
            old: None,
        })
    }

    /// Keeps `old_key` usable for inbound traffic during key refresh.
    pub fn with_old_key(mut self, old_key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        self.old.replace(NetworkKeyDerivatives::derive(&old_key)?);
        Ok(self)
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn derivatives(&self) -> &NetworkKeyDerivatives {
        &self.derivatives
    }

    pub fn old_derivatives(&self) -> Option<&NetworkKeyDerivatives> {
        self.old.as_ref()
    }

    /// Current then old derivatives whose NID equals `nid`.
    pub fn candidates(&self, nid: u8) -> impl Iterator<Item = &NetworkKeyDerivatives> {
        core::iter::once(&self.derivatives)
            .chain(self.old.iter())
            .filter(move |derivatives| derivatives.nid == nid)
    }
}

impl core::fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkKey")
            .field("index", &self.index)
            .field("nid", &self.derivatives.nid)
            .field("refreshing", &self.old.is_some())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApplicationKey {
    pub(crate) index: u16,
    pub(crate) net_key_index: u16,
    pub(crate) key: [u8; 16],
    pub(crate) aid: ApplicationKeyIdentifier,
    pub(crate) old: Option<([u8; 16], ApplicationKeyIdentifier)>,
}

impl ApplicationKey {
    pub fn new(index: u16, net_key_index: u16, key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        Ok(Self {
            index,
            net_key_index,
            key,
            aid: crypto::k4(&key)?.into(),
            old: None,
        })
    }

    pub fn with_old_key(mut self, old_key: [u8; 16]) -> Result<Self, InvalidKeyLength> {
        self.old.replace((old_key, crypto::k4(&old_key)?.into()));
        Ok(self)
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn net_key_index(&self) -> u16 {
        self.net_key_index
    }

    pub fn aid(&self) -> ApplicationKeyIdentifier {
        self.aid
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// Key material matching `aid`, current key first.
    pub fn candidates(&self, aid: ApplicationKeyIdentifier) -> impl Iterator<Item = &[u8; 16]> {
        core::iter::once((&self.key, self.aid))
            .chain(self.old.iter().map(|(key, aid)| (key, *aid)))
            .filter(move |(_, candidate)| *candidate == aid)
            .map(|(key, _)| key)
    }
}

impl core::fmt::Debug for ApplicationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApplicationKey")
            .field("index", &self.index)
            .field("net_key_index", &self.net_key_index)
            .field("aid", &self.aid)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceKey([u8; 16]);

impl DeviceKey {
    pub fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.0
    }
}

impl core::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

/// What the transport needs to know about a node.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NodeDetails {
    pub device_key: Option<DeviceKey>,
    pub ttl: u8,
    /// Next sequence number this node will use, when the node is local.
    pub sequence: u32,
}

/// Lookup of keys and node state owned by the surrounding application.
pub trait KeyStore: Send + Sync + 'static {
    fn iv_index(&self) -> u32;

    fn primary_network_key(&self) -> Option<NetworkKey>;

    fn network_key(&self, index: u16) -> Option<NetworkKey>;

    /// Every network key known to the node, tried in order on receive.
    fn network_keys(&self) -> Vec<NetworkKey>;

    fn application_keys(&self, net_key_index: u16) -> Vec<ApplicationKey>;

    /// Label UUIDs tried as additional data for virtual destinations.
    fn label_uuids(&self) -> Vec<LabelUuid> {
        Vec::new()
    }

    fn node(&self, address: UnicastAddress) -> Option<NodeDetails>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> [u8; 16] {
        let mut key = [0; 16];
        key.copy_from_slice(&hex::decode(s).unwrap());
        key
    }

    #[test]
    fn test_network_key_candidates() {
        let current = key("f7a2a44f8e8a8029064f173ddc1e2b00");
        let network_key = NetworkKey::new(0, current).unwrap();
        assert_eq!(0x7F, network_key.derivatives().nid());
        assert_eq!(1, network_key.candidates(0x7F).count());
        assert_eq!(0, network_key.candidates(0x01).count());

        let refreshing = network_key.with_old_key(current).unwrap();
        assert_eq!(2, refreshing.candidates(0x7F).count());
    }

    #[test]
    fn test_application_key_aid() {
        let app_key = ApplicationKey::new(0, 0, key("3216d1509884b533248541792b877f98")).unwrap();
        assert_eq!(ApplicationKeyIdentifier::from(0x38), app_key.aid());
        assert_eq!(
            std::vec![app_key.key()],
            app_key.candidates(0x38.into()).collect::<std::vec::Vec<_>>()
        );
        assert_eq!(0, app_key.candidates(0x01.into()).count());
    }

    #[test]
    fn test_application_key_old_material() {
        let old = key("3216d1509884b533248541792b877f98");
        let app_key = ApplicationKey::new(1, 0, [0x11; 16])
            .unwrap()
            .with_old_key(old)
            .unwrap();
        let found: std::vec::Vec<_> = app_key.candidates(0x38.into()).collect();
        assert_eq!(Some(&&old), found.last());
    }
}
