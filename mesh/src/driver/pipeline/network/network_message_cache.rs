use crate::address::UnicastAddress;
use crate::pdu::network::CleartextNetworkPDU;
use uluru::LRUCache;

#[derive(PartialEq)]
struct CacheEntry {
    seq: u32,
    src: UnicastAddress,
    iv_index: u32,
}

/// Recently accepted network PDUs, used to drop relayed and repeated copies early.
pub struct NetworkMessageCache<const CACHE_SIZE: usize> {
    lru: LRUCache<CacheEntry, CACHE_SIZE>,
}

impl<const CACHE_SIZE: usize> Default for NetworkMessageCache<CACHE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CACHE_SIZE: usize> NetworkMessageCache<CACHE_SIZE> {
    pub fn new() -> Self {
        Self {
            lru: Default::default(),
        }
    }

    /// Records `pdu` and reports whether it had been seen already.
    pub fn has_seen(&mut self, pdu: &CleartextNetworkPDU) -> bool {
        let entry = CacheEntry {
            seq: pdu.seq,
            src: pdu.src,
            iv_index: pdu.iv_index,
        };
        if self.lru.find(|e| *e == entry).is_none() {
            self.lru.insert(entry);
            false
        } else {
            true
        }
    }

    pub fn clear(&mut self) {
        self.lru.clear();
    }
}
