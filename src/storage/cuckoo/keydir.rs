//! The in-memory index mapping hashed keys to the on-disk locations of
//! their records.

use std::collections::BTreeMap;

/// Location pairs produced by persisting one batch, in append order.
pub(super) type IndexBatch = Vec<(u64, u64)>;

/// Pack a file ID and an offset within that file into a 64-bit location.
pub(super) fn pack_location(fileid: u32, offset: u32) -> u64 {
    u64::from(fileid) << 32 | u64::from(offset)
}

pub(super) fn location_fileid(location: u64) -> u32 {
    (location >> 32) as u32
}

pub(super) fn location_offset(location: u64) -> u32 {
    location as u32
}

/// An ordered multimap from hashed keys to record locations. Hash
/// collisions and successive writes of the same key both park several
/// locations under one hashed key; insertion order is preserved within a
/// key so lookups can walk the candidates newest first.
#[derive(Debug, Default)]
pub(super) struct KeyDir {
    entries: BTreeMap<u64, Vec<u64>>,
}

impl KeyDir {
    /// Record `location` as the newest entry under `hashed_key`.
    pub(super) fn insert(&mut self, hashed_key: u64, location: u64) {
        self.entries.entry(hashed_key).or_default().push(location);
    }

    /// All locations recorded under `hashed_key`, oldest first.
    pub(super) fn locations(&self, hashed_key: u64) -> &[u64] {
        self.entries
            .get(&hashed_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of locations across all hashed keys.
    pub(super) fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_packing_round_trip() {
        let location = pack_location(0x00a1b2c3, 0x00fff000);
        assert_eq!(0x00a1b2c3, location_fileid(location));
        assert_eq!(0x00fff000, location_offset(location));
    }

    #[test]
    fn insertion_order_is_preserved_within_a_key() {
        let mut keydir = KeyDir::default();
        keydir.insert(7, pack_location(1, 100));
        keydir.insert(9, pack_location(1, 200));
        keydir.insert(7, pack_location(2, 300));
        keydir.insert(7, pack_location(2, 400));

        let locations = keydir.locations(7);
        assert_eq!(
            &[
                pack_location(1, 100),
                pack_location(2, 300),
                pack_location(2, 400)
            ],
            locations
        );
        // The newest location comes up first when walking backwards.
        assert_eq!(Some(&pack_location(2, 400)), locations.iter().next_back());
        assert_eq!(&[pack_location(1, 200)], keydir.locations(9));
        assert!(keydir.locations(8).is_empty());
        assert_eq!(4, keydir.len());
    }
}
