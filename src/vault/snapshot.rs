//! Secret-scrubbed snapshots of a region
//!
//! Listing keys may be consumed slowly (a paced result stream, a terminal).
//! Instead of holding the region lock for the whole listing, the store
//! copies the region under the lock, wipes every secret payload in the copy
//! and releases the lock; iteration then runs over the private copy.

use super::region::{SlotTable, WriteGuard};
use super::slot::{SlotId, SlotMut};
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use zeroize::Zeroizing;

/// Metadata of one stored key, never the key itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub id: String,
    /// Length of the secret in bytes
    pub secret_len: usize,
    pub comment: Option<String>,
}

/// Point-in-time copy of a region with all secrets zeroed
pub struct Snapshot {
    bytes: Zeroizing<Vec<u8>>,
    capacity: usize,
}

impl Snapshot {
    /// Copy the whole region (header and every slot) and scrub the copy
    ///
    /// Takes the exclusive guard so `count` and the slots are observed in a
    /// single consistent state.
    pub fn capture(guard: &WriteGuard<'_>) -> Self {
        let capacity = guard.capacity();
        let mut bytes = Zeroizing::new(guard.table().as_bytes().to_vec());

        for i in 0..capacity {
            SlotMut::new(&mut bytes[SlotId(i).range()]).scrub_secret();
        }

        Self { bytes, capacity }
    }

    pub fn table(&self) -> SlotTable<'_> {
        SlotTable::new(&self.bytes, self.capacity)
    }

    /// Number of entries captured
    pub fn len(&self) -> usize {
        self.table().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the copy, equal to the region budget
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl IntoIterator for Snapshot {
    type Item = KeyMetadata;
    type IntoIter = MetadataIter;

    fn into_iter(self) -> MetadataIter {
        let remaining = self.len();
        MetadataIter {
            snapshot: self,
            next: 0,
            end: remaining,
        }
    }
}

/// Lazy, one-shot listing of the keys captured in a [`Snapshot`]
pub struct MetadataIter {
    snapshot: Snapshot,
    next: usize,
    end: usize,
}

impl Iterator for MetadataIter {
    type Item = KeyMetadata;

    fn next(&mut self) -> Option<KeyMetadata> {
        if self.next >= self.end {
            return None;
        }
        let slot = self.snapshot.table().slot(SlotId(self.next));
        self.next += 1;

        Some(KeyMetadata {
            id: slot.id(),
            secret_len: slot.secret_len(),
            comment: slot.comment(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MetadataIter {}

impl FusedIterator for MetadataIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::vault::capacity::PAGE_SIZE;
    use crate::vault::region::{Region, HEADER_SIZE};
    use crate::vault::slot::Entry;

    fn seeded_region() -> Result<Region> {
        let region = Region::anonymous(PAGE_SIZE)?;
        {
            let mut guard = region.write()?;
            guard
                .slot_mut(SlotId(0))
                .write(&Entry::new("k1", &[0xAA; 16], Some("first"))?);
            guard.slot_mut(SlotId(1)).write(&Entry::new("k2", &[0xBB], None)?);
            guard.set_count(2);
        }
        Ok(region)
    }

    #[test]
    fn test_snapshot_scrubs_secrets() -> Result<()> {
        let region = seeded_region()?;
        let snapshot = Snapshot::capture(&region.write()?);

        assert_eq!(snapshot.size(), region.budget());
        assert_eq!(snapshot.len(), 2);
        for slot in snapshot.table().iter() {
            assert!(slot.secret().iter().all(|&b| b == 0));
        }
        let slots = &snapshot.table().as_bytes()[HEADER_SIZE..];
        assert!(!slots.contains(&0xAA));
        assert!(!slots.contains(&0xBB));

        // The live region keeps its secrets.
        let guard = region.read()?;
        assert_eq!(guard.table().slot(SlotId(0)).secret(), &[0xAA; 16]);
        Ok(())
    }

    #[test]
    fn test_metadata_iter() -> Result<()> {
        let region = seeded_region()?;
        let snapshot = Snapshot::capture(&region.write()?);

        let mut iter = snapshot.into_iter();
        assert_eq!(iter.len(), 2);
        assert_eq!(
            iter.next(),
            Some(KeyMetadata {
                id: "k1".to_string(),
                secret_len: 16,
                comment: Some("first".to_string()),
            })
        );
        assert_eq!(
            iter.next(),
            Some(KeyMetadata {
                id: "k2".to_string(),
                secret_len: 1,
                comment: None,
            })
        );
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
        Ok(())
    }

    #[test]
    fn test_snapshot_is_independent_of_later_writes() -> Result<()> {
        let region = seeded_region()?;
        let snapshot = Snapshot::capture(&region.write()?);

        {
            let mut guard = region.write()?;
            guard.erase_slots();
            guard.set_count(0);
        }

        let ids: Vec<String> = snapshot.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["k1", "k2"]);
        Ok(())
    }
}
