//! Lock-guarded key store
//!
//! Every operation runs as one critical section over the region lock:
//!
//! - `add`, `delete`, `clear_all` and the snapshot step of `list_metadata`
//!   take the lock exclusively
//! - `lookup` and `with_secret` take it shared
//!
//! Input is validated before the lock is taken, so a rejected call never
//! touches shared state. Each critical section is one linear scan over at
//! most `capacity` slots plus a few slot copies.

use super::lock::StartupLock;
use super::region::{startup_lock_path, Region};
use super::secret::{Cipher, Secret};
use super::slot::{validate_id, Entry, SlotId, SLOT_SIZE};
use super::snapshot::{MetadataIter, Snapshot};
use crate::config::VaultConfig;
use crate::error::{Error, Result};
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Occupancy figures of a vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStats {
    pub name: String,
    pub capacity: usize,
    pub count: usize,
    pub slot_size: usize,
    pub budget: usize,
    pub shared: bool,
}

/// Handle to a vault region
///
/// Cheap to clone; clones share the same region and lock. Independent
/// handles (other processes, or a second [`Vault::open`]) attached to the
/// same named region observe the same entries.
#[derive(Debug, Clone)]
pub struct Vault {
    region: Arc<Region>,
}

impl Vault {
    /// Wrap a region created or attached by the caller
    pub fn new(region: Region) -> Self {
        Self {
            region: Arc::new(region),
        }
    }

    /// Private vault backed by an anonymous mapping
    pub fn in_memory(budget: usize) -> Result<Self> {
        Ok(Self::new(Region::anonymous(budget)?))
    }

    /// Create the configured region, or attach to it when it exists
    ///
    /// Holds the startup lock around create-or-attach, so concurrent first
    /// calls from several processes end up with one initializer.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.shm_dir)?;

        let region = {
            let _startup =
                StartupLock::acquire(&startup_lock_path(&config.shm_dir, &config.region_name))?;
            Region::create_or_attach(&config.region_name, &config.shm_dir, config.max_size)?
        };

        metrics::observe_occupancy(
            region.name(),
            region.read()?.table().count(),
            region.capacity(),
        );
        Ok(Self::new(region))
    }

    /// Attach to the configured region, failing if nobody created it yet
    pub fn attach(config: &VaultConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(Region::attach(&config.region_name, &config.shm_dir)?))
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of slots, fixed at creation
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Store a new secret under a unique id
    ///
    /// Fails with `DuplicateKey` if the id is taken and `CapacityExceeded`
    /// if every slot is occupied; in both cases nothing is written.
    #[instrument(level = "debug", skip(self, secret), fields(secret_len = secret.len()))]
    pub fn add(&self, id: &str, secret: &[u8], comment: Option<&str>) -> Result<()> {
        let entry = Entry::new(id, secret, comment).map_err(|e| {
            metrics::record("add", "invalid");
            e
        })?;

        // Checks happen under the lock; errors are reported once it is released.
        let (duplicate, full, capacity) = {
            let mut guard = self.region.write()?;
            let count = guard.count();
            let capacity = guard.capacity();
            let duplicate = guard.table().find(id).is_some();
            let full = count >= capacity;

            if !duplicate && !full {
                guard.slot_mut(SlotId(count)).write(&entry);
                guard.set_count(count + 1);
                metrics::observe_occupancy(self.region.name(), count + 1, capacity);
            }
            (duplicate, full, capacity)
        };

        if duplicate {
            metrics::record("add", "duplicate");
            warn!(id, "Rejected key with non-unique ID");
            return Err(Error::DuplicateKey(id.to_string()));
        }
        if full {
            metrics::record("add", "full");
            warn!(id, capacity, "Rejected key, the vault is full");
            return Err(Error::CapacityExceeded { capacity });
        }

        metrics::record("add", "ok");
        debug!(id, "Added key");
        Ok(())
    }

    /// Remove the entry with this id
    ///
    /// The last occupied slot is moved into the freed position and then
    /// zeroed, so no copy of the removed secret stays in the region.
    /// Deleting an unknown id is not an error; the return value tells
    /// whether anything was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id).map_err(|e| {
            metrics::record("delete", "invalid");
            e
        })?;

        let removed = {
            let mut guard = self.region.write()?;
            let found = guard.table().find(id);
            match found {
                Some(slot) => {
                    let last = SlotId(guard.count() - 1);
                    guard.move_slot(last, slot);
                    guard.slot_mut(last).erase();
                    guard.set_count(last.0);
                    metrics::observe_occupancy(self.region.name(), last.0, guard.capacity());
                    true
                }
                None => false,
            }
        };

        metrics::record("delete", if removed { "ok" } else { "missing" });
        debug!(id, removed, "Deleted key");
        Ok(removed)
    }

    /// Copy of the secret stored under `id`, if any
    pub fn lookup(&self, id: &str) -> Result<Option<Secret>> {
        self.with_secret(id, Secret::new)
    }

    /// Run `f` over the secret bytes while holding the shared lock
    ///
    /// Nothing is copied out of the region unless `f` does so itself.
    pub fn with_secret<R>(&self, id: &str, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        validate_id(id).map_err(|e| {
            metrics::record("lookup", "invalid");
            e
        })?;

        let result = {
            let guard = self.region.read()?;
            let table = guard.table();
            table.find(id).map(|slot| f(table.slot(slot).secret()))
        };

        metrics::record("lookup", if result.is_some() { "hit" } else { "miss" });
        debug!(id, found = result.is_some(), "Looked up key");
        Ok(result)
    }

    /// Encrypt `plaintext` with the key stored under `id`
    pub fn encrypt<C: Cipher + ?Sized>(
        &self,
        id: &str,
        plaintext: &[u8],
        cipher: &C,
    ) -> Result<Vec<u8>> {
        self.with_secret(id, |key| cipher.encrypt(plaintext, key))?
            .ok_or_else(|| Error::KeyNotFound(id.to_string()))?
    }

    /// Decrypt `ciphertext` with the key stored under `id`
    pub fn decrypt<C: Cipher + ?Sized>(
        &self,
        id: &str,
        ciphertext: &[u8],
        cipher: &C,
    ) -> Result<Vec<u8>> {
        self.with_secret(id, |key| cipher.decrypt(ciphertext, key))?
            .ok_or_else(|| Error::KeyNotFound(id.to_string()))?
    }

    /// List id, secret length and comment of every entry
    ///
    /// The lock is held only while the region is copied and scrubbed; the
    /// returned iterator walks the private copy.
    pub fn list_metadata(&self) -> Result<MetadataIter> {
        let snapshot = {
            let guard = self.region.write()?;
            Snapshot::capture(&guard)
        };

        metrics::record("list", "ok");
        debug!(entries = snapshot.len(), "Captured key listing");
        Ok(snapshot.into_iter())
    }

    /// Remove every entry and zero the whole slot array
    pub fn clear_all(&self) -> Result<()> {
        let cleared = {
            let mut guard = self.region.write()?;
            let cleared = guard.count();
            guard.erase_slots();
            guard.set_count(0);
            metrics::observe_occupancy(self.region.name(), 0, guard.capacity());
            cleared
        };

        metrics::record("clear", "ok");
        debug!(cleared, "Cleared all keys");
        Ok(())
    }

    /// Number of occupied slots
    pub fn len(&self) -> Result<usize> {
        Ok(self.region.read()?.table().count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<VaultStats> {
        let count = self.len()?;
        Ok(VaultStats {
            name: self.region.name().to_string(),
            capacity: self.region.capacity(),
            count,
            slot_size: SLOT_SIZE,
            budget: self.region.budget(),
            shared: self.region.is_shared(),
        })
    }

    /// Erase the region and remove its files; all secrets become unrecoverable
    pub fn destroy(&self) -> Result<()> {
        self.region.destroy()?;
        metrics::forget_region(self.region.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::capacity::PAGE_SIZE;
    use crate::vault::region::HEADER_SIZE;

    /// XOR with the repeated key; enough to exercise the seam
    struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
            if key.is_empty() {
                return Err(Error::Cipher("empty key".to_string()));
            }
            Ok(plaintext
                .iter()
                .zip(key.iter().cycle())
                .map(|(p, k)| p ^ k)
                .collect())
        }

        fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
            self.encrypt(ciphertext, key)
        }
    }

    fn slot_bytes(vault: &Vault) -> Result<Vec<u8>> {
        let guard = vault.region().read()?;
        Ok(guard.table().as_bytes()[HEADER_SIZE..].to_vec())
    }

    #[test]
    fn test_add_and_lookup() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("db", b"s3cr3t", Some("primary database"))?;

        let secret = vault.lookup("db")?.expect("key should exist");
        assert_eq!(secret.expose(), b"s3cr3t");
        assert!(vault.lookup("other")?.is_none());
        assert_eq!(vault.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_invalid_input_never_locks_or_writes() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        let long_id = "x".repeat(64);

        assert!(matches!(vault.add(&long_id, b"k", None), Err(Error::Validation(_))));
        assert!(matches!(vault.add("a\0b", b"k", None), Err(Error::Validation(_))));
        assert!(matches!(vault.lookup("a\0b"), Err(Error::Validation(_))));
        assert!(matches!(vault.delete("a\0b"), Err(Error::Validation(_))));
        assert!(vault.is_empty()?);

        // An over-long id can be looked up; it just never matches.
        assert!(vault.lookup(&long_id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_empty_id_and_secret_are_stored() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("", b"x", None)?;
        vault.add("k", b"", Some("placeholder"))?;

        assert_eq!(vault.lookup("")?.expect("empty id stored").expose(), b"x");
        let secret = vault.lookup("k")?.expect("empty secret stored");
        assert!(secret.is_empty());
        assert!(matches!(vault.add("", b"y", None), Err(Error::DuplicateKey(_))));

        let listed: Vec<_> = vault.list_metadata()?.map(|m| (m.id, m.secret_len)).collect();
        assert_eq!(listed, vec![(String::new(), 1), ("k".to_string(), 0)]);

        assert!(vault.delete("")?);
        assert!(vault.lookup("")?.is_none());
        Ok(())
    }

    #[test]
    fn test_rejected_ids_are_counted() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        let invalid = |op: &str| {
            metrics::VAULT_OPERATIONS
                .with_label_values(&[op, "invalid"])
                .get()
        };
        let (lookups, deletes) = (invalid("lookup"), invalid("delete"));

        assert!(vault.lookup("a\0b").is_err());
        assert!(vault.delete("a\0b").is_err());

        // Counters are process-wide; other tests may only add to them.
        assert!(invalid("lookup") > lookups);
        assert!(invalid("delete") > deletes);
        Ok(())
    }

    #[test]
    fn test_full_vault_is_unchanged() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        assert_eq!(vault.capacity(), 3);
        for i in 0..3 {
            vault.add(&format!("k{}", i), &[i as u8 + 1], None)?;
        }
        let before = slot_bytes(&vault)?;

        let err = vault.add("k3", b"x", None).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { capacity: 3 }));
        assert_eq!(slot_bytes(&vault)?, before);
        assert_eq!(vault.len()?, 3);
        Ok(())
    }

    #[test]
    fn test_duplicate_reported_before_full() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        for id in ["a", "b", "c"] {
            vault.add(id, b"v", None)?;
        }
        assert!(matches!(vault.add("a", b"w", None), Err(Error::DuplicateKey(_))));
        Ok(())
    }

    #[test]
    fn test_delete_moves_last_slot_and_erases_it() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("k1", &[0xAA; 32], None)?;
        vault.add("k2", &[0xBB; 8], None)?;
        vault.add("k3", &[0xCC; 8], Some("third"))?;

        assert!(vault.delete("k1")?);
        assert_eq!(vault.len()?, 2);

        let guard = vault.region().read()?;
        let table = guard.table();
        assert!(table.slot(SlotId(0)).matches("k3"));
        assert!(table.slot(SlotId(1)).matches("k2"));
        assert!(table.as_bytes()[SlotId(2).range()].iter().all(|&b| b == 0));
        assert!(!table.as_bytes()[HEADER_SIZE..].contains(&0xAA));
        Ok(())
    }

    #[test]
    fn test_delete_last_entry_erases_it() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("only", &[0x5A; 64], None)?;

        assert!(vault.delete("only")?);
        assert!(slot_bytes(&vault)?.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_delete_missing_is_noop() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("keep", b"v", None)?;

        assert!(!vault.delete("missing")?);
        assert!(vault.delete("keep")?);
        assert!(!vault.delete("keep")?);
        assert!(vault.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_clear_all() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("a", &[0xEE; 10], Some("x"))?;
        vault.add("b", &[0xEE; 10], None)?;

        vault.clear_all()?;
        assert_eq!(vault.len()?, 0);
        assert_eq!(vault.list_metadata()?.count(), 0);
        assert!(slot_bytes(&vault)?.iter().all(|&b| b == 0));

        // Capacity is untouched, so the vault fills up again.
        for id in ["c", "d", "e"] {
            vault.add(id, b"v", None)?;
        }
        Ok(())
    }

    #[test]
    fn test_list_metadata_hides_secrets() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("api", b"token-value", Some("billing api"))?;

        let listed: Vec<_> = vault.list_metadata()?.collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "api");
        assert_eq!(listed[0].secret_len, 11);
        assert_eq!(listed[0].comment.as_deref(), Some("billing api"));

        let rendered = format!("{:?}", listed);
        assert!(!rendered.contains("token-value"));
        Ok(())
    }

    #[test]
    fn test_listing_does_not_hold_the_lock() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("a", b"1", None)?;
        vault.add("b", b"2", None)?;

        let mut listing = vault.list_metadata()?;
        let first = listing.next().expect("first entry");

        // Writers proceed while the listing is half consumed.
        vault.delete("b")?;
        vault.add("c", b"3", None)?;

        let rest: Vec<_> = listing.map(|m| m.id).collect();
        assert_eq!(first.id, "a");
        assert_eq!(rest, vec!["b"]);
        Ok(())
    }

    #[test]
    fn test_cipher_seam() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("xor", &[0x0F, 0xF0], None)?;

        let ciphertext = vault.encrypt("xor", b"hello", &XorCipher)?;
        assert_ne!(ciphertext, b"hello");
        assert_eq!(vault.decrypt("xor", &ciphertext, &XorCipher)?, b"hello");

        assert!(matches!(
            vault.encrypt("nope", b"hello", &XorCipher),
            Err(Error::KeyNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_stats() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("a", b"1", None)?;

        let stats = vault.stats()?;
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.slot_size, SLOT_SIZE);
        assert_eq!(stats.budget, PAGE_SIZE);
        assert!(!stats.shared);
        Ok(())
    }

    #[test]
    fn test_destroyed_vault_is_not_initialized() -> Result<()> {
        let vault = Vault::in_memory(PAGE_SIZE)?;
        vault.add("a", b"1", None)?;
        vault.destroy()?;

        assert!(matches!(vault.lookup("a"), Err(Error::NotInitialized(_))));
        assert!(matches!(vault.add("b", b"2", None), Err(Error::NotInitialized(_))));
        Ok(())
    }
}
