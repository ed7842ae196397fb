//! Shared region management
//!
//! A region is one fixed-size block of memory holding a header followed by
//! `capacity` slots:
//!
//! ```text
//! 0                                   64
//! ├─ header ──────────────────────────┼─ slot 0 ─┼─ slot 1 ─┼ ... ┼─ slot N-1 ─┼ slack
//!   magic | version | slot_size |
//!   capacity | count | budget | pid
//! ```
//!
//! Occupied slots are always `[0, count)`. Private regions live in an
//! anonymous mapping; shared regions live in `<dir>/<name>.region`, mapped
//! by every process that attaches, with `<dir>/<name>.lock` as their lock.

use super::capacity::CapacityPlan;
use super::lock::{open_private, ExclusiveLockGuard, RegionLock, SharedLockGuard, StartupLock};
use super::slot::{SlotId, SlotMut, SlotRef, SLOT_SIZE};
use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Size of the region header in bytes
pub const HEADER_SIZE: usize = 64;

const MAGIC: [u8; 8] = *b"SHMVAULT";
const FORMAT_VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const SLOT_SIZE_OFFSET: usize = 12;
const CAPACITY_OFFSET: usize = 16;
const COUNT_OFFSET: usize = 20;
const BUDGET_OFFSET: usize = 24;
const CREATOR_PID_OFFSET: usize = 32;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Immutable part of the region header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub version: u32,
    pub slot_size: usize,
    pub capacity: usize,
    pub budget: usize,
    pub creator_pid: u32,
}

impl RegionHeader {
    fn write(&self, bytes: &mut [u8]) {
        bytes[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(&MAGIC);
        write_u32(bytes, VERSION_OFFSET, self.version);
        write_u32(bytes, SLOT_SIZE_OFFSET, self.slot_size as u32);
        write_u32(bytes, CAPACITY_OFFSET, self.capacity as u32);
        write_u32(bytes, COUNT_OFFSET, 0);
        write_u64(bytes, BUDGET_OFFSET, self.budget as u64);
        write_u32(bytes, CREATOR_PID_OFFSET, self.creator_pid);
    }

    /// Decode and check a header
    ///
    /// Returns `Ok(None)` for a region that was never initialized (or was
    /// destroyed), which is all zeros where the magic should be.
    fn read(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "region of {} B is smaller than its header",
                bytes.len()
            )));
        }

        let magic = &bytes[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()];
        if magic.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if magic != MAGIC {
            return Err(Error::Corrupted("bad region magic".to_string()));
        }

        let header = Self {
            version: read_u32(bytes, VERSION_OFFSET),
            slot_size: read_u32(bytes, SLOT_SIZE_OFFSET) as usize,
            capacity: read_u32(bytes, CAPACITY_OFFSET) as usize,
            budget: read_u64(bytes, BUDGET_OFFSET) as usize,
            creator_pid: read_u32(bytes, CREATOR_PID_OFFSET),
        };

        if header.version != FORMAT_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported region format version {}",
                header.version
            )));
        }
        if header.slot_size != SLOT_SIZE {
            return Err(Error::Corrupted(format!(
                "region slot size {} does not match {}",
                header.slot_size, SLOT_SIZE
            )));
        }
        if HEADER_SIZE + header.capacity * SLOT_SIZE > bytes.len() {
            return Err(Error::Corrupted(format!(
                "capacity {} does not fit a {} B region",
                header.capacity,
                bytes.len()
            )));
        }

        Ok(Some(header))
    }
}

/// Where the region memory comes from
#[derive(Debug)]
enum Backing {
    Anonymous,
    File {
        region_path: PathBuf,
        lock_path: PathBuf,
        startup_lock_path: PathBuf,
    },
}

/// One fixed-size vault region, created once and attached many times
pub struct Region {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    lock: RegionLock,
    backing: Backing,
    _map: MmapMut,
}

// The mapping is only touched through `ReadGuard`/`WriteGuard`, both of
// which hold the region lock for as long as they hand out slices.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("budget", &self.len)
            .field("capacity", &self.capacity)
            .field("backing", &self.backing)
            .finish()
    }
}

/// Path of the backing file for a named region
pub fn region_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.region", name))
}

/// Path of the lock file for a named region
pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", name))
}

/// Path of the startup lock file for a named region
pub fn startup_lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.startup.lock", name))
}

fn initialize(map: &mut [u8], plan: &CapacityPlan) {
    map.zeroize();
    RegionHeader {
        version: FORMAT_VERSION,
        slot_size: SLOT_SIZE,
        capacity: plan.capacity,
        budget: plan.budget,
        creator_pid: std::process::id(),
    }
    .write(map);
}

fn map_file(file: &File, len: usize) -> Result<MmapMut> {
    // Safety: the file is only ever resized before its first mapping, and
    // all access to the mapped bytes goes through the region lock.
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(map)
}

impl Region {
    /// Create a private region, reachable only through this handle
    ///
    /// Used for single-process deployments and tests; the memory is zeroed
    /// when the region is dropped.
    pub fn anonymous(budget: usize) -> Result<Self> {
        let plan = CapacityPlan::for_budget(budget)?;
        let mut map = MmapMut::map_anon(budget)?;
        initialize(&mut map, &plan);

        debug!(budget, capacity = plan.capacity, "Created anonymous vault region");
        Ok(Self::from_map(
            "anonymous".to_string(),
            map,
            plan.capacity,
            RegionLock::in_process(),
            Backing::Anonymous,
        ))
    }

    /// Create the named region, or attach to it if it already exists
    ///
    /// Creation zero-fills `budget` bytes and records the capacity in the
    /// header; attaching never touches the contents. Callers serialize
    /// concurrent first calls with a [`StartupLock`](super::lock::StartupLock).
    pub fn create_or_attach(name: &str, dir: &Path, budget: usize) -> Result<Self> {
        validate_region_name(name)?;
        let plan = CapacityPlan::for_budget(budget)?;

        let region_path = region_path(dir, name);
        let lock_path = lock_path(dir, name);
        let file = open_private(&region_path)?;
        let lock = RegionLock::with_lock_file(&lock_path)?;

        let existing = file.metadata()?.len() as usize;
        let mut map;
        let capacity;

        if existing == 0 {
            file.set_len(budget as u64)?;
            map = map_file(&file, budget)?;
            {
                let _guard = lock.write()?;
                initialize(&mut map, &plan);
            }
            capacity = plan.capacity;
            info!(
                name,
                budget,
                capacity,
                path = ?region_path,
                "Shared memory segment for vault successfully created"
            );
        } else {
            map = map_file(&file, existing)?;
            match RegionHeader::read(&map)? {
                Some(header) => {
                    if existing != budget {
                        warn!(
                            name,
                            configured = budget,
                            existing,
                            "Attaching to a region created with a different budget; recreate it to resize"
                        );
                    }
                    capacity = header.capacity;
                    info!(
                        name,
                        capacity,
                        creator_pid = header.creator_pid,
                        "Attached to existing vault region"
                    );
                }
                None => {
                    // Left behind by an initializer that never finished.
                    let plan = CapacityPlan::for_budget(existing)?;
                    {
                        let _guard = lock.write()?;
                        initialize(&mut map, &plan);
                    }
                    capacity = plan.capacity;
                    warn!(name, capacity, "Re-initialized an incomplete vault region");
                }
            }
        }

        Ok(Self::from_map(
            name.to_string(),
            map,
            capacity,
            lock,
            Backing::File {
                region_path,
                lock_path,
                startup_lock_path: startup_lock_path(dir, name),
            },
        ))
    }

    /// Attach to a named region that must already exist
    pub fn attach(name: &str, dir: &Path) -> Result<Self> {
        validate_region_name(name)?;
        let region_path = region_path(dir, name);
        let lock_path = lock_path(dir, name);

        let file = match OpenOptions::new().read(true).write(true).open(&region_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotInitialized(format!(
                    "vault region '{}' does not exist",
                    name
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::NotInitialized(format!(
                "vault region '{}' has not been initialized",
                name
            )));
        }

        let map = map_file(&file, len)?;
        let header = RegionHeader::read(&map)?.ok_or_else(|| {
            Error::NotInitialized(format!("vault region '{}' has not been initialized", name))
        })?;

        let lock = RegionLock::with_lock_file(&lock_path)?;
        info!(name, capacity = header.capacity, "Attached to existing vault region");
        Ok(Self::from_map(
            name.to_string(),
            map,
            header.capacity,
            lock,
            Backing::File {
                region_path,
                lock_path,
                startup_lock_path: startup_lock_path(dir, name),
            },
        ))
    }

    fn from_map(
        name: String,
        mut map: MmapMut,
        capacity: usize,
        lock: RegionLock,
        backing: Backing,
    ) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name,
            ptr,
            len,
            capacity,
            lock,
            backing,
            _map: map,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots, fixed at creation
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total size of the region in bytes
    pub fn budget(&self) -> usize {
        self.len
    }

    /// Whether other processes can attach to this region
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    /// Backing file of a shared region
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::File { region_path, .. } => Some(region_path),
        }
    }

    /// Take the region lock in shared mode
    pub fn read(&self) -> Result<ReadGuard<'_>> {
        let lock = self.lock.read()?;
        // Safety: shared lock held; writers are excluded until `lock` drops.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        self.ensure_live(bytes)?;
        Ok(ReadGuard {
            table: SlotTable::new(bytes, self.capacity),
            _lock: lock,
        })
    }

    /// Take the region lock in exclusive mode
    pub fn write(&self) -> Result<WriteGuard<'_>> {
        let lock = self.lock.write()?;
        // Safety: exclusive lock held; no other slice of the region exists
        // in this process or any attached one until `lock` drops.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        self.ensure_live(bytes)?;
        Ok(WriteGuard {
            bytes,
            capacity: self.capacity,
            _lock: lock,
        })
    }

    fn ensure_live(&self, bytes: &[u8]) -> Result<()> {
        if bytes[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            return Err(Error::NotInitialized(format!(
                "vault region '{}' has been destroyed",
                self.name
            )));
        }
        Ok(())
    }

    /// Erase the region and remove its backing files
    ///
    /// Every attached handle sees `NotInitialized` afterwards. The startup
    /// lock is held from the erase to the last unlink, so a concurrent
    /// create-or-attach either runs before (and is erased with the rest) or
    /// after (and creates a fresh region).
    pub fn destroy(&self) -> Result<()> {
        let _startup = match &self.backing {
            Backing::File {
                startup_lock_path, ..
            } => Some(StartupLock::acquire(startup_lock_path)?),
            Backing::Anonymous => None,
        };

        {
            let mut guard = self.write()?;
            guard.bytes.zeroize();
        }

        if let Backing::File {
            region_path,
            lock_path,
            ..
        } = &self.backing
        {
            for path in [region_path, lock_path] {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        info!(name = %self.name, "Vault region destroyed");
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Backing::Anonymous = self.backing {
            // Safety: `&mut self` means no guard borrows the region anymore.
            let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
            bytes.zeroize();
        }
    }
}

/// Reject names that would escape the region directory
pub fn validate_region_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if !valid {
        return Err(Error::Configuration(format!(
            "invalid region name '{}' (expected [A-Za-z0-9_.-], max 64 chars)",
            name
        )));
    }
    Ok(())
}

/// Read-only view over the occupied slots
#[derive(Clone, Copy)]
pub struct SlotTable<'a> {
    bytes: &'a [u8],
    capacity: usize,
}

impl<'a> SlotTable<'a> {
    pub(crate) fn new(bytes: &'a [u8], capacity: usize) -> Self {
        Self { bytes, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots
    pub fn count(&self) -> usize {
        // Bounded by capacity so a damaged header can't walk off the slot array.
        (read_u32(self.bytes, COUNT_OFFSET) as usize).min(self.capacity)
    }

    pub fn slot(&self, id: SlotId) -> SlotRef<'a> {
        SlotRef::new(&self.bytes[id.range()])
    }

    /// Linear scan of the occupied slots for `id`
    pub fn find(&self, id: &str) -> Option<SlotId> {
        (0..self.count())
            .map(SlotId)
            .find(|&slot| self.slot(slot).matches(id))
    }

    /// Occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = SlotRef<'a>> + '_ {
        (0..self.count()).map(move |i| self.slot(SlotId(i)))
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Shared access to a region, released on drop
pub struct ReadGuard<'a> {
    table: SlotTable<'a>,
    _lock: SharedLockGuard<'a>,
}

impl<'a> ReadGuard<'a> {
    pub fn table(&self) -> SlotTable<'_> {
        self.table
    }
}

/// Exclusive access to a region, released on drop
pub struct WriteGuard<'a> {
    bytes: &'a mut [u8],
    capacity: usize,
    _lock: ExclusiveLockGuard<'a>,
}

impl<'a> WriteGuard<'a> {
    pub fn table(&self) -> SlotTable<'_> {
        SlotTable::new(&*self.bytes, self.capacity)
    }

    pub fn count(&self) -> usize {
        self.table().count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= self.capacity);
        write_u32(self.bytes, COUNT_OFFSET, count as u32);
    }

    pub fn slot_mut(&mut self, id: SlotId) -> SlotMut<'_> {
        SlotMut::new(&mut self.bytes[id.range()])
    }

    /// Copy slot `from` over slot `to`
    pub fn move_slot(&mut self, from: SlotId, to: SlotId) {
        if from != to {
            self.bytes.copy_within(from.range(), to.offset());
        }
    }

    /// Zero every slot of the array, occupied or not
    pub fn erase_slots(&mut self) {
        let end = SlotId(self.capacity).offset();
        self.bytes[HEADER_SIZE..end].zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::capacity::PAGE_SIZE;
    use crate::vault::slot::Entry;

    #[test]
    fn test_anonymous_region_header() -> Result<()> {
        let region = Region::anonymous(PAGE_SIZE)?;
        assert_eq!(region.capacity(), 3);
        assert_eq!(region.budget(), PAGE_SIZE);
        assert!(!region.is_shared());

        let guard = region.read()?;
        let header = RegionHeader::read(guard.table().as_bytes())?.expect("header written");
        assert_eq!(header.capacity, 3);
        assert_eq!(header.slot_size, SLOT_SIZE);
        assert_eq!(header.creator_pid, std::process::id());
        assert_eq!(guard.table().count(), 0);
        Ok(())
    }

    #[test]
    fn test_region_too_small() {
        assert!(matches!(
            Region::anonymous(HEADER_SIZE - 1),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_move_and_erase_slots() -> Result<()> {
        let region = Region::anonymous(PAGE_SIZE)?;
        let mut guard = region.write()?;
        guard.slot_mut(SlotId(0)).write(&Entry::new("a", b"1", None)?);
        guard.slot_mut(SlotId(1)).write(&Entry::new("b", b"2", None)?);
        guard.set_count(2);

        guard.move_slot(SlotId(1), SlotId(0));
        assert!(guard.table().slot(SlotId(0)).matches("b"));

        guard.erase_slots();
        guard.set_count(0);
        let table = guard.table();
        assert!(table.as_bytes()[HEADER_SIZE..].iter().all(|&b| b == 0));
        assert_eq!(table.find("b"), None);
        Ok(())
    }

    #[test]
    fn test_create_then_attach_shares_memory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = Region::create_or_attach("keys", dir.path(), PAGE_SIZE)?;
        {
            let mut guard = first.write()?;
            guard.slot_mut(SlotId(0)).write(&Entry::new("k", b"v", None)?);
            guard.set_count(1);
        }

        // A different budget must not reinitialize the existing region.
        let second = Region::create_or_attach("keys", dir.path(), 2 * PAGE_SIZE)?;
        assert_eq!(second.capacity(), first.capacity());
        assert_eq!(second.budget(), PAGE_SIZE);
        assert_eq!(second.read()?.table().find("k"), Some(SlotId(0)));
        Ok(())
    }

    #[test]
    fn test_attach_missing_region() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = Region::attach("missing", dir.path()).unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
        Ok(())
    }

    #[test]
    fn test_destroy_invalidates_handles() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let owner = Region::create_or_attach("gone", dir.path(), PAGE_SIZE)?;
        let other = Region::attach("gone", dir.path())?;

        owner.destroy()?;
        assert!(!region_path(dir.path(), "gone").exists());
        assert!(matches!(other.read(), Err(Error::NotInitialized(_))));
        assert!(matches!(owner.write(), Err(Error::NotInitialized(_))));
        Ok(())
    }

    #[test]
    fn test_zeroed_region_file_is_reinitialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(region_path(dir.path(), "stale"), vec![0u8; PAGE_SIZE])?;

        assert!(matches!(
            Region::attach("stale", dir.path()),
            Err(Error::NotInitialized(_))
        ));

        let region = Region::create_or_attach("stale", dir.path(), 2 * PAGE_SIZE)?;
        assert_eq!(region.budget(), PAGE_SIZE);
        assert_eq!(region.capacity(), 3);
        assert_eq!(region.read()?.table().count(), 0);
        assert!(Region::attach("stale", dir.path()).is_ok());
        Ok(())
    }

    #[test]
    fn test_corrupted_header_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = region_path(dir.path(), "bad");
        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[..8].copy_from_slice(b"NOTVAULT");
        std::fs::write(&path, &bytes)?;

        let err = Region::attach("bad", dir.path()).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
        Ok(())
    }

    #[test]
    fn test_region_name_validation() {
        assert!(validate_region_name("shmvault").is_ok());
        assert!(validate_region_name("team-a.keys_2").is_ok());
        assert!(validate_region_name("").is_err());
        assert!(validate_region_name("../etc").is_err());
        assert!(validate_region_name("a/b").is_err());
    }
}
