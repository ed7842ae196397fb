//! Shared-memory secret vault
//!
//! Fixed-capacity key store that many threads and processes use at once
//! without ever passing the keys around.
//!
//! # Architecture
//!
//! ```text
//! Vault (store.rs)
//!   ├─→ add / delete / clear_all   → exclusive lock
//!   ├─→ lookup / with_secret       → shared lock
//!   └─→ list_metadata              → exclusive lock → Snapshot → iterate unlocked
//!
//! Region (region.rs)
//!   ├─→ header: magic, version, slot_size, capacity, count, budget
//!   ├─→ slots:  [0, count) occupied, [count, capacity) zeroed
//!   └─→ RegionLock: parking_lot RwLock + flock(<name>.lock)
//! ```
//!
//! Capacity is planned once from a byte budget and never grows. Deleted and
//! cleared slots are zeroed before the lock is released.

pub mod capacity;
pub mod lock;
pub mod region;
pub mod secret;
pub mod slot;
pub mod snapshot;
pub mod store;

pub use capacity::{CapacityPlan, DEFAULT_BUDGET, PAGE_SIZE};
pub use lock::{RegionLock, StartupLock};
pub use region::{Region, RegionHeader, SlotTable, HEADER_SIZE};
pub use secret::{Cipher, Secret};
pub use slot::{Entry, SlotId, MAX_COMMENT_LENGTH, MAX_ID_LENGTH, MAX_SECRET_LEN, SLOT_SIZE};
pub use snapshot::{KeyMetadata, MetadataIter, Snapshot};
pub use store::{Vault, VaultStats};
