//! Slot codec for the vault region
//!
//! Every entry occupies one fixed-width slot:
//!
//! ```text
//! 0        64                      319   320       324                 1344
//! ├─ id ───┼─ comment ─────────────┼flags┼─ len ───┼─ secret payload ───┤
//!   NUL-terminated  NUL-terminated   b0=comment  u32 LE   up to 1020 bytes
//! ```
//!
//! Fixed widths keep the capacity of a region deterministic and make a slot
//! copyable with a single memmove.

use super::region::HEADER_SIZE;
use crate::error::{Error, Result};
use std::fmt;
use zeroize::Zeroize;

/// Width of the id field, terminator included
pub const MAX_ID_LENGTH: usize = 64;
/// Width of the comment field, terminator included
pub const MAX_COMMENT_LENGTH: usize = 255;
/// Width of the secret field, length prefix included
pub const MAX_KEY_LENGTH: usize = 1024;

/// Length prefix in front of the secret payload
pub const SECRET_PREFIX_LEN: usize = 4;
/// Largest secret payload a slot can hold
pub const MAX_SECRET_LEN: usize = MAX_KEY_LENGTH - SECRET_PREFIX_LEN;

const ID_OFFSET: usize = 0;
const COMMENT_OFFSET: usize = ID_OFFSET + MAX_ID_LENGTH;
const FLAGS_OFFSET: usize = COMMENT_OFFSET + MAX_COMMENT_LENGTH;
const SECRET_OFFSET: usize = FLAGS_OFFSET + 1;
const PAYLOAD_OFFSET: usize = SECRET_OFFSET + SECRET_PREFIX_LEN;

/// Size of one slot in bytes
pub const SLOT_SIZE: usize = SECRET_OFFSET + MAX_KEY_LENGTH;

const FLAG_HAS_COMMENT: u8 = 0x01;

/// Position of a slot in the region's slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Byte offset of this slot from the start of the region
    pub fn offset(&self) -> usize {
        HEADER_SIZE + self.0 * SLOT_SIZE
    }

    /// Byte range of this slot within the region
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset();
        start..start + SLOT_SIZE
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

/// An entry whose fields have been checked against the slot widths
///
/// Only [`Entry::new`] builds one, so anything holding an `Entry` can be
/// encoded without further checks.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    id: &'a str,
    secret: &'a [u8],
    comment: Option<&'a str>,
}

impl<'a> Entry<'a> {
    pub fn new(id: &'a str, secret: &'a [u8], comment: Option<&'a str>) -> Result<Self> {
        validate_id(id)?;
        if id.len() >= MAX_ID_LENGTH {
            return Err(Error::Validation(format!(
                "key ID too long (max={} len={})",
                MAX_ID_LENGTH,
                id.len()
            )));
        }

        if let Some(comment) = comment {
            if comment.as_bytes().contains(&0) {
                return Err(Error::Validation(
                    "comment must not contain NUL bytes".to_string(),
                ));
            }
            if comment.len() >= MAX_COMMENT_LENGTH {
                return Err(Error::Validation(format!(
                    "comment too long (max={} len={})",
                    MAX_COMMENT_LENGTH,
                    comment.len()
                )));
            }
        }

        if secret.len() > MAX_SECRET_LEN {
            return Err(Error::Validation(format!(
                "key too long (max={} len={})",
                MAX_SECRET_LEN,
                secret.len()
            )));
        }

        Ok(Self { id, secret, comment })
    }

    pub fn id(&self) -> &'a str {
        self.id
    }

    pub fn comment(&self) -> Option<&'a str> {
        self.comment
    }

    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }
}

// Keeps the secret out of logs even when an entry is debug-printed.
impl fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("comment", &self.comment)
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

/// Checks an id used for lookup or delete
///
/// Over-long ids are accepted here: they can never match a stored entry.
/// The empty id is a valid id like any other.
pub fn validate_id(id: &str) -> Result<()> {
    if id.as_bytes().contains(&0) {
        return Err(Error::Validation(
            "key ID must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

/// Bytes of a NUL-terminated field, without the terminator
fn c_field(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Read-only view of one encoded slot
#[derive(Clone, Copy)]
pub struct SlotRef<'a>(&'a [u8]);

impl<'a> SlotRef<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert_eq!(bytes.len(), SLOT_SIZE);
        Self(bytes)
    }

    pub fn id_bytes(&self) -> &'a [u8] {
        c_field(&self.0[ID_OFFSET..COMMENT_OFFSET])
    }

    /// Byte-exact comparison against a stored id
    pub fn matches(&self, id: &str) -> bool {
        self.id_bytes() == id.as_bytes()
    }

    pub fn id(&self) -> String {
        String::from_utf8_lossy(self.id_bytes()).into_owned()
    }

    pub fn comment(&self) -> Option<String> {
        if self.0[FLAGS_OFFSET] & FLAG_HAS_COMMENT == 0 {
            return None;
        }
        let raw = c_field(&self.0[COMMENT_OFFSET..FLAGS_OFFSET]);
        Some(String::from_utf8_lossy(raw).into_owned())
    }

    pub fn secret_len(&self) -> usize {
        let prefix = &self.0[SECRET_OFFSET..PAYLOAD_OFFSET];
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        // A foreign writer could leave garbage here; never read past the slot.
        len.min(MAX_SECRET_LEN)
    }

    pub fn secret(&self) -> &'a [u8] {
        &self.0[PAYLOAD_OFFSET..PAYLOAD_OFFSET + self.secret_len()]
    }
}

/// Mutable view of one encoded slot
pub struct SlotMut<'a>(&'a mut [u8]);

impl<'a> SlotMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        debug_assert_eq!(bytes.len(), SLOT_SIZE);
        Self(bytes)
    }

    /// Encode an entry, replacing whatever the slot held
    pub fn write(&mut self, entry: &Entry<'_>) {
        self.erase();

        let id = entry.id.as_bytes();
        self.0[ID_OFFSET..ID_OFFSET + id.len()].copy_from_slice(id);

        if let Some(comment) = entry.comment {
            let comment = comment.as_bytes();
            self.0[COMMENT_OFFSET..COMMENT_OFFSET + comment.len()].copy_from_slice(comment);
            self.0[FLAGS_OFFSET] = FLAG_HAS_COMMENT;
        }

        let len = entry.secret.len() as u32;
        self.0[SECRET_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&len.to_le_bytes());
        self.0[PAYLOAD_OFFSET..PAYLOAD_OFFSET + entry.secret.len()].copy_from_slice(entry.secret);
    }

    /// Overwrite the whole slot with zeros
    pub fn erase(&mut self) {
        self.0.zeroize();
    }

    /// Zero the secret payload, keeping id, comment and length
    pub fn scrub_secret(&mut self) {
        self.0[PAYLOAD_OFFSET..].zeroize();
    }

    pub fn view(&self) -> SlotRef<'_> {
        SlotRef(&*self.0)
    }
}
