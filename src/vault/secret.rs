//! Secret material handed out by the vault

use crate::error::Result;
use std::fmt;
use zeroize::Zeroizing;

/// Copy of a stored secret, wiped from memory on drop
///
/// `Debug` never prints the bytes, so a `Secret` is safe to pass through
/// tracing fields.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    data: Zeroizing<Vec<u8>>,
}

impl Secret {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            data: Zeroizing::new(data.to_vec()),
        }
    }

    /// Get a reference to the secret bytes
    #[inline]
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} bytes])", self.data.len())
    }
}

/// Symmetric cipher that uses vault keys
///
/// The vault never encrypts anything itself; it looks the key up by id and
/// hands it to an implementation of this trait for the duration of one call.
pub trait Cipher {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = Secret::new(b"hunter2");
        let printed = format!("{:?}", secret);
        assert_eq!(printed, "Secret([REDACTED; 7 bytes])");
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_expose() {
        let secret = Secret::new(&[0xAA]);
        assert_eq!(secret.expose(), &[0xAA]);
        assert_eq!(secret.len(), 1);
        assert!(!secret.is_empty());
    }
}
