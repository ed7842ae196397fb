// shmvault - Rust Implementation
// A fixed-capacity secret store living in shared memory

#![warn(rust_2018_idioms)]

pub mod config;
pub mod metrics;
pub mod vault;

// Re-exports for convenience
pub use config::VaultConfig;
pub use vault::{Cipher, KeyMetadata, MetadataIter, Region, Secret, Vault, VaultStats};

/// shmvault error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Validation error: {0}")]
        Validation(String),

        #[error("the supplied key ID '{0}' is not unique")]
        DuplicateKey(String),

        #[error("cannot add a key - the vault is full (capacity={capacity})")]
        CapacityExceeded { capacity: usize },

        #[error("Configuration error: {0}")]
        Configuration(String),

        #[error("Not initialized: {0}")]
        NotInitialized(String),

        #[error("Region corrupted: {0}")]
        Corrupted(String),

        #[error("Key not found: {0}")]
        KeyNotFound(String),

        #[error("Cipher error: {0}")]
        Cipher(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_error_messages_name_the_key() {
        let err = Error::DuplicateKey("k1".to_string());
        assert_eq!(err.to_string(), "the supplied key ID 'k1' is not unique");

        let err = Error::CapacityExceeded { capacity: 3 };
        assert!(err.to_string().contains("capacity=3"));
    }
}
