//! Vault configuration
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `SHMVAULT_*` environment variables (`SHMVAULT_MAX_SIZE=2097152`)
//!
//! The byte budget is read once, when the region is created. Changing it
//! afterwards has no effect until the region is destroyed and recreated.

use crate::error::{Error, Result};
use crate::vault::capacity::{DEFAULT_BUDGET, PAGE_SIZE};
use crate::vault::region::validate_region_name;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SHMVAULT";

/// Largest accepted byte budget
pub const MAX_BUDGET: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Process-group-wide name of the region
    pub region_name: String,
    /// Total bytes of the region (header + slots)
    pub max_size: usize,
    /// Directory holding the region and lock files
    pub shm_dir: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            region_name: "shmvault".to_string(),
            max_size: DEFAULT_BUDGET,
            shm_dir: default_shm_dir(),
        }
    }
}

/// `/dev/shm` where it exists, the OS temp directory otherwise
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

impl VaultConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        debug!(?config, "Loaded vault configuration");
        Ok(config)
    }

    /// Check the values the region manager relies on
    pub fn validate(&self) -> Result<()> {
        validate_region_name(&self.region_name)?;

        if self.max_size < PAGE_SIZE {
            return Err(Error::Configuration(format!(
                "max_size {} is below the minimum of one page ({} B)",
                self.max_size, PAGE_SIZE
            )));
        }
        if self.max_size > MAX_BUDGET {
            return Err(Error::Configuration(format!(
                "max_size {} exceeds the maximum of {} B",
                self.max_size, MAX_BUDGET
            )));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to render configuration: {}", e)))
    }
}
