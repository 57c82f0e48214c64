//! Runtime configuration for the key/operation core.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::{
    error::{ErrorCode, KmError, KmResult},
    km_err,
};

/// Which implementation serves an algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Software,
    /// Every call forwarded to a hardware engine.
    Passthrough,
    /// RSA on a legacy engine that lacks digests; software fills the gaps.
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSelection {
    pub aes: Backend,
    pub rsa: Backend,
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self {
            aes: Backend::Software,
            rsa: Backend::Software,
        }
    }
}

/// Bounds on software RSA key sizes, in bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RsaLimits {
    pub min_key_size: u32,
    pub max_key_size: u32,
}

impl Default for RsaLimits {
    fn default() -> Self {
        Self {
            min_key_size: 512,
            max_key_size: 4096,
        }
    }
}

/// Bounds on software AES operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AesLimits {
    /// GCM authenticates the whole message at Finish, so it is buffered.
    pub max_gcm_message_len: usize,
}

impl Default for AesLimits {
    fn default() -> Self {
        Self {
            max_gcm_message_len: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeymasterConfig {
    /// Concurrent operations the table will hold before refusing Begin.
    pub max_operations: usize,
    /// Cap on message bytes collected for trusted confirmation.
    pub confirmation_message_max_len: usize,
    pub rsa: RsaLimits,
    pub aes: AesLimits,
    pub backends: BackendSelection,
}

impl Default for KeymasterConfig {
    fn default() -> Self {
        Self {
            max_operations: 16,
            confirmation_message_max_len: 6144,
            rsa: RsaLimits::default(),
            aes: AesLimits::default(),
            backends: BackendSelection::default(),
        }
    }
}

impl KeymasterConfig {
    pub fn from_toml_str(content: &str) -> KmResult<Self> {
        let config: KeymasterConfig = toml::from_str(content)
            .map_err(|err| KmError::new(ErrorCode::KeymasterNotConfigured, err))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from disk.
    pub fn load(path: impl AsRef<Path>) -> KmResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            km_err!(KeymasterNotConfigured, "reading {}: {err}", path.display())
        })?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> KmResult<()> {
        let content = toml::to_string_pretty(self).map_err(KmError::crypto)?;
        fs::write(path.as_ref(), content).map_err(|err| {
            km_err!(UnknownError, "writing {}: {err}", path.as_ref().display())
        })
    }

    pub fn validate(&self) -> KmResult<()> {
        if self.max_operations == 0 {
            return Err(KmError::invalid("max_operations must be at least 1"));
        }
        if self.rsa.min_key_size > self.rsa.max_key_size {
            return Err(km_err!(
                InvalidArgument,
                "rsa.min_key_size {} exceeds rsa.max_key_size {}",
                self.rsa.min_key_size,
                self.rsa.max_key_size
            ));
        }
        if self.aes.max_gcm_message_len == 0 {
            return Err(KmError::invalid("aes.max_gcm_message_len must be at least 1"));
        }
        if self.backends.aes == Backend::Legacy {
            return Err(KmError::invalid("the legacy backend only serves RSA"));
        }
        Ok(())
    }
}
