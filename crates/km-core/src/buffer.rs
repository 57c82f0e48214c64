use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KmError, KmResult};

/// Owned key material, raw or wrapped by an engine. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeymasterKeyBlob(Vec<u8>);

impl KeymasterKeyBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copies `bytes`, reporting allocation failure instead of aborting.
    pub fn try_from_slice(bytes: &[u8]) -> KmResult<Self> {
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(bytes.len())
            .map_err(|_| KmError::allocation("key blob copy"))?;
        owned.extend_from_slice(bytes);
        Ok(Self(owned))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeymasterKeyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeymasterKeyBlob({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for KeymasterKeyBlob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Appendable byte region used for operation input and output.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> KmResult<()> {
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| KmError::allocation("buffer append"))?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drops everything past `len`, wiping the discarded bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.data.len() {
            self.data[len..].zeroize();
            self.data.truncate(len);
        }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.data.len())
    }
}
