use rand::{RngCore, rngs::OsRng};

use crate::error::{KmError, KmResult};

/// Source of randomness for key material, nonces and operation handles.
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]) -> KmResult<()>;

    fn next_u64(&self) -> KmResult<u64> {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Operating-system backed randomness.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> KmResult<()> {
        OsRng.try_fill_bytes(dest).map_err(KmError::crypto)
    }
}
