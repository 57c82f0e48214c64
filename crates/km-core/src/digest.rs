use sha2::{Digest as _, Sha224, Sha256, Sha384, Sha512};

use crate::{error::KmResult, km_err, types::Digest};

/// Digests the software backends can compute themselves.
pub const SOFTWARE_DIGESTS: &[Digest] = &[
    Digest::None,
    Digest::Sha224,
    Digest::Sha256,
    Digest::Sha384,
    Digest::Sha512,
];

/// Incremental hash state for one of the software digests.
#[derive(Clone)]
pub enum DigestContext {
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl DigestContext {
    pub fn new(digest: Digest) -> KmResult<Self> {
        match digest {
            Digest::Sha224 => Ok(Self::Sha224(Sha224::new())),
            Digest::Sha256 => Ok(Self::Sha256(Sha256::new())),
            Digest::Sha384 => Ok(Self::Sha384(Sha384::new())),
            Digest::Sha512 => Ok(Self::Sha512(Sha512::new())),
            other => Err(km_err!(UnsupportedDigest, "no software context for {other:?}")),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// One-shot hash of `data`.
pub fn hash(digest: Digest, data: &[u8]) -> KmResult<Vec<u8>> {
    let mut ctx = DigestContext::new(digest)?;
    ctx.update(data);
    Ok(ctx.finalize())
}
