use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Rsa,
    Ec,
    Aes,
    TripleDes,
    Hmac,
}

impl Algorithm {
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, Algorithm::Rsa | Algorithm::Ec)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Purpose {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    DeriveKey,
    Wrap,
}

impl Purpose {
    /// Purposes that only ever need the public half of an asymmetric key.
    pub fn is_public(&self) -> bool {
        matches!(self, Purpose::Verify | Purpose::Encrypt | Purpose::Wrap)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BlockMode {
    Ecb,
    Cbc,
    Ctr,
    Gcm,
}

impl BlockMode {
    /// Stream-like modes that never pad.
    pub fn requires_no_padding(&self) -> bool {
        matches!(self, BlockMode::Ctr | BlockMode::Gcm)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PaddingMode {
    None,
    RsaOaep,
    RsaPss,
    RsaPkcs1_1_5Encrypt,
    RsaPkcs1_1_5Sign,
    Pkcs7,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Digest {
    None,
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    /// Output length in bytes; zero for [`Digest::None`].
    pub fn output_len(&self) -> usize {
        match self {
            Digest::None => 0,
            Digest::Md5 => 16,
            Digest::Sha1 => 20,
            Digest::Sha224 => 28,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyFormat {
    /// SubjectPublicKeyInfo DER.
    X509,
    /// PrivateKeyInfo DER.
    Pkcs8,
    Raw,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    Generated,
    Derived,
    Imported,
    Unknown,
}

/// Identifier handed back to callers after a successful Begin. Zero is never
/// issued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationHandle(pub u64);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
