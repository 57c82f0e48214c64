#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use hmac::{Hmac, Mac};
use km_core::{
    Algorithm, AuthorizationSet, AuthorizationView, Buffer, Digest, Engine, ErrorCode, KeyCreation,
    KeyFormat, KeyParam, KeymasterConfig, KeymasterKeyBlob, KmError, KmResult, LegacyEngine,
    OsRandom, PaddingMode, Purpose, RandomSource, RsaPrivateTransform, km_err,
    rsa::SoftwareRsaPrivate,
};
use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};
use rsa::{
    BigUint, RsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
};
use sha2::Sha256;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random() -> Arc<dyn RandomSource> {
    Arc::new(OsRandom)
}

pub fn master_secrets() -> ([u8; 32], [u8; 32]) {
    let mut master = [0u8; 32];
    let mut hmac = [0u8; 32];
    OsRng.fill_bytes(&mut master);
    OsRng.fill_bytes(&mut hmac);
    (master, hmac)
}

pub fn small_config() -> KeymasterConfig {
    KeymasterConfig {
        max_operations: 4,
        ..KeymasterConfig::default()
    }
}

/// One private-key call a legacy engine received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateCall {
    pub purpose: Purpose,
    pub padding: PaddingMode,
    pub input_len: usize,
}

/// Legacy RSA module that can only run undigested operations. Keys are
/// PKCS#8 documents; every parameter it is given is reported as hardware
/// enforced.
#[derive(Default)]
pub struct UndigestedRsaEngine {
    pub calls: Mutex<Vec<PrivateCall>>,
    pub descriptions: Mutex<Vec<AuthorizationSet>>,
}

impl UndigestedRsaEngine {
    fn characteristics(&self, description: &AuthorizationSet) -> KmResult<(AuthorizationSet, AuthorizationSet)> {
        self.descriptions.lock().push(description.try_clone()?);
        Ok((description.try_clone()?, AuthorizationSet::new()))
    }

    fn parse(key_material: &KeymasterKeyBlob) -> KmResult<RsaPrivateKey> {
        RsaPrivateKey::from_pkcs8_der(key_material.as_slice())
            .map_err(|err| km_err!(InvalidKeyBlob, "{err}"))
    }

    pub fn last_description(&self) -> Option<AuthorizationSet> {
        self.descriptions
            .lock()
            .last()
            .and_then(|set| set.try_clone().ok())
    }

    pub fn calls(&self) -> Vec<PrivateCall> {
        self.calls.lock().clone()
    }
}

impl LegacyEngine for UndigestedRsaEngine {
    fn supported_digests(&self, _algorithm: Algorithm) -> Vec<Digest> {
        vec![Digest::None]
    }

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        let bits = description.key_size().unwrap_or(1024) as usize;
        let exponent = description.rsa_public_exponent().unwrap_or(65537);
        let key = RsaPrivateKey::new_with_exp(&mut OsRng, bits, &BigUint::from(exponent))
            .map_err(KmError::crypto)?;
        let der = key.to_pkcs8_der().map_err(KmError::crypto)?;
        let (hw_enforced, sw_enforced) = self.characteristics(description)?;
        Ok(KeyCreation {
            key_material: KeymasterKeyBlob::try_from_slice(der.as_bytes())?,
            hw_enforced,
            sw_enforced,
        })
    }

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation> {
        if input_format != KeyFormat::Pkcs8 {
            return Err(km_err!(UnsupportedKeyFormat, "{input_format:?}"));
        }
        RsaPrivateKey::from_pkcs8_der(input_material).map_err(|err| km_err!(InvalidArgument, "{err}"))?;
        let (hw_enforced, sw_enforced) = self.characteristics(description)?;
        Ok(KeyCreation {
            key_material: KeymasterKeyBlob::try_from_slice(input_material)?,
            hw_enforced,
            sw_enforced,
        })
    }

    fn export_public_key(
        &self,
        key_material: &KeymasterKeyBlob,
        _additional_params: &AuthorizationSet,
    ) -> KmResult<Vec<u8>> {
        let key = Self::parse(key_material)?;
        let der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(KmError::crypto)?;
        Ok(der.as_bytes().to_vec())
    }

    fn private_operation(
        &self,
        key_material: &KeymasterKeyBlob,
        _additional_params: &AuthorizationSet,
        purpose: Purpose,
        padding: PaddingMode,
        input: &[u8],
    ) -> KmResult<Vec<u8>> {
        self.calls.lock().push(PrivateCall {
            purpose,
            padding,
            input_len: input.len(),
        });
        SoftwareRsaPrivate::new(Self::parse(key_material)?).private_operation(purpose, padding, input)
    }
}

type HmacSha256 = Hmac<Sha256>;

struct HmacSession {
    purpose: Purpose,
    key: Vec<u8>,
    data: Vec<u8>,
}

/// Hardware module serving HMAC-SHA256 keys entirely on its side.
#[derive(Default)]
pub struct HmacEngine {
    next_handle: AtomicU64,
    sessions: Mutex<HashMap<u64, HmacSession>>,
    pub aborted: Mutex<Vec<u64>>,
}

impl HmacEngine {
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn session_result<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut HmacSession) -> KmResult<T>,
    ) -> KmResult<T> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&handle)
            .ok_or_else(|| km_err!(InvalidOperationHandle, "engine handle {handle}"))?;
        f(session)
    }

    fn creation(&self, description: &AuthorizationSet, key: Vec<u8>) -> KmResult<KeyCreation> {
        Ok(KeyCreation {
            key_material: KeymasterKeyBlob::new(key),
            hw_enforced: description.try_clone()?,
            sw_enforced: AuthorizationSet::new(),
        })
    }
}

impl Engine for HmacEngine {
    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        let bits = description
            .key_size()
            .ok_or_else(|| km_err!(UnsupportedKeySize, "key size required"))?;
        if bits % 8 != 0 || !(64..=512).contains(&bits) {
            return Err(km_err!(UnsupportedKeySize, "HMAC-{bits}"));
        }
        let mut key = vec![0u8; bits as usize / 8];
        OsRng.fill_bytes(&mut key);
        self.creation(description, key)
    }

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation> {
        if input_format != KeyFormat::Raw {
            return Err(km_err!(UnsupportedKeyFormat, "{input_format:?}"));
        }
        self.creation(description, input_material.to_vec())
    }

    fn export_key(
        &self,
        format: KeyFormat,
        _key_material: &KeymasterKeyBlob,
        _additional_params: &AuthorizationSet,
    ) -> KmResult<Vec<u8>> {
        Err(km_err!(UnsupportedKeyFormat, "HMAC keys never leave the engine ({format:?})"))
    }

    fn supported_import_formats(&self, algorithm: Algorithm) -> Vec<KeyFormat> {
        match algorithm {
            Algorithm::Hmac => vec![KeyFormat::Raw],
            _ => vec![],
        }
    }

    fn supported_export_formats(&self, _algorithm: Algorithm) -> Vec<KeyFormat> {
        vec![]
    }

    fn begin_operation(
        &self,
        purpose: Purpose,
        key_material: &KeymasterKeyBlob,
        input_params: &AuthorizationSet,
        _output_params: &mut AuthorizationSet,
    ) -> KmResult<u64> {
        if input_params.single_digest() != Some(Digest::Sha256) {
            return Err(km_err!(UnsupportedDigest, "engine only computes SHA-256 MACs"));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().insert(
            handle,
            HmacSession {
                purpose,
                key: key_material.as_slice().to_vec(),
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn update_operation(
        &self,
        handle: u64,
        _input_params: &AuthorizationSet,
        input: &[u8],
        _output_params: &mut AuthorizationSet,
        _output: &mut Buffer,
    ) -> KmResult<usize> {
        self.session_result(handle, |session| {
            session.data.extend_from_slice(input);
            Ok(input.len())
        })
    }

    fn finish_operation(
        &self,
        handle: u64,
        _input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        _output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        let session = self
            .sessions
            .lock()
            .remove(&handle)
            .ok_or_else(|| km_err!(InvalidOperationHandle, "engine handle {handle}"))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&session.key).map_err(KmError::crypto)?;
        mac.update(&session.data);
        mac.update(input);
        match session.purpose {
            Purpose::Sign => output.append(&mac.finalize().into_bytes()),
            Purpose::Verify => mac
                .verify_slice(signature)
                .map_err(|_| KmError::new(ErrorCode::VerificationFailed, "MAC mismatch")),
            other => Err(km_err!(UnsupportedPurpose, "{other:?}")),
        }
    }

    fn abort_operation(&self, handle: u64) -> KmResult<()> {
        self.sessions.lock().remove(&handle);
        self.aborted.lock().push(handle);
        Ok(())
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn params(entries: impl IntoIterator<Item = KeyParam>) -> AuthorizationSet {
    entries.into_iter().collect()
}
