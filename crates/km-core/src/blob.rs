//! Sealing of key material and characteristics into opaque blobs.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{
    authorization::{AuthorizationSet, AuthorizationView},
    buffer::KeymasterKeyBlob,
    error::{KmError, KmResult},
    key::KeyCreation,
    km_err,
    random::RandomSource,
    types::Algorithm,
};

type HmacSha256 = Hmac<Sha256>;

const BLOB_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Contents of a blob once opened.
#[derive(Debug)]
pub struct ParsedKeyBlob {
    pub algorithm: Algorithm,
    pub key_material: KeymasterKeyBlob,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
}

pub trait KeyBlobMaker: Send + Sync {
    fn create_key_blob(
        &self,
        algorithm: Algorithm,
        creation: &KeyCreation,
        additional_params: &AuthorizationSet,
    ) -> KmResult<KeymasterKeyBlob>;

    fn parse_key_blob(
        &self,
        blob: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<ParsedKeyBlob>;
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    algorithm: Algorithm,
    material: &'a [u8],
    hw_enforced: &'a AuthorizationSet,
    sw_enforced: &'a AuthorizationSet,
}

#[derive(Deserialize)]
struct PayloadOwned {
    algorithm: Algorithm,
    material: Vec<u8>,
    hw_enforced: AuthorizationSet,
    sw_enforced: AuthorizationSet,
}

#[derive(Serialize, Deserialize)]
struct SealedBlob {
    version: u8,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    hmac: Vec<u8>,
}

/// Associated data binding a blob to the caller's application id and data.
fn hidden_params(additional_params: &AuthorizationSet) -> KmResult<Vec<u8>> {
    additional_params.check_valid()?;
    let mut aad = Vec::new();
    for value in [
        additional_params.application_id(),
        additional_params.application_data(),
    ] {
        match value {
            Some(bytes) => {
                aad.push(1);
                aad.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                aad.extend_from_slice(bytes);
            }
            None => aad.push(0),
        }
    }
    Ok(aad)
}

fn invalid_blob(reason: &str) -> KmError {
    warn!("key blob rejected: {reason}");
    km_err!(InvalidKeyBlob, "{reason}")
}

/// AES-256-GCM sealing under a master key, authenticated again with
/// HMAC-SHA256 over the whole envelope.
pub struct SealingBlobMaker {
    master_key: Zeroizing<[u8; 32]>,
    hmac_key: Zeroizing<[u8; 32]>,
    random: Arc<dyn RandomSource>,
}

impl SealingBlobMaker {
    pub fn new(master_key: [u8; 32], hmac_key: [u8; 32], random: Arc<dyn RandomSource>) -> Self {
        Self {
            master_key: Zeroizing::new(master_key),
            hmac_key: Zeroizing::new(hmac_key),
            random,
        }
    }

    /// Maker with fresh random keys; its blobs do not outlive it.
    pub fn ephemeral(random: Arc<dyn RandomSource>) -> KmResult<Self> {
        let mut master_key = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        random.fill_bytes(&mut master_key)?;
        random.fill_bytes(&mut hmac_key)?;
        let maker = Self::new(master_key, hmac_key, random);
        zeroize::Zeroize::zeroize(&mut master_key);
        zeroize::Zeroize::zeroize(&mut hmac_key);
        Ok(maker)
    }

    fn mac(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> KmResult<HmacSha256> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key[..]).map_err(KmError::crypto)?;
        mac.update(&[BLOB_VERSION]);
        mac.update(nonce);
        mac.update(aad);
        mac.update(ciphertext);
        Ok(mac)
    }
}

impl KeyBlobMaker for SealingBlobMaker {
    fn create_key_blob(
        &self,
        algorithm: Algorithm,
        creation: &KeyCreation,
        additional_params: &AuthorizationSet,
    ) -> KmResult<KeymasterKeyBlob> {
        creation.hw_enforced.check_valid()?;
        creation.sw_enforced.check_valid()?;
        let aad = hidden_params(additional_params)?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&PayloadRef {
                algorithm,
                material: creation.key_material.as_slice(),
                hw_enforced: &creation.hw_enforced,
                sw_enforced: &creation.sw_enforced,
            })
            .map_err(KmError::crypto)?,
        );

        let mut nonce = vec![0u8; NONCE_LEN];
        self.random.fill_bytes(&mut nonce)?;
        let cipher = Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(KmError::crypto)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    aad: &aad,
                    msg: &plaintext,
                },
            )
            .map_err(KmError::crypto)?;
        let hmac = self
            .mac(&nonce, &aad, &ciphertext)?
            .finalize()
            .into_bytes()
            .to_vec();

        let sealed = SealedBlob {
            version: BLOB_VERSION,
            nonce,
            ciphertext,
            hmac,
        };
        Ok(KeymasterKeyBlob::new(
            serde_json::to_vec(&sealed).map_err(KmError::crypto)?,
        ))
    }

    fn parse_key_blob(
        &self,
        blob: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<ParsedKeyBlob> {
        let aad = hidden_params(additional_params)?;
        let sealed: SealedBlob = serde_json::from_slice(blob.as_slice())
            .map_err(|_| invalid_blob("malformed envelope"))?;
        if sealed.version != BLOB_VERSION || sealed.nonce.len() != NONCE_LEN {
            return Err(invalid_blob("unknown envelope version"));
        }
        self.mac(&sealed.nonce, &aad, &sealed.ciphertext)?
            .verify_slice(&sealed.hmac)
            .map_err(|_| invalid_blob("authentication failed"))?;

        let cipher = Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(KmError::crypto)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&sealed.nonce),
                    Payload {
                        aad: &aad,
                        msg: &sealed.ciphertext,
                    },
                )
                .map_err(|_| invalid_blob("decryption failed"))?,
        );
        let payload: PayloadOwned =
            serde_json::from_slice(&plaintext).map_err(|_| invalid_blob("malformed payload"))?;
        Ok(ParsedKeyBlob {
            algorithm: payload.algorithm,
            key_material: KeymasterKeyBlob::new(payload.material),
            hw_enforced: payload.hw_enforced,
            sw_enforced: payload.sw_enforced,
        })
    }
}
