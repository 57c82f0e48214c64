//! Software AES: key factory, key, and encrypt/decrypt operations in ECB,
//! CBC, CTR and GCM modes.

use std::{any::Any, sync::Arc};

use aes::{
    Aes128, Aes192, Aes256, Block,
    cipher::{
        BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
        StreamCipher, generic_array::GenericArray, inout::InOutBuf,
    },
};
use aes_gcm::{
    AesGcm,
    aead::{
        Aead, AeadCore, Payload,
        consts::{U12, U13, U14, U15, U16},
    },
};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::{
    authorization::{AuthorizationSet, AuthorizationView, KeyParam, Tag},
    buffer::{Buffer, KeymasterKeyBlob},
    config::AesLimits,
    error::{KmError, KmResult},
    key::{
        Key, KeyCreation, KeyFactory, check_algorithm, reconcile_import_param,
        software_enforced_split,
    },
    km_err,
    operation::{KeyType, Operation, OperationBackend, OperationFactory},
    random::RandomSource,
    types::{Algorithm, BlockMode, KeyFormat, KeyOrigin, PaddingMode, Purpose},
};

pub const AES_KEY_SIZES: &[u32] = &[128, 192, 256];
pub const MIN_GCM_TAG_LENGTH: u32 = 96;
pub const MAX_GCM_TAG_LENGTH: u32 = 128;

const AES_BLOCK_SIZE: usize = 16;
const GCM_NONCE_SIZE: usize = 12;

const AES_BLOCK_MODES: &[BlockMode] = &[
    BlockMode::Ecb,
    BlockMode::Cbc,
    BlockMode::Ctr,
    BlockMode::Gcm,
];
const AES_PADDINGS: &[PaddingMode] = &[PaddingMode::None, PaddingMode::Pkcs7];

/// Size in bits of `len` bytes of key material, if it fits a `u32`.
fn material_bits(len: usize) -> Option<u32> {
    len.checked_mul(8).and_then(|bits| u32::try_from(bits).ok())
}

pub struct AesKeyFactory {
    random: Arc<dyn RandomSource>,
    encrypt: Arc<AesOperationFactory>,
    decrypt: Arc<AesOperationFactory>,
}

impl AesKeyFactory {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self::with_limits(random, AesLimits::default())
    }

    pub fn with_limits(random: Arc<dyn RandomSource>, limits: AesLimits) -> Self {
        Self {
            encrypt: Arc::new(AesOperationFactory::new(Purpose::Encrypt, random.clone(), limits)),
            decrypt: Arc::new(AesOperationFactory::new(Purpose::Decrypt, random.clone(), limits)),
            random,
        }
    }

    /// GCM keys must carry a usable minimum tag length; other keys must not
    /// carry one at all.
    fn validate_algorithm_specific_new_key_params(description: &AuthorizationSet) -> KmResult<()> {
        if description.contains_param(&KeyParam::BlockMode(BlockMode::Gcm)) {
            let min_tag_length = description
                .min_mac_length()
                .ok_or_else(|| km_err!(MissingMinMacLength, "GCM key without MinMacLength"))?;
            if min_tag_length % 8 != 0
                || !(MIN_GCM_TAG_LENGTH..=MAX_GCM_TAG_LENGTH).contains(&min_tag_length)
            {
                error!("unsupported GCM minimum tag length {min_tag_length}");
                return Err(km_err!(
                    UnsupportedMinMacLength,
                    "minimum tag length {min_tag_length}"
                ));
            }
        } else if description.contains(Tag::MinMacLength) {
            warn!("MinMacLength found for non AES-GCM key");
            return Err(km_err!(InvalidTag, "MinMacLength on a non-GCM key"));
        }
        Ok(())
    }
}

impl KeyFactory for AesKeyFactory {
    fn registry_key(&self) -> Algorithm {
        Algorithm::Aes
    }

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        check_algorithm(description, Algorithm::Aes)?;
        let key_size = description
            .key_size()
            .ok_or_else(|| km_err!(UnsupportedKeySize, "no key size specified"))?;
        if !self.key_size_supported(key_size) {
            error!("AES key size {key_size} not supported");
            return Err(km_err!(UnsupportedKeySize, "AES-{key_size}"));
        }
        Self::validate_algorithm_specific_new_key_params(description)?;
        let (hw_enforced, sw_enforced) = software_enforced_split(description, KeyOrigin::Generated)?;

        let mut material = Zeroizing::new(vec![0u8; (key_size / 8) as usize]);
        self.random.fill_bytes(&mut material)?;
        info!("generated AES-{key_size} key");
        Ok(KeyCreation {
            key_material: KeymasterKeyBlob::try_from_slice(&material)?,
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
        check_algorithm(description, Algorithm::Aes)?;
        if input_format != KeyFormat::Raw {
            return Err(km_err!(UnsupportedKeyFormat, "AES import from {input_format:?}"));
        }
        let key_size = material_bits(input_material.len())
            .filter(|bits| self.key_size_supported(*bits))
            .ok_or_else(|| {
                error!("imported AES key of {} bytes not supported", input_material.len());
                km_err!(UnsupportedKeySize, "{} bytes of AES key material", input_material.len())
            })?;
        let description = reconcile_import_param(description, KeyParam::KeySize(key_size))?;
        Self::validate_algorithm_specific_new_key_params(&description)?;
        let (hw_enforced, sw_enforced) = software_enforced_split(&description, KeyOrigin::Imported)?;
        info!("imported AES-{key_size} key");
        Ok(KeyCreation {
            key_material: KeymasterKeyBlob::try_from_slice(input_material)?,
            hw_enforced,
            sw_enforced,
        })
    }

    fn load_key(
        &self,
        key_material: KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
    ) -> KmResult<Box<dyn Key>> {
        additional_params.check_valid()?;
        hw_enforced.check_valid()?;
        sw_enforced.check_valid()?;
        if !material_bits(key_material.len()).is_some_and(|bits| self.key_size_supported(bits)) {
            return Err(km_err!(
                InvalidKeyBlob,
                "{} bytes of AES key material",
                key_material.len()
            ));
        }
        Ok(Box::new(AesKey {
            key_material,
            hw_enforced,
            sw_enforced,
        }))
    }

    fn operation_factory(&self, purpose: Purpose) -> Option<Arc<dyn OperationFactory>> {
        match purpose {
            Purpose::Encrypt => Some(self.encrypt.clone()),
            Purpose::Decrypt => Some(self.decrypt.clone()),
            _ => None,
        }
    }

    fn supported_import_formats(&self) -> Vec<KeyFormat> {
        vec![KeyFormat::Raw]
    }

    fn supported_export_formats(&self) -> Vec<KeyFormat> {
        Vec::new()
    }

    fn key_size_supported(&self, key_size_bits: u32) -> bool {
        AES_KEY_SIZES.contains(&key_size_bits)
    }
}

#[derive(Debug)]
pub struct AesKey {
    key_material: KeymasterKeyBlob,
    hw_enforced: AuthorizationSet,
    sw_enforced: AuthorizationSet,
}

impl Key for AesKey {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Aes
    }

    fn key_material(&self) -> &KeymasterKeyBlob {
        &self.key_material
    }

    fn hw_enforced(&self) -> &AuthorizationSet {
        &self.hw_enforced
    }

    fn sw_enforced(&self) -> &AuthorizationSet {
        &self.sw_enforced
    }

    fn formatted_key_material(&self, format: KeyFormat) -> KmResult<Vec<u8>> {
        match format {
            KeyFormat::Raw => Ok(self.key_material.as_slice().to_vec()),
            other => Err(km_err!(UnsupportedKeyFormat, "AES keys have no {other:?} form")),
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

pub struct AesOperationFactory {
    purpose: Purpose,
    random: Arc<dyn RandomSource>,
    limits: AesLimits,
}

impl AesOperationFactory {
    pub fn new(purpose: Purpose, random: Arc<dyn RandomSource>, limits: AesLimits) -> Self {
        Self {
            purpose,
            random,
            limits,
        }
    }

    fn validate_mac_length(
        begin_params: &AuthorizationSet,
        key: &dyn Key,
        block_mode: BlockMode,
    ) -> KmResult<usize> {
        if block_mode != BlockMode::Gcm {
            if begin_params.contains(Tag::MacLength) {
                return Err(km_err!(InvalidArgument, "MacLength given for {block_mode:?}"));
            }
            return Ok(0);
        }
        let tag_length = begin_params
            .mac_length()
            .ok_or_else(|| km_err!(MissingMacLength, "GCM requires MacLength"))?;
        if tag_length % 8 != 0 || !(MIN_GCM_TAG_LENGTH..=MAX_GCM_TAG_LENGTH).contains(&tag_length) {
            error!("unsupported GCM tag length {tag_length}");
            return Err(km_err!(UnsupportedMacLength, "tag length {tag_length}"));
        }
        let min_tag_length = key
            .authorizations()
            .min_mac_length()
            .ok_or_else(|| km_err!(MissingMinMacLength, "GCM key without MinMacLength"))?;
        if tag_length < min_tag_length {
            return Err(km_err!(
                InvalidMacLength,
                "tag length {tag_length} below key minimum {min_tag_length}"
            ));
        }
        Ok((tag_length / 8) as usize)
    }

    fn validate_nonce(
        &self,
        begin_params: &AuthorizationSet,
        key: &dyn Key,
        block_mode: BlockMode,
    ) -> KmResult<Option<Vec<u8>>> {
        let nonce = begin_params.nonce();
        if block_mode == BlockMode::Ecb {
            return Ok(None);
        }
        let expected_len = match block_mode {
            BlockMode::Gcm => GCM_NONCE_SIZE,
            _ => AES_BLOCK_SIZE,
        };
        match (self.purpose, nonce) {
            (Purpose::Encrypt, Some(_)) if !key.authorizations().contains(Tag::CallerNonce) => {
                Err(km_err!(CallerNonceProhibited, "key does not permit caller nonces"))
            }
            (Purpose::Decrypt, None) => Err(km_err!(MissingNonce, "{block_mode:?} decryption needs a nonce")),
            (_, Some(n)) if n.len() != expected_len => Err(km_err!(
                InvalidNonce,
                "{block_mode:?} nonce must be {expected_len} bytes, got {}",
                n.len()
            )),
            (_, n) => Ok(n.map(<[u8]>::to_vec)),
        }
    }
}

impl OperationFactory for AesOperationFactory {
    fn registry_key(&self) -> KeyType {
        KeyType::new(Algorithm::Aes, self.purpose)
    }

    fn create_operation(
        &self,
        key: Box<dyn Key>,
        begin_params: &AuthorizationSet,
    ) -> KmResult<Operation> {
        let block_mode = self.get_and_validate_block_mode(begin_params, key.as_ref())?;
        let padding = self.get_and_validate_padding(begin_params, key.as_ref())?;
        if block_mode.requires_no_padding() && padding != PaddingMode::None {
            error!("{block_mode:?} does not support padding {padding:?}");
            return Err(km_err!(IncompatiblePaddingMode, "{block_mode:?} with {padding:?}"));
        }
        let tag_len = Self::validate_mac_length(begin_params, key.as_ref(), block_mode)?;
        let nonce = self.validate_nonce(begin_params, key.as_ref(), block_mode)?;

        let key = key
            .into_any()
            .downcast::<AesKey>()
            .map_err(|_| km_err!(IncompatibleAlgorithm, "AES factory given a foreign key"))?;
        let AesKey {
            key_material,
            hw_enforced,
            sw_enforced,
        } = *key;
        let cipher = AesCipher::new(key_material.as_slice())?;
        let backend = AesOperation {
            purpose: self.purpose,
            block_mode,
            padding,
            cipher,
            key: Zeroizing::new(key_material.as_slice().to_vec()),
            nonce,
            tag_len,
            max_gcm_message_len: self.limits.max_gcm_message_len,
            random: self.random.clone(),
            pending: Zeroizing::new(Vec::new()),
            state: ModeState::Ecb,
        };
        Ok(Operation::new(
            self.purpose,
            hw_enforced,
            sw_enforced,
            self.random.clone(),
            Box::new(backend),
        ))
    }

    fn supported_block_modes(&self) -> &[BlockMode] {
        AES_BLOCK_MODES
    }

    fn supported_padding_modes(&self) -> &[PaddingMode] {
        AES_PADDINGS
    }
}

enum AesCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesCipher {
    fn new(key: &[u8]) -> KmResult<Self> {
        let cipher = match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128),
            24 => Aes192::new_from_slice(key).map(Self::Aes192),
            32 => Aes256::new_from_slice(key).map(Self::Aes256),
            other => return Err(km_err!(InvalidKeyBlob, "{other}-byte AES key")),
        };
        cipher.map_err(KmError::crypto)
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(block),
            Self::Aes192(c) => c.decrypt_block(block),
            Self::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// CBC chaining state for one direction and key size.
enum CbcCipher {
    Encrypt128(cbc::Encryptor<Aes128>),
    Encrypt192(cbc::Encryptor<Aes192>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Decrypt192(cbc::Decryptor<Aes192>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

impl CbcCipher {
    fn new(encrypting: bool, key: &[u8], iv: &[u8]) -> KmResult<Self> {
        let cipher = match (encrypting, key.len()) {
            (true, 16) => cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map(Self::Encrypt128),
            (true, 24) => cbc::Encryptor::<Aes192>::new_from_slices(key, iv).map(Self::Encrypt192),
            (true, 32) => cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map(Self::Encrypt256),
            (false, 16) => cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map(Self::Decrypt128),
            (false, 24) => cbc::Decryptor::<Aes192>::new_from_slices(key, iv).map(Self::Decrypt192),
            (false, 32) => cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map(Self::Decrypt256),
            (_, other) => return Err(km_err!(InvalidKeyBlob, "{other}-byte AES key")),
        };
        cipher.map_err(KmError::crypto)
    }

    fn process_blocks(&mut self, blocks: &mut [Block]) {
        match self {
            Self::Encrypt128(c) => c.encrypt_blocks_mut(blocks),
            Self::Encrypt192(c) => c.encrypt_blocks_mut(blocks),
            Self::Encrypt256(c) => c.encrypt_blocks_mut(blocks),
            Self::Decrypt128(c) => c.decrypt_blocks_mut(blocks),
            Self::Decrypt192(c) => c.decrypt_blocks_mut(blocks),
            Self::Decrypt256(c) => c.decrypt_blocks_mut(blocks),
        }
    }
}

/// Big-endian 128-bit counter mode keystream.
enum CtrCipher {
    Aes128(ctr::Ctr128BE<Aes128>),
    Aes192(ctr::Ctr128BE<Aes192>),
    Aes256(ctr::Ctr128BE<Aes256>),
}

impl CtrCipher {
    fn new(key: &[u8], iv: &[u8]) -> KmResult<Self> {
        let cipher = match key.len() {
            16 => ctr::Ctr128BE::<Aes128>::new_from_slices(key, iv).map(Self::Aes128),
            24 => ctr::Ctr128BE::<Aes192>::new_from_slices(key, iv).map(Self::Aes192),
            32 => ctr::Ctr128BE::<Aes256>::new_from_slices(key, iv).map(Self::Aes256),
            other => return Err(km_err!(InvalidKeyBlob, "{other}-byte AES key")),
        };
        cipher.map_err(KmError::crypto)
    }

    fn apply_keystream(&mut self, data: &mut [u8]) -> KmResult<()> {
        match self {
            Self::Aes128(c) => c.try_apply_keystream(data),
            Self::Aes192(c) => c.try_apply_keystream(data),
            Self::Aes256(c) => c.try_apply_keystream(data),
        }
        .map_err(|_| km_err!(InvalidInputLength, "CTR counter exhausted"))
    }
}

enum ModeState {
    Ecb,
    Cbc(CbcCipher),
    Ctr(CtrCipher),
    Gcm {
        aad: Vec<u8>,
        data: Zeroizing<Vec<u8>>,
    },
}

/// Dispatches to a generic GCM helper instantiated for the key size and
/// tag length in play.
macro_rules! with_gcm_cipher {
    ($key_len:expr, $tag_len:expr, $call:ident ( $($arg:expr),* )) => {
        match ($key_len, $tag_len) {
            (16, 12) => $call::<AesGcm<Aes128, U12, U12>>($($arg),*),
            (16, 13) => $call::<AesGcm<Aes128, U12, U13>>($($arg),*),
            (16, 14) => $call::<AesGcm<Aes128, U12, U14>>($($arg),*),
            (16, 15) => $call::<AesGcm<Aes128, U12, U15>>($($arg),*),
            (16, 16) => $call::<AesGcm<Aes128, U12, U16>>($($arg),*),
            (24, 12) => $call::<AesGcm<Aes192, U12, U12>>($($arg),*),
            (24, 13) => $call::<AesGcm<Aes192, U12, U13>>($($arg),*),
            (24, 14) => $call::<AesGcm<Aes192, U12, U14>>($($arg),*),
            (24, 15) => $call::<AesGcm<Aes192, U12, U15>>($($arg),*),
            (24, 16) => $call::<AesGcm<Aes192, U12, U16>>($($arg),*),
            (32, 12) => $call::<AesGcm<Aes256, U12, U12>>($($arg),*),
            (32, 13) => $call::<AesGcm<Aes256, U12, U13>>($($arg),*),
            (32, 14) => $call::<AesGcm<Aes256, U12, U14>>($($arg),*),
            (32, 15) => $call::<AesGcm<Aes256, U12, U15>>($($arg),*),
            (32, 16) => $call::<AesGcm<Aes256, U12, U16>>($($arg),*),
            (key_len, tag_len) => Err(km_err!(
                UnsupportedMacLength,
                "no GCM instance for {key_len}-byte key and {tag_len}-byte tag"
            )),
        }
    };
}

fn gcm_encrypt<C>(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> KmResult<Vec<u8>>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(key).map_err(KmError::crypto)?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), Payload { msg, aad })
        .map_err(KmError::crypto)
}

fn gcm_decrypt<C>(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> KmResult<Vec<u8>>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(key).map_err(KmError::crypto)?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| km_err!(VerificationFailed, "GCM tag mismatch"))
}

struct AesOperation {
    purpose: Purpose,
    block_mode: BlockMode,
    padding: PaddingMode,
    cipher: AesCipher,
    key: Zeroizing<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    tag_len: usize,
    max_gcm_message_len: usize,
    random: Arc<dyn RandomSource>,
    pending: Zeroizing<Vec<u8>>,
    state: ModeState,
}

impl AesOperation {
    fn encrypting(&self) -> bool {
        self.purpose == Purpose::Encrypt
    }

    /// Encrypts or decrypts `data`, a whole number of blocks, in ECB or CBC.
    fn transform_blocks(&mut self, data: &mut [u8]) {
        let encrypting = self.encrypting();
        if let ModeState::Cbc(cbc) = &mut self.state {
            let inout: InOutBuf<'_, '_, u8> = data.into();
            let (mut blocks, _tail): (InOutBuf<'_, '_, Block>, _) = inout.into_chunks();
            cbc.process_blocks(blocks.get_out());
            return;
        }
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            if encrypting {
                self.cipher.encrypt_block(block);
            } else {
                self.cipher.decrypt_block(block);
            }
        }
    }

    /// Runs every complete block in `pending`, keeping back the last one when
    /// decrypting with padding so Finish can strip it.
    fn process_blocks(&mut self, input: &[u8], output: &mut Buffer) -> KmResult<()> {
        self.pending.extend_from_slice(input);
        let mut ready = self.pending.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        if !self.encrypting()
            && self.padding == PaddingMode::Pkcs7
            && ready == self.pending.len()
            && ready > 0
        {
            ready -= AES_BLOCK_SIZE;
        }
        let mut blocks = Zeroizing::new(self.pending[..ready].to_vec());
        self.transform_blocks(&mut blocks);
        self.pending.drain(..ready);
        output.append(&blocks)
    }

    fn apply_keystream(&mut self, input: &[u8], output: &mut Buffer) -> KmResult<()> {
        let ModeState::Ctr(ctr) = &mut self.state else {
            return Err(km_err!(UnknownError, "keystream requested outside CTR mode"));
        };
        let mut out = Zeroizing::new(input.to_vec());
        ctr.apply_keystream(&mut out)?;
        output.append(&out)
    }

    fn finish_blocks(&mut self, output: &mut Buffer) -> KmResult<()> {
        match (self.encrypting(), self.padding) {
            (_, PaddingMode::None) => {
                if !self.pending.is_empty() {
                    error!(
                        "{} trailing bytes not a multiple of the AES block size",
                        self.pending.len()
                    );
                    return Err(km_err!(
                        InvalidInputLength,
                        "input not a multiple of {AES_BLOCK_SIZE} bytes"
                    ));
                }
                Ok(())
            }
            (true, _) => {
                let pad = AES_BLOCK_SIZE - self.pending.len();
                let mut block = Zeroizing::new(std::mem::take(&mut *self.pending));
                block.resize(AES_BLOCK_SIZE, pad as u8);
                self.transform_blocks(&mut block);
                output.append(&block)
            }
            (false, _) => {
                if self.pending.len() != AES_BLOCK_SIZE {
                    return Err(km_err!(
                        InvalidInputLength,
                        "padded ciphertext must end on a block boundary"
                    ));
                }
                let mut block = Zeroizing::new(std::mem::take(&mut *self.pending));
                self.transform_blocks(&mut block);
                let pad = block[AES_BLOCK_SIZE - 1] as usize;
                if pad == 0
                    || pad > AES_BLOCK_SIZE
                    || block[AES_BLOCK_SIZE - pad..].iter().any(|b| *b as usize != pad)
                {
                    return Err(km_err!(InvalidArgument, "invalid PKCS#7 padding"));
                }
                output.append(&block[..AES_BLOCK_SIZE - pad])
            }
        }
    }

    fn collect_aad(&mut self, input_params: &AuthorizationSet) -> KmResult<()> {
        let ModeState::Gcm { aad, data } = &mut self.state else {
            if input_params.contains(Tag::AssociatedData) {
                return Err(km_err!(InvalidTag, "associated data outside GCM"));
            }
            return Ok(());
        };
        for param in input_params.iter() {
            if let KeyParam::AssociatedData(chunk) = param {
                if !data.is_empty() {
                    return Err(km_err!(InvalidTag, "associated data after message data"));
                }
                aad.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn finish_gcm(&mut self, output: &mut Buffer) -> KmResult<()> {
        let ModeState::Gcm { aad, data } = &self.state else {
            return Err(km_err!(UnknownError, "GCM finish outside GCM mode"));
        };
        let nonce = self
            .nonce
            .as_deref()
            .ok_or_else(|| km_err!(MissingNonce, "GCM without nonce"))?;
        if self.encrypting() {
            let sealed = with_gcm_cipher!(
                self.key.len(),
                self.tag_len,
                gcm_encrypt(&self.key, nonce, aad, data)
            )?;
            output.append(&sealed)
        } else {
            if data.len() < self.tag_len {
                return Err(km_err!(
                    InvalidInputLength,
                    "ciphertext shorter than the {}-byte tag",
                    self.tag_len
                ));
            }
            let opened = Zeroizing::new(with_gcm_cipher!(
                self.key.len(),
                self.tag_len,
                gcm_decrypt(&self.key, nonce, aad, data)
            )?);
            output.append(&opened)
        }
    }
}

impl OperationBackend for AesOperation {
    fn begin(
        &mut self,
        _input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<()> {
        if self.block_mode != BlockMode::Ecb && self.nonce.is_none() {
            let len = match self.block_mode {
                BlockMode::Gcm => GCM_NONCE_SIZE,
                _ => AES_BLOCK_SIZE,
            };
            let mut nonce = vec![0u8; len];
            self.random.fill_bytes(&mut nonce)?;
            output_params.push(KeyParam::Nonce(nonce.clone()));
            self.nonce = Some(nonce);
        }
        let iv = self.nonce.clone().unwrap_or_default();
        self.state = match self.block_mode {
            BlockMode::Ecb => ModeState::Ecb,
            BlockMode::Cbc => ModeState::Cbc(CbcCipher::new(self.encrypting(), &self.key, &iv)?),
            BlockMode::Ctr => ModeState::Ctr(CtrCipher::new(&self.key, &iv)?),
            BlockMode::Gcm => ModeState::Gcm {
                aad: Vec::new(),
                data: Zeroizing::new(Vec::new()),
            },
        };
        debug!(
            "AES {:?} {:?}/{:?} begun",
            self.purpose, self.block_mode, self.padding
        );
        Ok(())
    }

    fn update(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        _output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize> {
        self.collect_aad(input_params)?;
        if let ModeState::Gcm { data, .. } = &mut self.state {
            if data.len() + input.len() > self.max_gcm_message_len {
                error!(
                    "GCM message would exceed {} bytes",
                    self.max_gcm_message_len
                );
                return Err(km_err!(
                    InvalidInputLength,
                    "GCM messages are limited to {} bytes",
                    self.max_gcm_message_len
                ));
            }
            data.extend_from_slice(input);
        } else if matches!(self.state, ModeState::Ctr(_)) {
            self.apply_keystream(input, output)?;
        } else {
            self.process_blocks(input, output)?;
        }
        Ok(input.len())
    }

    fn finish(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        _signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        if !input.is_empty() || !input_params.is_empty() {
            self.update(input_params, input, output_params, output)?;
        }
        if matches!(self.state, ModeState::Gcm { .. }) {
            self.finish_gcm(output)
        } else if matches!(self.state, ModeState::Ctr(_)) {
            Ok(())
        } else {
            self.finish_blocks(output)
        }
    }

    fn abort(&mut self) -> KmResult<()> {
        self.pending.clear();
        if let ModeState::Gcm { data, .. } = &mut self.state {
            data.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorCode, random::OsRandom};

    fn factory() -> AesKeyFactory {
        AesKeyFactory::new(Arc::new(OsRandom))
    }

    fn load(factory: &AesKeyFactory, material: &[u8], sw: AuthorizationSet) -> Box<dyn Key> {
        factory
            .load_key(
                KeymasterKeyBlob::try_from_slice(material).expect("blob"),
                &AuthorizationSet::new(),
                AuthorizationSet::new(),
                sw,
            )
            .expect("load")
    }

    fn auths(modes: &[BlockMode], paddings: &[PaddingMode]) -> AuthorizationSet {
        let mut set = AuthorizationSet::new()
            .with(KeyParam::Algorithm(Algorithm::Aes))
            .with(KeyParam::Purpose(Purpose::Encrypt))
            .with(KeyParam::Purpose(Purpose::Decrypt))
            .with(KeyParam::CallerNonce);
        for mode in modes {
            set.push(KeyParam::BlockMode(*mode));
        }
        for padding in paddings {
            set.push(KeyParam::Padding(*padding));
        }
        set
    }

    fn run(
        factory: &AesKeyFactory,
        purpose: Purpose,
        key: Box<dyn Key>,
        params: &AuthorizationSet,
        chunks: &[&[u8]],
    ) -> KmResult<(Vec<u8>, AuthorizationSet)> {
        let op_factory = factory.operation_factory(purpose).expect("factory");
        let mut op = op_factory.create_operation(key, params)?;
        let mut begin_out = AuthorizationSet::new();
        op.begin(params, &mut begin_out)?;
        let mut output = Buffer::new();
        for chunk in chunks {
            op.update(&AuthorizationSet::new(), chunk, &mut AuthorizationSet::new(), &mut output)?;
        }
        op.finish(
            &AuthorizationSet::new(),
            &[],
            &[],
            &mut AuthorizationSet::new(),
            &mut output,
        )?;
        Ok((output.into_vec(), begin_out))
    }

    #[test]
    fn generates_every_supported_size() {
        let factory = factory();
        for size in AES_KEY_SIZES {
            let description = AuthorizationSet::new()
                .with(KeyParam::Algorithm(Algorithm::Aes))
                .with(KeyParam::KeySize(*size));
            let created = factory.generate_key(&description).expect("generate");
            assert_eq!(created.key_material.len() * 8, *size as usize);
            assert!(created.hw_enforced.is_empty());
            assert_eq!(created.sw_enforced.key_size(), Some(*size));
        }
    }

    #[test]
    fn rejects_unsupported_sizes() {
        let factory = factory();
        for size in [0u32, 64, 127, 512] {
            let description = AuthorizationSet::new().with(KeyParam::KeySize(size));
            let err = factory.generate_key(&description).unwrap_err();
            assert_eq!(err.code, ErrorCode::UnsupportedKeySize);
        }
        let err = factory.generate_key(&AuthorizationSet::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedKeySize);
        let err = factory
            .import_key(&AuthorizationSet::new(), KeyFormat::Raw, &[0u8; 20])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedKeySize);
    }

    #[test]
    fn gcm_keys_need_min_mac_length() {
        let factory = factory();
        let base = AuthorizationSet::new()
            .with(KeyParam::KeySize(128))
            .with(KeyParam::BlockMode(BlockMode::Gcm));
        let err = factory.generate_key(&base).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingMinMacLength);

        let base = base.with(KeyParam::MinMacLength(100));
        let err = factory.generate_key(&base).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedMinMacLength);

        let not_gcm = AuthorizationSet::new()
            .with(KeyParam::KeySize(128))
            .with(KeyParam::MinMacLength(128));
        let err = factory.generate_key(&not_gcm).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTag);
    }

    #[test]
    fn import_checks_format_and_size_tag() {
        let factory = factory();
        let err = factory
            .import_key(&AuthorizationSet::new(), KeyFormat::Pkcs8, &[0u8; 16])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedKeyFormat);

        let mismatched = AuthorizationSet::new().with(KeyParam::KeySize(256));
        let err = factory
            .import_key(&mismatched, KeyFormat::Raw, &[0u8; 16])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ImportParameterMismatch);

        let created = factory
            .import_key(&AuthorizationSet::new(), KeyFormat::Raw, &[5u8; 24])
            .expect("import");
        assert_eq!(created.sw_enforced.key_size(), Some(192));
        assert_eq!(created.sw_enforced.origin(), Some(KeyOrigin::Imported));
    }

    #[test]
    fn ecb_matches_fips197_vector() {
        let factory = factory();
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").expect("hex");
        let plaintext = hex::decode("00112233445566778899aabbccddeeff").expect("hex");
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Ecb))
            .with(KeyParam::Padding(PaddingMode::None));
        let sw = auths(&[BlockMode::Ecb], &[PaddingMode::None]);
        let (ciphertext, _) = run(
            &factory,
            Purpose::Encrypt,
            load(&factory, &key, sw),
            &params,
            &[&plaintext[..5], &plaintext[5..]],
        )
        .expect("encrypt");
        assert_eq!(hex::encode(ciphertext), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn cbc_pkcs7_round_trip_with_generated_iv() {
        let factory = factory();
        let key = [3u8; 32];
        let sw = auths(&[BlockMode::Cbc], &[PaddingMode::Pkcs7]);
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Cbc))
            .with(KeyParam::Padding(PaddingMode::Pkcs7));
        let message = b"thirty-two bytes of plaintext!!!";
        let (ciphertext, begin_out) = run(
            &factory,
            Purpose::Encrypt,
            load(&factory, &key, sw.try_clone().expect("clone")),
            &params,
            &[&message[..7], &message[7..]],
        )
        .expect("encrypt");
        assert_eq!(ciphertext.len(), 48);
        let iv = begin_out.nonce().expect("iv").to_vec();
        assert_eq!(iv.len(), 16);

        let decrypt_params = params.with(KeyParam::Nonce(iv));
        let (plaintext, _) = run(
            &factory,
            Purpose::Decrypt,
            load(&factory, &key, sw),
            &decrypt_params,
            &[&ciphertext[..16], &ciphertext[16..]],
        )
        .expect("decrypt");
        assert_eq!(plaintext, message);
    }

    #[test]
    fn ctr_is_symmetric_and_rejects_padding() {
        let factory = factory();
        let key = [9u8; 16];
        let sw = auths(&[BlockMode::Ctr], &[PaddingMode::None, PaddingMode::Pkcs7]);
        let nonce = vec![1u8; 16];
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Ctr))
            .with(KeyParam::Padding(PaddingMode::None))
            .with(KeyParam::Nonce(nonce));
        let (ciphertext, _) = run(
            &factory,
            Purpose::Encrypt,
            load(&factory, &key, sw.try_clone().expect("clone")),
            &params,
            &[b"odd length message"],
        )
        .expect("encrypt");
        assert_eq!(ciphertext.len(), 18);
        let (plaintext, _) = run(
            &factory,
            Purpose::Decrypt,
            load(&factory, &key, sw.try_clone().expect("clone")),
            &params,
            &[&ciphertext],
        )
        .expect("decrypt");
        assert_eq!(plaintext, b"odd length message");

        let padded = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Ctr))
            .with(KeyParam::Padding(PaddingMode::Pkcs7));
        let err = factory
            .operation_factory(Purpose::Encrypt)
            .expect("factory")
            .create_operation(load(&factory, &key, sw), &padded)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IncompatiblePaddingMode);
    }

    #[test]
    fn gcm_round_trip_and_tamper_detection() {
        let factory = factory();
        let key = [4u8; 16];
        let sw = auths(&[BlockMode::Gcm], &[PaddingMode::None]).with(KeyParam::MinMacLength(96));
        let nonce = vec![2u8; 12];
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Gcm))
            .with(KeyParam::Padding(PaddingMode::None))
            .with(KeyParam::MacLength(128))
            .with(KeyParam::Nonce(nonce));

        let encrypt = factory.operation_factory(Purpose::Encrypt).expect("factory");
        let mut op = encrypt
            .create_operation(load(&factory, &key, sw.try_clone().expect("clone")), &params)
            .expect("create");
        op.begin(&params, &mut AuthorizationSet::new()).expect("begin");
        let aad = AuthorizationSet::new().with(KeyParam::AssociatedData(b"header".to_vec()));
        let mut ciphertext = Buffer::new();
        op.update(&aad, b"gcm body", &mut AuthorizationSet::new(), &mut ciphertext)
            .expect("update");
        let err = op
            .update(&aad, b"", &mut AuthorizationSet::new(), &mut ciphertext)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTag);

        let mut op = encrypt
            .create_operation(load(&factory, &key, sw.try_clone().expect("clone")), &params)
            .expect("create");
        op.begin(&params, &mut AuthorizationSet::new()).expect("begin");
        let mut ciphertext = Buffer::new();
        op.update(&aad, b"gcm body", &mut AuthorizationSet::new(), &mut ciphertext)
            .expect("update");
        op.finish(&AuthorizationSet::new(), &[], &[], &mut AuthorizationSet::new(), &mut ciphertext)
            .expect("finish");
        let mut sealed = ciphertext.into_vec();
        assert_eq!(sealed.len(), 8 + 16);

        let decrypt = factory.operation_factory(Purpose::Decrypt).expect("factory");
        let mut op = decrypt
            .create_operation(load(&factory, &key, sw.try_clone().expect("clone")), &params)
            .expect("create");
        op.begin(&params, &mut AuthorizationSet::new()).expect("begin");
        let mut plaintext = Buffer::new();
        op.finish(&aad, &sealed, &[], &mut AuthorizationSet::new(), &mut plaintext)
            .expect("finish");
        assert_eq!(plaintext.as_slice(), b"gcm body");

        sealed[0] ^= 0x80;
        let mut op = decrypt
            .create_operation(load(&factory, &key, sw), &params)
            .expect("create");
        op.begin(&params, &mut AuthorizationSet::new()).expect("begin");
        let mut plaintext = Buffer::new();
        let err = op
            .finish(&aad, &sealed, &[], &mut AuthorizationSet::new(), &mut plaintext)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::VerificationFailed);
        assert!(plaintext.is_empty());
    }

    #[test]
    fn gcm_mac_length_validation() {
        let factory = factory();
        let key = [4u8; 16];
        let sw = auths(&[BlockMode::Gcm], &[PaddingMode::None]).with(KeyParam::MinMacLength(112));
        let encrypt = factory.operation_factory(Purpose::Encrypt).expect("factory");
        let base = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Gcm))
            .with(KeyParam::Padding(PaddingMode::None));
        let cases = [
            (None, ErrorCode::MissingMacLength),
            (Some(100), ErrorCode::UnsupportedMacLength),
            (Some(136), ErrorCode::UnsupportedMacLength),
            (Some(104), ErrorCode::InvalidMacLength),
        ];
        for (mac_length, expected) in cases {
            let mut params = base.try_clone().expect("clone");
            if let Some(len) = mac_length {
                params.push(KeyParam::MacLength(len));
            }
            let err = encrypt
                .create_operation(load(&factory, &key, sw.try_clone().expect("clone")), &params)
                .unwrap_err();
            assert_eq!(err.code, expected, "mac length {mac_length:?}");
        }
    }

    #[test]
    fn nonce_rules() {
        let factory = factory();
        let key = [4u8; 16];
        let no_caller_nonce = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Cbc))
            .with(KeyParam::Padding(PaddingMode::None));
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Cbc))
            .with(KeyParam::Padding(PaddingMode::None));

        let with_nonce = params.try_clone().expect("clone").with(KeyParam::Nonce(vec![0; 16]));
        let err = factory
            .operation_factory(Purpose::Encrypt)
            .expect("factory")
            .create_operation(
                load(&factory, &key, no_caller_nonce.try_clone().expect("clone")),
                &with_nonce,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CallerNonceProhibited);

        let err = factory
            .operation_factory(Purpose::Decrypt)
            .expect("factory")
            .create_operation(
                load(&factory, &key, no_caller_nonce.try_clone().expect("clone")),
                &params,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingNonce);

        let short = params.with(KeyParam::Nonce(vec![0; 8]));
        let err = factory
            .operation_factory(Purpose::Decrypt)
            .expect("factory")
            .create_operation(load(&factory, &key, no_caller_nonce), &short)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidNonce);
    }

    #[test]
    fn unaligned_input_without_padding_fails_at_finish() {
        let factory = factory();
        let key = [4u8; 16];
        let sw = auths(&[BlockMode::Ecb], &[PaddingMode::None]);
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Ecb))
            .with(KeyParam::Padding(PaddingMode::None));
        let err = run(&factory, Purpose::Encrypt, load(&factory, &key, sw), &params, &[b"short"])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInputLength);
    }

    #[test]
    fn block_mode_must_be_authorized() {
        let factory = factory();
        let key = [4u8; 16];
        let sw = auths(&[BlockMode::Ecb], &[PaddingMode::None]);
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Cbc))
            .with(KeyParam::Padding(PaddingMode::None));
        let err = factory
            .operation_factory(Purpose::Encrypt)
            .expect("factory")
            .create_operation(load(&factory, &key, sw), &params)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IncompatibleBlockMode);
    }

    #[test]
    fn cbc_and_ctr_match_sp800_38a_vectors() {
        let factory = factory();
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").expect("hex");
        let plaintext = hex::decode(
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51",
        )
        .expect("hex");

        let cbc = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Cbc))
            .with(KeyParam::Padding(PaddingMode::None))
            .with(KeyParam::Nonce(
                hex::decode("000102030405060708090a0b0c0d0e0f").expect("hex"),
            ));
        let sw = auths(&[BlockMode::Cbc, BlockMode::Ctr], &[PaddingMode::None]);
        let (ciphertext, _) = run(
            &factory,
            Purpose::Encrypt,
            load(&factory, &key, sw.try_clone().expect("clone")),
            &cbc,
            &[&plaintext[..5], &plaintext[5..]],
        )
        .expect("cbc encrypt");
        assert_eq!(
            hex::encode(&ciphertext),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );
        let (decrypted, _) = run(
            &factory,
            Purpose::Decrypt,
            load(&factory, &key, sw.try_clone().expect("clone")),
            &cbc,
            &[&ciphertext[..20], &ciphertext[20..]],
        )
        .expect("cbc decrypt");
        assert_eq!(decrypted, plaintext);

        let ctr = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Ctr))
            .with(KeyParam::Padding(PaddingMode::None))
            .with(KeyParam::Nonce(
                hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").expect("hex"),
            ));
        let (ciphertext, _) = run(
            &factory,
            Purpose::Encrypt,
            load(&factory, &key, sw),
            &ctr,
            &[&plaintext[..7], &plaintext[7..]],
        )
        .expect("ctr encrypt");
        assert_eq!(
            hex::encode(ciphertext),
            "874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff"
        );
    }

    #[test]
    fn gcm_message_is_bounded_by_limits() {
        let factory = AesKeyFactory::with_limits(
            Arc::new(OsRandom),
            AesLimits {
                max_gcm_message_len: 16,
            },
        );
        let key = [4u8; 16];
        let sw = auths(&[BlockMode::Gcm], &[PaddingMode::None]).with(KeyParam::MinMacLength(128));
        let params = AuthorizationSet::new()
            .with(KeyParam::BlockMode(BlockMode::Gcm))
            .with(KeyParam::Padding(PaddingMode::None))
            .with(KeyParam::MacLength(128));
        let mut op = factory
            .operation_factory(Purpose::Encrypt)
            .expect("factory")
            .create_operation(load(&factory, &key, sw), &params)
            .expect("create");
        op.begin(&params, &mut AuthorizationSet::new()).expect("begin");
        let mut output = Buffer::new();
        op.update(&AuthorizationSet::new(), &[0u8; 10], &mut AuthorizationSet::new(), &mut output)
            .expect("within limit");
        let err = op
            .update(&AuthorizationSet::new(), &[0u8; 7], &mut AuthorizationSet::new(), &mut output)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInputLength);
    }

    #[test]
    fn oversized_material_does_not_wrap_to_a_key_size() {
        assert_eq!(material_bits(16), Some(128));
        assert_eq!(material_bits((1 << 29) + 2), None);
        assert_eq!(material_bits(usize::MAX), None);
    }

    #[test]
    fn raw_format_round_trips() {
        let factory = factory();
        let created = factory
            .import_key(&AuthorizationSet::new(), KeyFormat::Raw, &[7u8; 32])
            .expect("import");
        let key = factory
            .load_key(
                created.key_material,
                &AuthorizationSet::new(),
                created.hw_enforced,
                created.sw_enforced,
            )
            .expect("load");
        assert_eq!(key.formatted_key_material(KeyFormat::Raw).expect("raw"), vec![7u8; 32]);
        assert_eq!(
            key.formatted_key_material(KeyFormat::X509).unwrap_err().code,
            ErrorCode::UnsupportedKeyFormat
        );
    }
}
