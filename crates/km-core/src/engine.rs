//! Hardware engines and the passthrough key factory, key and operation that
//! forward every call to one.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use tracing::debug;

use crate::{
    authorization::AuthorizationSet,
    buffer::{Buffer, KeymasterKeyBlob},
    error::KmResult,
    key::{Key, KeyCreation, KeyFactory},
    km_err,
    operation::{KeyType, Operation, OperationBackend, OperationFactory},
    random::OsRandom,
    types::{Algorithm, BlockMode, Digest, KeyFormat, PaddingMode, Purpose},
};

/// A hardware module that owns key material and runs operations itself.
///
/// Error codes returned by an engine are surfaced to callers unchanged.
pub trait Engine: Send + Sync {
    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation>;

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation>;

    fn export_key(
        &self,
        format: KeyFormat,
        key_material: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<Vec<u8>>;

    fn supported_import_formats(&self, algorithm: Algorithm) -> Vec<KeyFormat>;

    fn supported_export_formats(&self, algorithm: Algorithm) -> Vec<KeyFormat>;

    /// Starts an operation and returns the engine's own handle for it.
    fn begin_operation(
        &self,
        purpose: Purpose,
        key_material: &KeymasterKeyBlob,
        input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<u64>;

    fn update_operation(
        &self,
        handle: u64,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize>;

    fn finish_operation(
        &self,
        handle: u64,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()>;

    fn abort_operation(&self, handle: u64) -> KmResult<()>;

    fn operation_factory(
        &self,
        purpose: Purpose,
        algorithm: Algorithm,
    ) -> Option<Arc<dyn OperationFactory>> {
        passthrough_operation_factory(KeyType::new(algorithm, purpose))
    }
}

const PASSTHROUGH_KEY_TYPES: &[(Algorithm, &[Purpose])] = &[
    (
        Algorithm::Rsa,
        &[Purpose::Sign, Purpose::Verify, Purpose::Encrypt, Purpose::Decrypt],
    ),
    (Algorithm::Ec, &[Purpose::Sign, Purpose::Verify]),
    (Algorithm::Aes, &[Purpose::Encrypt, Purpose::Decrypt]),
    (Algorithm::TripleDes, &[Purpose::Encrypt, Purpose::Decrypt]),
    (Algorithm::Hmac, &[Purpose::Sign, Purpose::Verify]),
];

/// Process-wide passthrough operation factories, one per key type an
/// engine can serve.
fn passthrough_operation_factory(key_type: KeyType) -> Option<Arc<dyn OperationFactory>> {
    static TABLE: OnceLock<HashMap<KeyType, Arc<dyn OperationFactory>>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            PASSTHROUGH_KEY_TYPES
                .iter()
                .flat_map(|(algorithm, purposes)| {
                    purposes.iter().map(move |purpose| {
                        let key_type = KeyType::new(*algorithm, *purpose);
                        let factory: Arc<dyn OperationFactory> =
                            Arc::new(PassthroughOperationFactory::new(key_type));
                        (key_type, factory)
                    })
                })
                .collect()
        })
        .get(&key_type)
        .cloned()
}

/// Key factory that holds no cryptographic state of its own.
pub struct PassthroughKeyFactory {
    engine: Arc<dyn Engine>,
    algorithm: Algorithm,
}

impl PassthroughKeyFactory {
    pub fn new(engine: Arc<dyn Engine>, algorithm: Algorithm) -> Self {
        Self { engine, algorithm }
    }
}

impl KeyFactory for PassthroughKeyFactory {
    fn registry_key(&self) -> Algorithm {
        self.algorithm
    }

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        description.check_valid()?;
        self.engine.generate_key(description)
    }

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation> {
        description.check_valid()?;
        self.engine
            .import_key(description, input_format, input_material)
    }

    fn load_key(
        &self,
        key_material: KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
    ) -> KmResult<Box<dyn Key>> {
        Ok(Box::new(PassthroughKey::new(
            self.algorithm,
            key_material,
            hw_enforced,
            sw_enforced,
            additional_params,
            self.engine.clone(),
        )?))
    }

    fn operation_factory(&self, purpose: Purpose) -> Option<Arc<dyn OperationFactory>> {
        self.engine.operation_factory(purpose, self.algorithm)
    }

    fn supported_import_formats(&self) -> Vec<KeyFormat> {
        self.engine.supported_import_formats(self.algorithm)
    }

    fn supported_export_formats(&self) -> Vec<KeyFormat> {
        self.engine.supported_export_formats(self.algorithm)
    }
}

/// Key whose material is only meaningful to the engine that made it.
pub struct PassthroughKey {
    algorithm: Algorithm,
    key_material: KeymasterKeyBlob,
    hw_enforced: AuthorizationSet,
    sw_enforced: AuthorizationSet,
    additional_params: AuthorizationSet,
    engine: Arc<dyn Engine>,
}

impl PassthroughKey {
    pub fn new(
        algorithm: Algorithm,
        key_material: KeymasterKeyBlob,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
        additional_params: &AuthorizationSet,
        engine: Arc<dyn Engine>,
    ) -> KmResult<Self> {
        hw_enforced.check_valid()?;
        sw_enforced.check_valid()?;
        Ok(Self {
            algorithm,
            key_material,
            hw_enforced,
            sw_enforced,
            additional_params: additional_params.try_clone()?,
            engine,
        })
    }

    pub fn additional_params(&self) -> &AuthorizationSet {
        &self.additional_params
    }
}

impl fmt::Debug for PassthroughKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughKey")
            .field("algorithm", &self.algorithm)
            .field("key_material", &self.key_material)
            .field("hw_enforced", &self.hw_enforced)
            .field("sw_enforced", &self.sw_enforced)
            .finish_non_exhaustive()
    }
}

impl Key for PassthroughKey {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
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
        self.engine
            .export_key(format, &self.key_material, &self.additional_params)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

const ALL_PADDINGS: &[PaddingMode] = &[
    PaddingMode::None,
    PaddingMode::RsaOaep,
    PaddingMode::RsaPss,
    PaddingMode::RsaPkcs1_1_5Encrypt,
    PaddingMode::RsaPkcs1_1_5Sign,
    PaddingMode::Pkcs7,
];
const ALL_BLOCK_MODES: &[BlockMode] = &[BlockMode::Ecb, BlockMode::Cbc, BlockMode::Ctr, BlockMode::Gcm];
const ALL_DIGESTS: &[Digest] = &[
    Digest::None,
    Digest::Md5,
    Digest::Sha1,
    Digest::Sha224,
    Digest::Sha256,
    Digest::Sha384,
    Digest::Sha512,
];

/// Leaves every parameter check to the engine, so it advertises everything.
pub struct PassthroughOperationFactory {
    key_type: KeyType,
}

impl PassthroughOperationFactory {
    pub fn new(key_type: KeyType) -> Self {
        Self { key_type }
    }
}

impl OperationFactory for PassthroughOperationFactory {
    fn registry_key(&self) -> KeyType {
        self.key_type
    }

    fn create_operation(
        &self,
        key: Box<dyn Key>,
        _begin_params: &AuthorizationSet,
    ) -> KmResult<Operation> {
        let key = key
            .into_any()
            .downcast::<PassthroughKey>()
            .map_err(|_| km_err!(IncompatibleAlgorithm, "passthrough factory given a software key"))?;
        let PassthroughKey {
            key_material,
            hw_enforced,
            sw_enforced,
            engine,
            ..
        } = *key;
        let purpose = self.key_type.purpose;
        let backend = PassthroughOperation {
            purpose,
            key_material,
            engine,
            handle: None,
        };
        Ok(Operation::new(
            purpose,
            hw_enforced,
            sw_enforced,
            Arc::new(OsRandom),
            Box::new(backend),
        ))
    }

    fn supported_padding_modes(&self) -> &[PaddingMode] {
        ALL_PADDINGS
    }

    fn supported_block_modes(&self) -> &[BlockMode] {
        ALL_BLOCK_MODES
    }

    fn supported_digests(&self) -> &[Digest] {
        ALL_DIGESTS
    }
}

struct PassthroughOperation {
    purpose: Purpose,
    key_material: KeymasterKeyBlob,
    engine: Arc<dyn Engine>,
    handle: Option<u64>,
}

impl PassthroughOperation {
    fn engine_handle(&self) -> KmResult<u64> {
        self.handle
            .ok_or_else(|| km_err!(InvalidOperation, "engine operation not started"))
    }
}

impl OperationBackend for PassthroughOperation {
    fn begin(
        &mut self,
        input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<()> {
        let handle =
            self.engine
                .begin_operation(self.purpose, &self.key_material, input_params, output_params)?;
        debug!("engine began {:?} operation {handle:#x}", self.purpose);
        self.handle = Some(handle);
        Ok(())
    }

    fn update(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize> {
        let handle = self.engine_handle()?;
        self.engine
            .update_operation(handle, input_params, input, output_params, output)
    }

    fn finish(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        let handle = self.engine_handle()?;
        let result = self.engine.finish_operation(
            handle,
            input_params,
            input,
            signature,
            output_params,
            output,
        );
        self.handle = None;
        result
    }

    fn abort(&mut self) -> KmResult<()> {
        match self.handle.take() {
            Some(handle) => self.engine.abort_operation(handle),
            None => {
                debug!("no engine operation to abort");
                Ok(())
            }
        }
    }
}
