//! FerroKM key and operation core. Key factories create, import and reload
//! keys; operation factories negotiate padding, digest and block mode and
//! drive the Begin/Update/Finish/Abort state machine; engines let a hardware
//! module stand in for the software implementations. Service front ends talk
//! to [`KeyManager`].

pub mod aes;
pub mod authorization;
pub mod blob;
pub mod buffer;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod key;
pub mod legacy;
pub mod operation;
pub mod operation_table;
pub mod padding;
pub mod random;
pub mod registry;
pub mod rsa;
pub mod types;

pub use aes::{AesKey, AesKeyFactory, AesOperationFactory};
pub use authorization::{AuthProxy, AuthorizationSet, AuthorizationView, KeyParam, SetValidity, Tag};
pub use blob::{KeyBlobMaker, ParsedKeyBlob, SealingBlobMaker};
pub use buffer::{Buffer, KeymasterKeyBlob};
pub use config::{AesLimits, Backend, BackendSelection, KeymasterConfig, RsaLimits};
pub use engine::{Engine, PassthroughKey, PassthroughKeyFactory, PassthroughOperationFactory};
pub use error::{ErrorCode, KmError, KmResult};
pub use key::{Key, KeyCreation, KeyFactory};
pub use legacy::{LegacyEngine, RsaLegacyKeyFactory, SoftwareFallback};
pub use operation::{KeyType, Operation, OperationBackend, OperationFactory, OperationState};
pub use operation_table::OperationTable;
pub use random::{OsRandom, RandomSource};
pub use registry::KeyFactoryRegistry;
pub use rsa::{RsaKey, RsaKeyFactory, RsaOperationFactory, RsaPrivateTransform};
pub use types::{
    Algorithm, BlockMode, Digest, KeyFormat, KeyOrigin, OperationHandle, PaddingMode, Purpose,
};

use std::sync::Arc;

use tracing::{debug, info};

/// A stored key blob and the characteristics it was sealed with.
#[derive(Debug)]
pub struct KeyCharacteristics {
    pub key_blob: KeymasterKeyBlob,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
}

/// Entry point composing the factory registry, blob sealing and the table
/// of in-flight operations.
pub struct KeyManager<B: KeyBlobMaker + ?Sized> {
    registry: Arc<KeyFactoryRegistry>,
    blobs: Arc<B>,
    operations: OperationTable,
    confirmation_message_max_len: usize,
}

impl<B> KeyManager<B>
where
    B: KeyBlobMaker + ?Sized,
{
    pub fn new(config: &KeymasterConfig, registry: Arc<KeyFactoryRegistry>, blobs: Arc<B>) -> Self {
        Self {
            registry,
            blobs,
            operations: OperationTable::new(config.max_operations),
            confirmation_message_max_len: config.confirmation_message_max_len,
        }
    }

    pub fn registry(&self) -> &KeyFactoryRegistry {
        &self.registry
    }

    pub fn active_operations(&self) -> usize {
        self.operations.len()
    }

    fn factory_for(&self, algorithm: Option<Algorithm>) -> KmResult<(Algorithm, Arc<dyn KeyFactory>)> {
        let algorithm =
            algorithm.ok_or_else(|| km_err!(UnsupportedAlgorithm, "no algorithm specified"))?;
        let factory = self
            .registry
            .key_factory(algorithm)
            .ok_or_else(|| km_err!(UnsupportedAlgorithm, "{algorithm:?} has no key factory"))?;
        Ok((algorithm, factory))
    }

    fn seal(
        &self,
        algorithm: Algorithm,
        creation: KeyCreation,
        description: &AuthorizationSet,
    ) -> KmResult<KeyCharacteristics> {
        let key_blob = self
            .blobs
            .create_key_blob(algorithm, &creation, description)?;
        Ok(KeyCharacteristics {
            key_blob,
            hw_enforced: creation.hw_enforced,
            sw_enforced: creation.sw_enforced,
        })
    }

    /// Generates a key; `ApplicationId`/`ApplicationData` in `description`
    /// must accompany every later use of the blob.
    pub fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCharacteristics> {
        description.check_valid()?;
        let (algorithm, factory) = self.factory_for(description.algorithm())?;
        let creation = factory.generate_key(description)?;
        info!("generated {algorithm:?} key");
        self.seal(algorithm, creation, description)
    }

    pub fn import_key(
        &self,
        description: &AuthorizationSet,
        format: KeyFormat,
        key_data: &[u8],
    ) -> KmResult<KeyCharacteristics> {
        description.check_valid()?;
        let (algorithm, factory) = self.factory_for(description.algorithm())?;
        if !factory.supported_import_formats().contains(&format) {
            return Err(km_err!(UnsupportedKeyFormat, "{algorithm:?} cannot import {format:?}"));
        }
        let creation = factory.import_key(description, format, key_data)?;
        info!("imported {algorithm:?} key from {format:?}");
        self.seal(algorithm, creation, description)
    }

    pub fn load_key(
        &self,
        key_blob: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<Box<dyn Key>> {
        let parsed = self.blobs.parse_key_blob(key_blob, additional_params)?;
        let (_, factory) = self.factory_for(Some(parsed.algorithm))?;
        factory.load_key(
            parsed.key_material,
            additional_params,
            parsed.hw_enforced,
            parsed.sw_enforced,
        )
    }

    pub fn export_key(
        &self,
        format: KeyFormat,
        key_blob: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<Vec<u8>> {
        let key = self.load_key(key_blob, additional_params)?;
        let (algorithm, factory) = self.factory_for(Some(key.algorithm()))?;
        if !factory.supported_export_formats().contains(&format) {
            return Err(km_err!(UnsupportedKeyFormat, "{algorithm:?} cannot export {format:?}"));
        }
        key.formatted_key_material(format)
    }

    /// Starts an operation with the key in `key_blob`. `begin_params` also
    /// carries the application binding the blob was created with.
    pub fn begin(
        &self,
        purpose: Purpose,
        key_blob: &KeymasterKeyBlob,
        begin_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<OperationHandle> {
        let key = self.load_key(key_blob, begin_params)?;
        let algorithm = key.algorithm();
        if !key.authorizations().purposes().any(|p| p == purpose) {
            return Err(km_err!(IncompatiblePurpose, "key not authorized for {purpose:?}"));
        }
        let factory = self
            .registry
            .operation_factory(KeyType::new(algorithm, purpose))
            .ok_or_else(|| km_err!(UnsupportedPurpose, "{algorithm:?} does not support {purpose:?}"))?;
        if self.operations.is_full() {
            return Err(km_err!(
                TooManyOperations,
                "{} operations already in flight",
                self.operations.capacity()
            ));
        }

        let key_id = key_id(key_blob)?;
        let mut operation = factory.create_operation(key, begin_params)?;
        operation.set_key_id(key_id);
        operation.set_confirmation_message_max_len(self.confirmation_message_max_len);
        operation.begin(begin_params, output_params)?;
        let handle = self.operations.add(operation)?;
        debug!("{algorithm:?} {purpose:?} operation {handle} for key {key_id:#018x}");
        Ok(handle)
    }

    /// Returns the bytes of `input` consumed.
    pub fn update(
        &self,
        handle: OperationHandle,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize> {
        let mut operation = self.operations.take(handle)?;
        let result = operation.update(input_params, input, output_params, output);
        if operation.state().is_terminal() {
            self.operations.remove(handle);
        } else {
            self.operations.restore(operation)?;
        }
        result
    }

    pub fn finish(
        &self,
        handle: OperationHandle,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        let mut operation = self.operations.take(handle)?;
        let result = operation.finish(input_params, input, signature, output_params, output);
        self.operations.remove(handle);
        result
    }

    pub fn abort(&self, handle: OperationHandle) -> KmResult<()> {
        let mut operation = self.operations.take(handle)?;
        let result = operation.abort();
        self.operations.remove(handle);
        result
    }
}

/// Stable identifier of a key blob, for logs and per-key bookkeeping.
pub fn key_id(key_blob: &KeymasterKeyBlob) -> KmResult<u64> {
    let hashed = digest::hash(Digest::Sha256, key_blob.as_slice())?;
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hashed[..8]);
    Ok(u64::from_be_bytes(prefix))
}
