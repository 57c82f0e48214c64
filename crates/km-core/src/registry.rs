//! Algorithm to key factory table, built once and read-only afterwards.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use tracing::info;

use crate::{
    aes::AesKeyFactory,
    config::{Backend, KeymasterConfig},
    engine::{Engine, PassthroughKeyFactory},
    error::KmResult,
    key::KeyFactory,
    km_err,
    legacy::{LegacyEngine, RsaLegacyKeyFactory},
    operation::{KeyType, OperationFactory},
    random::RandomSource,
    rsa::RsaKeyFactory,
    types::Algorithm,
};

static GLOBAL_REGISTRY: OnceLock<KeyFactoryRegistry> = OnceLock::new();

pub struct KeyFactoryRegistry {
    key_factories: HashMap<Algorithm, Arc<dyn KeyFactory>>,
}

impl fmt::Debug for KeyFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFactoryRegistry")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

impl KeyFactoryRegistry {
    pub fn builder() -> KeyFactoryRegistryBuilder {
        KeyFactoryRegistryBuilder::default()
    }

    /// Wires the backend `config` selects for each algorithm.
    pub fn from_config(
        config: &KeymasterConfig,
        engine: Option<Arc<dyn Engine>>,
        legacy_engine: Option<Arc<dyn LegacyEngine>>,
        random: Arc<dyn RandomSource>,
    ) -> KmResult<Self> {
        config.validate()?;
        let require_engine = || {
            engine
                .clone()
                .ok_or_else(|| km_err!(KeymasterNotConfigured, "passthrough selected without an engine"))
        };

        let aes: Arc<dyn KeyFactory> = match config.backends.aes {
            Backend::Software => Arc::new(AesKeyFactory::with_limits(random.clone(), config.aes)),
            Backend::Passthrough => Arc::new(PassthroughKeyFactory::new(require_engine()?, Algorithm::Aes)),
            Backend::Legacy => {
                return Err(km_err!(InvalidArgument, "the legacy backend only serves RSA"));
            }
        };
        let rsa: Arc<dyn KeyFactory> = match config.backends.rsa {
            Backend::Software => Arc::new(RsaKeyFactory::new(random.clone(), config.rsa)),
            Backend::Passthrough => Arc::new(PassthroughKeyFactory::new(require_engine()?, Algorithm::Rsa)),
            Backend::Legacy => {
                let legacy_engine = legacy_engine.ok_or_else(|| {
                    km_err!(KeymasterNotConfigured, "legacy backend selected without an engine")
                })?;
                Arc::new(RsaLegacyKeyFactory::new(legacy_engine, random.clone(), config.rsa))
            }
        };
        info!(
            "key factories: aes={:?} rsa={:?}",
            config.backends.aes, config.backends.rsa
        );
        Ok(Self::builder().register(aes)?.register(rsa)?.build())
    }

    pub fn key_factory(&self, algorithm: Algorithm) -> Option<Arc<dyn KeyFactory>> {
        self.key_factories.get(&algorithm).cloned()
    }

    pub fn operation_factory(&self, key_type: KeyType) -> Option<Arc<dyn OperationFactory>> {
        self.key_factories
            .get(&key_type.algorithm)?
            .operation_factory(key_type.purpose)
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms: Vec<_> = self.key_factories.keys().copied().collect();
        algorithms.sort();
        algorithms
    }
}

#[derive(Default)]
pub struct KeyFactoryRegistryBuilder {
    key_factories: HashMap<Algorithm, Arc<dyn KeyFactory>>,
}

impl KeyFactoryRegistryBuilder {
    pub fn register(mut self, factory: Arc<dyn KeyFactory>) -> KmResult<Self> {
        let algorithm = factory.registry_key();
        if self.key_factories.contains_key(&algorithm) {
            return Err(km_err!(InvalidArgument, "{algorithm:?} registered twice"));
        }
        self.key_factories.insert(algorithm, factory);
        Ok(self)
    }

    pub fn build(self) -> KeyFactoryRegistry {
        KeyFactoryRegistry {
            key_factories: self.key_factories,
        }
    }
}

/// Installs the process-wide registry. Only the first call succeeds.
pub fn install_global(registry: KeyFactoryRegistry) -> KmResult<&'static KeyFactoryRegistry> {
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| km_err!(InvalidArgument, "key factory registry already installed"))?;
    global()
}

pub fn global() -> KmResult<&'static KeyFactoryRegistry> {
    GLOBAL_REGISTRY
        .get()
        .ok_or_else(|| km_err!(KeymasterNotConfigured, "key factory registry not installed"))
}
