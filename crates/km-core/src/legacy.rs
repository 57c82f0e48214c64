//! RSA on legacy hardware that only performs undigested operations.
//!
//! Key descriptions asking for digests the engine lacks are rewritten so the
//! hardware runs with no digest (and no padding when PSS or OAEP are wanted),
//! and the software operations in [`crate::rsa`] digest and pad above the
//! engine's raw private-key primitive. Characteristics the hardware cannot
//! honor are recorded as software enforced.

use std::sync::Arc;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    traits::PublicKeyParts,
};
use tracing::{debug, info, warn};

use crate::{
    authorization::{AuthorizationSet, AuthorizationView, KeyParam, Tag},
    buffer::KeymasterKeyBlob,
    config::RsaLimits,
    error::KmResult,
    key::{Key, KeyCreation, KeyFactory, check_algorithm},
    km_err,
    operation::OperationFactory,
    random::RandomSource,
    rsa::{
        RsaKey, RsaOperationFactory, RsaPrivateTransform, pick_rsa_factory,
        rsa_operation_factories,
    },
    types::{Algorithm, Digest, KeyFormat, PaddingMode, Purpose},
};

/// A keymaster1-class hardware module.
pub trait LegacyEngine: Send + Sync {
    /// Digests the hardware can compute for keys of `algorithm`.
    fn supported_digests(&self, algorithm: Algorithm) -> Vec<Digest>;

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation>;

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation>;

    /// SubjectPublicKeyInfo DER of a hardware key.
    fn export_public_key(
        &self,
        key_material: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
    ) -> KmResult<Vec<u8>>;

    /// Undigested private-key operation on a modulus-sized input. `padding`
    /// follows [`RsaPrivateTransform::private_operation`].
    fn private_operation(
        &self,
        key_material: &KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
        purpose: Purpose,
        padding: PaddingMode,
        input: &[u8],
    ) -> KmResult<Vec<u8>>;
}

/// What a description rewrite moved from hardware to software.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SoftwareFallback {
    pub digests: Vec<Digest>,
    pub paddings: Vec<PaddingMode>,
}

impl SoftwareFallback {
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty() && self.paddings.is_empty()
    }

    fn covers(&self, param: &KeyParam) -> bool {
        match param {
            KeyParam::Digest(digest) => self.digests.contains(digest),
            KeyParam::Padding(padding) => self.paddings.contains(padding),
            _ => false,
        }
    }
}

/// Rewrites `description` for an engine supporting `hardware_digests`.
pub fn augment_description(
    description: &AuthorizationSet,
    hardware_digests: &[Digest],
) -> KmResult<(AuthorizationSet, SoftwareFallback)> {
    description.check_valid()?;
    let mut augmented = description.try_clone()?;
    let mut fallback = SoftwareFallback::default();

    // Digest::None is what the hardware runs with, never a digest to compute.
    for digest in description.digests().filter(|d| *d != Digest::None) {
        if !hardware_digests.contains(&digest) && !fallback.digests.contains(&digest) {
            fallback.digests.push(digest);
        }
    }
    if fallback.digests.is_empty() {
        if description.contains_param(&KeyParam::Digest(Digest::None))
            && description.tag_count(Tag::Digest) > 1
        {
            debug!("description mixes no-digest with hardware digests; left as given");
        }
        return Ok((augmented, fallback));
    }

    if !description.contains_param(&KeyParam::Digest(Digest::None)) {
        augmented.push(KeyParam::Digest(Digest::None));
    }
    for padding in [PaddingMode::RsaPss, PaddingMode::RsaOaep] {
        if description.contains_param(&KeyParam::Padding(padding)) {
            fallback.paddings.push(padding);
        }
    }
    if !fallback.paddings.is_empty() && !description.contains_param(&KeyParam::Padding(PaddingMode::None)) {
        augmented.push(KeyParam::Padding(PaddingMode::None));
    }
    augmented.check_valid()?;
    info!(
        "legacy RSA falls back to software for {:?} and {:?}",
        fallback.digests, fallback.paddings
    );
    Ok((augmented, fallback))
}

/// Moves hardware-enforced entries covered by `fallback` to the software
/// set. Never moves anything the other way.
pub fn settle_characteristics(
    creation: KeyCreation,
    fallback: &SoftwareFallback,
) -> KmResult<KeyCreation> {
    let KeyCreation {
        key_material,
        hw_enforced,
        mut sw_enforced,
    } = creation;
    hw_enforced.check_valid()?;
    sw_enforced.check_valid()?;
    if fallback.is_empty() {
        return Ok(KeyCreation {
            key_material,
            hw_enforced,
            sw_enforced,
        });
    }

    let mut settled_hw = AuthorizationSet::new();
    for param in hw_enforced.iter() {
        if fallback.covers(param) {
            if !sw_enforced.contains_param(param) {
                sw_enforced.push(param.clone());
            }
        } else {
            settled_hw.push(param.clone());
        }
    }
    settled_hw.check_valid()?;
    sw_enforced.check_valid()?;
    Ok(KeyCreation {
        key_material,
        hw_enforced: settled_hw,
        sw_enforced,
    })
}

/// Private half of an RSA key that lives in a legacy engine.
pub struct LegacyRsaPrivate {
    engine: Arc<dyn LegacyEngine>,
    key_material: KeymasterKeyBlob,
    additional_params: AuthorizationSet,
}

impl RsaPrivateTransform for LegacyRsaPrivate {
    fn private_operation(
        &self,
        purpose: Purpose,
        padding: PaddingMode,
        input: &[u8],
    ) -> KmResult<Vec<u8>> {
        self.engine.private_operation(
            &self.key_material,
            &self.additional_params,
            purpose,
            padding,
            input,
        )
    }
}

pub struct RsaLegacyKeyFactory {
    engine: Arc<dyn LegacyEngine>,
    limits: RsaLimits,
    operations: [Arc<RsaOperationFactory>; 4],
}

impl RsaLegacyKeyFactory {
    pub fn new(engine: Arc<dyn LegacyEngine>, random: Arc<dyn RandomSource>, limits: RsaLimits) -> Self {
        Self {
            engine,
            limits,
            operations: rsa_operation_factories(&random),
        }
    }

    fn augment(&self, description: &AuthorizationSet) -> KmResult<(AuthorizationSet, SoftwareFallback)> {
        augment_description(description, &self.engine.supported_digests(Algorithm::Rsa))
    }
}

impl KeyFactory for RsaLegacyKeyFactory {
    fn registry_key(&self) -> Algorithm {
        Algorithm::Rsa
    }

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        check_algorithm(description, Algorithm::Rsa)?;
        if let Some(key_size) = description.key_size()
            && !self.key_size_supported(key_size)
        {
            return Err(km_err!(UnsupportedKeySize, "RSA-{key_size}"));
        }
        let (augmented, fallback) = self.augment(description)?;
        let creation = self.engine.generate_key(&augmented)?;
        settle_characteristics(creation, &fallback)
    }

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation> {
        check_algorithm(description, Algorithm::Rsa)?;
        if input_format != KeyFormat::Pkcs8 {
            return Err(km_err!(UnsupportedKeyFormat, "RSA import from {input_format:?}"));
        }
        let key_size = RsaPrivateKey::from_pkcs8_der(input_material)
            .map(|key| key.n().bits())
            .map_err(|err| km_err!(InvalidArgument, "RSA PKCS#8 parse failed: {err}"))?;
        if !u32::try_from(key_size).is_ok_and(|bits| self.key_size_supported(bits)) {
            warn!("refusing legacy import of a {key_size}-bit RSA key");
            return Err(km_err!(UnsupportedKeySize, "imported RSA-{key_size}"));
        }
        let (augmented, fallback) = self.augment(description)?;
        let creation = self
            .engine
            .import_key(&augmented, input_format, input_material)?;
        settle_characteristics(creation, &fallback)
    }

    fn load_key(
        &self,
        key_material: KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
    ) -> KmResult<Box<dyn Key>> {
        hw_enforced.check_valid()?;
        sw_enforced.check_valid()?;
        let spki = self
            .engine
            .export_public_key(&key_material, additional_params)?;
        let public = RsaPublicKey::from_public_key_der(&spki).map_err(|err| {
            warn!("engine returned an unparsable public key: {err}");
            km_err!(InvalidKeyBlob, "engine public key: {err}")
        })?;
        let private = LegacyRsaPrivate {
            engine: self.engine.clone(),
            key_material: key_material.clone(),
            additional_params: additional_params.try_clone()?,
        };
        Ok(Box::new(RsaKey::new(
            key_material,
            hw_enforced,
            sw_enforced,
            public,
            Arc::new(private),
        )))
    }

    fn operation_factory(&self, purpose: Purpose) -> Option<Arc<dyn OperationFactory>> {
        pick_rsa_factory(&self.operations, purpose)
    }

    fn supported_import_formats(&self) -> Vec<KeyFormat> {
        vec![KeyFormat::Pkcs8]
    }

    fn supported_export_formats(&self) -> Vec<KeyFormat> {
        vec![KeyFormat::X509]
    }

    fn key_size_supported(&self, key_size_bits: u32) -> bool {
        key_size_bits % 8 == 0
            && (self.limits.min_key_size..=self.limits.max_key_size).contains(&key_size_bits)
    }
}
