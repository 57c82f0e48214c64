//! RSA keys and operations. Digesting and padding always run here; the
//! private-key exponentiation goes through an [`RsaPrivateTransform`], which
//! is either a software key or a legacy hardware engine.

use std::{any::Any, fmt, sync::Arc};

use rand::rngs::OsRng;
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    hazmat::{rsa_decrypt_and_check, rsa_encrypt},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::{
    authorization::{AuthorizationSet, AuthorizationView, KeyParam},
    buffer::{Buffer, KeymasterKeyBlob},
    config::RsaLimits,
    digest::{DigestContext, SOFTWARE_DIGESTS},
    error::{KmError, KmResult},
    key::{
        Key, KeyCreation, KeyFactory, check_algorithm, reconcile_import_param,
        software_enforced_split,
    },
    km_err,
    operation::{KeyType, Operation, OperationBackend, OperationFactory},
    padding,
    random::RandomSource,
    types::{Algorithm, Digest, KeyFormat, KeyOrigin, PaddingMode, Purpose},
};

const SIGNING_PADDINGS: &[PaddingMode] = &[
    PaddingMode::None,
    PaddingMode::RsaPkcs1_1_5Sign,
    PaddingMode::RsaPss,
];
const CRYPTING_PADDINGS: &[PaddingMode] = &[
    PaddingMode::None,
    PaddingMode::RsaPkcs1_1_5Encrypt,
    PaddingMode::RsaOaep,
];

/// The private half of an RSA key.
pub trait RsaPrivateTransform: Send + Sync {
    /// Applies the private key to a modulus-sized `input`.
    ///
    /// `padding` is [`PaddingMode::None`] for the bare exponentiation,
    /// [`PaddingMode::RsaPkcs1_1_5Sign`] when `input` is the unpadded
    /// EMSA-PKCS1 payload the transform must pad itself, and
    /// [`PaddingMode::RsaPkcs1_1_5Encrypt`] when the PKCS#1 type 2 padding
    /// must be stripped from the result.
    fn private_operation(
        &self,
        purpose: Purpose,
        padding: PaddingMode,
        input: &[u8],
    ) -> KmResult<Vec<u8>>;

    /// PKCS#8 encoding of the private key, where it is extractable at all.
    fn private_pkcs8(&self) -> KmResult<Vec<u8>> {
        Err(km_err!(UnsupportedKeyFormat, "private key is not extractable"))
    }
}

fn modulus_len(public: &RsaPublicKey) -> usize {
    public.size()
}

fn modulus_bits(public: &RsaPublicKey) -> usize {
    public.n().bits()
}

fn public_exponent(public: &RsaPublicKey) -> Option<u64> {
    let bytes = public.e().to_bytes_be();
    if bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Big-endian `value`, left padded with zeros to `len` bytes.
fn left_pad(value: &[u8], len: usize) -> KmResult<Vec<u8>> {
    if value.len() > len {
        return Err(km_err!(
            InvalidInputLength,
            "{} bytes do not fit a {len}-byte modulus",
            value.len()
        ));
    }
    let mut out = vec![0u8; len - value.len()];
    out.extend_from_slice(value);
    Ok(out)
}

/// `input` as an integer, refused when not below the modulus.
fn to_representative(public: &RsaPublicKey, input: &[u8]) -> KmResult<BigUint> {
    let value = BigUint::from_bytes_be(input);
    if &value >= public.n() {
        return Err(km_err!(InvalidArgument, "input not smaller than the modulus"));
    }
    Ok(value)
}

fn public_raw(public: &RsaPublicKey, input: &[u8]) -> KmResult<Vec<u8>> {
    let value = to_representative(public, input)?;
    let result = rsa_encrypt(public, &value).map_err(KmError::crypto)?;
    left_pad(&result.to_bytes_be(), modulus_len(public))
}

/// Software RSA private key.
pub struct SoftwareRsaPrivate {
    key: RsaPrivateKey,
}

impl SoftwareRsaPrivate {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    fn raw(&self, input: &[u8]) -> KmResult<Zeroizing<Vec<u8>>> {
        let public = self.key.to_public_key();
        let value = to_representative(&public, input)?;
        let result =
            rsa_decrypt_and_check(&self.key, Some(&mut OsRng), &value).map_err(KmError::crypto)?;
        Ok(Zeroizing::new(left_pad(&result.to_bytes_be(), self.key.size())?))
    }
}

impl RsaPrivateTransform for SoftwareRsaPrivate {
    fn private_operation(
        &self,
        purpose: Purpose,
        padding: PaddingMode,
        input: &[u8],
    ) -> KmResult<Vec<u8>> {
        let k = self.key.size();
        match (purpose, padding) {
            (Purpose::Sign, PaddingMode::None) | (Purpose::Decrypt, PaddingMode::None) => {
                Ok(self.raw(input)?.to_vec())
            }
            (Purpose::Sign, PaddingMode::RsaPkcs1_1_5Sign) => {
                let em = padding::pkcs1_sign_pad(input, k)?;
                Ok(self.raw(&em)?.to_vec())
            }
            (Purpose::Decrypt, PaddingMode::RsaPkcs1_1_5Encrypt) => {
                let em = self.raw(input)?;
                padding::pkcs1_encrypt_unpad(&em)
            }
            (purpose, padding) => Err(km_err!(
                UnsupportedPaddingMode,
                "{padding:?} private operation for {purpose:?}"
            )),
        }
    }

    fn private_pkcs8(&self) -> KmResult<Vec<u8>> {
        let der = self.key.to_pkcs8_der().map_err(KmError::crypto)?;
        Ok(der.as_bytes().to_vec())
    }
}

/// An RSA key: the public half in software, the private half behind a
/// transform.
pub struct RsaKey {
    key_material: KeymasterKeyBlob,
    hw_enforced: AuthorizationSet,
    sw_enforced: AuthorizationSet,
    public: RsaPublicKey,
    private: Arc<dyn RsaPrivateTransform>,
}

impl RsaKey {
    pub fn new(
        key_material: KeymasterKeyBlob,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
        public: RsaPublicKey,
        private: Arc<dyn RsaPrivateTransform>,
    ) -> Self {
        Self {
            key_material,
            hw_enforced,
            sw_enforced,
            public,
            private,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

impl fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKey")
            .field("modulus_bits", &modulus_bits(&self.public))
            .field("hw_enforced", &self.hw_enforced)
            .field("sw_enforced", &self.sw_enforced)
            .finish_non_exhaustive()
    }
}

impl Key for RsaKey {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Rsa
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
            KeyFormat::X509 => {
                let der = self.public.to_public_key_der().map_err(KmError::crypto)?;
                Ok(der.as_bytes().to_vec())
            }
            KeyFormat::Pkcs8 => self.private.private_pkcs8(),
            KeyFormat::Raw => Err(km_err!(UnsupportedKeyFormat, "RSA keys have no raw form")),
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// One operation factory per RSA purpose, shared by every RSA backend.
pub(crate) fn rsa_operation_factories(
    random: &Arc<dyn RandomSource>,
) -> [Arc<RsaOperationFactory>; 4] {
    [Purpose::Sign, Purpose::Verify, Purpose::Encrypt, Purpose::Decrypt]
        .map(|purpose| Arc::new(RsaOperationFactory::new(purpose, random.clone())))
}

pub(crate) fn pick_rsa_factory(
    factories: &[Arc<RsaOperationFactory>; 4],
    purpose: Purpose,
) -> Option<Arc<dyn OperationFactory>> {
    factories
        .iter()
        .find(|f| f.purpose == purpose)
        .map(|f| f.clone() as Arc<dyn OperationFactory>)
}

pub struct RsaKeyFactory {
    limits: RsaLimits,
    operations: [Arc<RsaOperationFactory>; 4],
}

impl RsaKeyFactory {
    pub fn new(random: Arc<dyn RandomSource>, limits: RsaLimits) -> Self {
        Self {
            limits,
            operations: rsa_operation_factories(&random),
        }
    }

    fn parse_pkcs8(material: &[u8]) -> KmResult<RsaPrivateKey> {
        RsaPrivateKey::from_pkcs8_der(material)
            .map_err(|err| km_err!(InvalidKeyBlob, "RSA PKCS#8 parse failed: {err}"))
    }
}

/// Public exponents must be odd and at least 3.
fn validate_public_exponent(exponent: u64) -> KmResult<()> {
    if exponent < 3 || exponent % 2 == 0 {
        return Err(km_err!(InvalidArgument, "unusable public exponent {exponent}"));
    }
    Ok(())
}

impl KeyFactory for RsaKeyFactory {
    fn registry_key(&self) -> Algorithm {
        Algorithm::Rsa
    }

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation> {
        check_algorithm(description, Algorithm::Rsa)?;
        let key_size = description
            .key_size()
            .ok_or_else(|| km_err!(UnsupportedKeySize, "no key size specified"))?;
        if !self.key_size_supported(key_size) {
            error!("RSA key size {key_size} not supported");
            return Err(km_err!(UnsupportedKeySize, "RSA-{key_size}"));
        }
        let exponent = description
            .rsa_public_exponent()
            .ok_or_else(|| km_err!(InvalidArgument, "RSA generation needs a public exponent"))?;
        validate_public_exponent(exponent)?;
        let (hw_enforced, sw_enforced) = software_enforced_split(description, KeyOrigin::Generated)?;

        let key = RsaPrivateKey::new_with_exp(&mut OsRng, key_size as usize, &BigUint::from(exponent))
            .map_err(KmError::crypto)?;
        let der = key.to_pkcs8_der().map_err(KmError::crypto)?;
        info!("generated RSA-{key_size} key");
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
        check_algorithm(description, Algorithm::Rsa)?;
        if input_format != KeyFormat::Pkcs8 {
            return Err(km_err!(UnsupportedKeyFormat, "RSA import from {input_format:?}"));
        }
        let key = RsaPrivateKey::from_pkcs8_der(input_material)
            .map_err(|err| km_err!(InvalidArgument, "RSA PKCS#8 parse failed: {err}"))?;
        let public = key.to_public_key();
        let key_size = modulus_bits(&public) as u32;
        if !self.key_size_supported(key_size) {
            return Err(km_err!(UnsupportedKeySize, "imported RSA-{key_size}"));
        }
        let exponent = public_exponent(&public)
            .ok_or_else(|| km_err!(InvalidArgument, "public exponent wider than 64 bits"))?;
        let description = reconcile_import_param(description, KeyParam::KeySize(key_size))?;
        let description = reconcile_import_param(&description, KeyParam::RsaPublicExponent(exponent))?;
        let (hw_enforced, sw_enforced) = software_enforced_split(&description, KeyOrigin::Imported)?;
        info!("imported RSA-{key_size} key");
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
        let private = Self::parse_pkcs8(key_material.as_slice())?;
        let public = private.to_public_key();
        Ok(Box::new(RsaKey::new(
            key_material,
            hw_enforced,
            sw_enforced,
            public,
            Arc::new(SoftwareRsaPrivate::new(private)),
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

pub struct RsaOperationFactory {
    purpose: Purpose,
    random: Arc<dyn RandomSource>,
}

impl RsaOperationFactory {
    pub fn new(purpose: Purpose, random: Arc<dyn RandomSource>) -> Self {
        Self { purpose, random }
    }

    fn negotiate(&self, begin_params: &AuthorizationSet, key: &dyn Key) -> KmResult<(PaddingMode, Digest)> {
        let padding = self.get_and_validate_padding(begin_params, key)?;
        let digest = match self.purpose {
            Purpose::Sign | Purpose::Verify => {
                self.get_and_validate_digest(begin_params, key, false)?
            }
            _ if padding == PaddingMode::RsaOaep => {
                self.get_and_validate_digest(begin_params, key, true)?
            }
            _ => Digest::None,
        };
        if matches!(padding, PaddingMode::RsaPss | PaddingMode::RsaOaep) && digest == Digest::None {
            error!("{padding:?} requires a digest");
            return Err(km_err!(IncompatibleDigest, "{padding:?} with no digest"));
        }
        Ok((padding, digest))
    }
}

impl OperationFactory for RsaOperationFactory {
    fn registry_key(&self) -> KeyType {
        KeyType::new(Algorithm::Rsa, self.purpose)
    }

    fn create_operation(
        &self,
        key: Box<dyn Key>,
        begin_params: &AuthorizationSet,
    ) -> KmResult<Operation> {
        let (padding, digest) = self.negotiate(begin_params, key.as_ref())?;
        let key = key
            .into_any()
            .downcast::<RsaKey>()
            .map_err(|_| km_err!(IncompatibleAlgorithm, "RSA factory given a foreign key"))?;
        let RsaKey {
            hw_enforced,
            sw_enforced,
            public,
            private,
            ..
        } = *key;

        let k = modulus_len(&public);
        if padding == PaddingMode::RsaPss && k < 2 * digest.output_len() + 2 {
            error!("{}-byte key too small for PSS with {digest:?}", k);
            return Err(km_err!(IncompatibleDigest, "key too small for {digest:?}"));
        }
        let digest_ctx = match (self.purpose, digest) {
            (Purpose::Sign | Purpose::Verify, d) if d != Digest::None => Some(DigestContext::new(d)?),
            _ => None,
        };
        let backend = RsaOperation {
            purpose: self.purpose,
            padding,
            digest,
            public,
            private,
            random: self.random.clone(),
            digest_ctx,
            data: Zeroizing::new(Vec::new()),
        };
        Ok(Operation::new(
            self.purpose,
            hw_enforced,
            sw_enforced,
            self.random.clone(),
            Box::new(backend),
        ))
    }

    fn supported_padding_modes(&self) -> &[PaddingMode] {
        match self.purpose {
            Purpose::Sign | Purpose::Verify => SIGNING_PADDINGS,
            _ => CRYPTING_PADDINGS,
        }
    }

    fn supported_digests(&self) -> &[Digest] {
        SOFTWARE_DIGESTS
    }
}

struct RsaOperation {
    purpose: Purpose,
    padding: PaddingMode,
    digest: Digest,
    public: RsaPublicKey,
    private: Arc<dyn RsaPrivateTransform>,
    random: Arc<dyn RandomSource>,
    digest_ctx: Option<DigestContext>,
    data: Zeroizing<Vec<u8>>,
}

impl RsaOperation {
    fn k(&self) -> usize {
        modulus_len(&self.public)
    }

    /// The digest of everything signed so far, or the raw message when
    /// signing undigested.
    fn message_representative(&mut self) -> Vec<u8> {
        match self.digest_ctx.take() {
            Some(ctx) => ctx.finalize(),
            None => self.data.to_vec(),
        }
    }

    fn sign(&mut self, output: &mut Buffer) -> KmResult<()> {
        let k = self.k();
        let message = self.message_representative();
        let signature = match self.padding {
            PaddingMode::None => {
                let padded = left_pad(&message, k)?;
                self.private.private_operation(Purpose::Sign, PaddingMode::None, &padded)?
            }
            PaddingMode::RsaPkcs1_1_5Sign => {
                let t = match self.digest {
                    Digest::None => message,
                    digest => padding::digest_info(digest, &message)?,
                };
                self.private
                    .private_operation(Purpose::Sign, PaddingMode::RsaPkcs1_1_5Sign, &t)?
            }
            PaddingMode::RsaPss => {
                let em_bits = modulus_bits(&self.public) - 1;
                let em = padding::pss_encode(self.digest, &message, em_bits, self.random.as_ref())?;
                let padded = left_pad(&em, k)?;
                self.private.private_operation(Purpose::Sign, PaddingMode::None, &padded)?
            }
            other => return Err(km_err!(UnsupportedPaddingMode, "{other:?} signing")),
        };
        output.append(&signature)
    }

    fn verify(&mut self, signature: &[u8]) -> KmResult<()> {
        let k = self.k();
        if signature.len() != k {
            return Err(km_err!(
                VerificationFailed,
                "signature is {} bytes, expected {k}",
                signature.len()
            ));
        }
        let message = self.message_representative();
        let recovered = public_raw(&self.public, signature)
            .map_err(|_| km_err!(VerificationFailed, "signature out of range"))?;
        let valid = match self.padding {
            PaddingMode::None => left_pad(&message, k)? == recovered,
            PaddingMode::RsaPkcs1_1_5Sign => {
                let t = match self.digest {
                    Digest::None => message,
                    digest => padding::digest_info(digest, &message)?,
                };
                padding::pkcs1_sign_pad(&t, k)? == recovered
            }
            PaddingMode::RsaPss => {
                let em_bits = modulus_bits(&self.public) - 1;
                let em_len = em_bits.div_ceil(8);
                let (prefix, em) = recovered.split_at(k - em_len);
                prefix.iter().all(|b| *b == 0)
                    && padding::pss_verify(self.digest, &message, em, em_bits)?
            }
            other => return Err(km_err!(UnsupportedPaddingMode, "{other:?} verification")),
        };
        if !valid {
            debug!("RSA {:?} signature mismatch", self.padding);
            return Err(km_err!(VerificationFailed, "signature does not match"));
        }
        Ok(())
    }

    fn encrypt(&mut self, output: &mut Buffer) -> KmResult<()> {
        let k = self.k();
        let em = match self.padding {
            PaddingMode::None => left_pad(&self.data, k)?,
            PaddingMode::RsaPkcs1_1_5Encrypt => {
                padding::pkcs1_encrypt_pad(&self.data, k, self.random.as_ref())?
            }
            PaddingMode::RsaOaep => {
                padding::oaep_encode(self.digest, &self.data, k, self.random.as_ref())?
            }
            other => return Err(km_err!(UnsupportedPaddingMode, "{other:?} encryption")),
        };
        let ciphertext = public_raw(&self.public, &em)?;
        output.append(&ciphertext)
    }

    fn decrypt(&mut self, output: &mut Buffer) -> KmResult<()> {
        let k = self.k();
        if self.data.len() != k {
            return Err(km_err!(
                InvalidInputLength,
                "ciphertext is {} bytes, expected {k}",
                self.data.len()
            ));
        }
        let plaintext = Zeroizing::new(match self.padding {
            PaddingMode::None => {
                self.private
                    .private_operation(Purpose::Decrypt, PaddingMode::None, &self.data)?
            }
            PaddingMode::RsaPkcs1_1_5Encrypt => self.private.private_operation(
                Purpose::Decrypt,
                PaddingMode::RsaPkcs1_1_5Encrypt,
                &self.data,
            )?,
            PaddingMode::RsaOaep => {
                let em = Zeroizing::new(self.private.private_operation(
                    Purpose::Decrypt,
                    PaddingMode::None,
                    &self.data,
                )?);
                padding::oaep_decode(self.digest, &em)?
            }
            other => return Err(km_err!(UnsupportedPaddingMode, "{other:?} decryption")),
        });
        output.append(&plaintext)
    }
}

impl OperationBackend for RsaOperation {
    fn begin(
        &mut self,
        _input_params: &AuthorizationSet,
        _output_params: &mut AuthorizationSet,
    ) -> KmResult<()> {
        debug!(
            "RSA {:?} begun with {:?}/{:?}",
            self.purpose, self.padding, self.digest
        );
        Ok(())
    }

    fn update(
        &mut self,
        _input_params: &AuthorizationSet,
        input: &[u8],
        _output_params: &mut AuthorizationSet,
        _output: &mut Buffer,
    ) -> KmResult<usize> {
        if let Some(ctx) = self.digest_ctx.as_mut() {
            ctx.update(input);
            return Ok(input.len());
        }
        if self.data.len() + input.len() > self.k() {
            error!(
                "input of {} bytes exceeds the {}-byte modulus",
                self.data.len() + input.len(),
                self.k()
            );
            return Err(km_err!(
                InvalidInputLength,
                "undigested input longer than the modulus"
            ));
        }
        self.data.extend_from_slice(input);
        Ok(input.len())
    }

    fn finish(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        _output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        self.update_for_finish(input_params, input)?;
        match self.purpose {
            Purpose::Sign => self.sign(output),
            Purpose::Verify => self.verify(signature),
            Purpose::Encrypt => self.encrypt(output),
            Purpose::Decrypt => self.decrypt(output),
            other => Err(km_err!(UnsupportedPurpose, "RSA {other:?}")),
        }
    }

    fn abort(&mut self) -> KmResult<()> {
        self.data.clear();
        self.digest_ctx = None;
        Ok(())
    }
}
