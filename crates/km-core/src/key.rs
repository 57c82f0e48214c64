use std::{any::Any, fmt, sync::Arc};

use tracing::warn;

use crate::{
    authorization::{AuthProxy, AuthorizationSet, AuthorizationView, KeyParam, Tag},
    buffer::KeymasterKeyBlob,
    error::KmResult,
    km_err,
    operation::OperationFactory,
    types::{Algorithm, KeyFormat, KeyOrigin, Purpose},
};

/// Output of key generation or import: the material plus the split of the
/// key's characteristics into what hardware enforces and what software does.
#[derive(Debug)]
pub struct KeyCreation {
    pub key_material: KeymasterKeyBlob,
    pub hw_enforced: AuthorizationSet,
    pub sw_enforced: AuthorizationSet,
}

/// A loaded key. Immutable once built; consumed when an operation is created.
pub trait Key: Send + Sync + fmt::Debug + 'static {
    fn algorithm(&self) -> Algorithm;
    fn key_material(&self) -> &KeymasterKeyBlob;
    fn hw_enforced(&self) -> &AuthorizationSet;
    fn sw_enforced(&self) -> &AuthorizationSet;

    fn authorizations(&self) -> AuthProxy<'_> {
        AuthProxy::new(self.hw_enforced(), self.sw_enforced())
    }

    /// Key material re-encoded in an interchange format.
    fn formatted_key_material(&self, format: KeyFormat) -> KmResult<Vec<u8>>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Algorithm-specific creator and loader of keys.
pub trait KeyFactory: Send + Sync {
    fn registry_key(&self) -> Algorithm;

    fn generate_key(&self, description: &AuthorizationSet) -> KmResult<KeyCreation>;

    fn import_key(
        &self,
        description: &AuthorizationSet,
        input_format: KeyFormat,
        input_material: &[u8],
    ) -> KmResult<KeyCreation>;

    /// Rebuilds a key from stored material. The two sets are taken as given.
    fn load_key(
        &self,
        key_material: KeymasterKeyBlob,
        additional_params: &AuthorizationSet,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
    ) -> KmResult<Box<dyn Key>>;

    fn operation_factory(&self, purpose: Purpose) -> Option<Arc<dyn OperationFactory>>;

    fn supported_import_formats(&self) -> Vec<KeyFormat>;

    fn supported_export_formats(&self) -> Vec<KeyFormat>;

    fn key_size_supported(&self, _key_size_bits: u32) -> bool {
        false
    }
}

/// Tags that only the key service itself may attach.
const SERVICE_ONLY_TAGS: &[Tag] = &[Tag::Origin, Tag::RootOfTrust];

/// Tags bound to the blob but never stored among its characteristics.
const HIDDEN_TAGS: &[Tag] = &[Tag::ApplicationId, Tag::ApplicationData];

/// Per-operation tags that have no meaning in a key description.
const OPERATION_TAGS: &[Tag] = &[
    Tag::Nonce,
    Tag::MacLength,
    Tag::AssociatedData,
    Tag::ConfirmationToken,
];

/// Characteristics of a key whose every restriction is enforced in software:
/// the description, minus hidden and per-operation tags, plus its origin.
pub(crate) fn software_enforced_split(
    description: &AuthorizationSet,
    origin: KeyOrigin,
) -> KmResult<(AuthorizationSet, AuthorizationSet)> {
    description.check_valid()?;
    description.ensure_absent(SERVICE_ONLY_TAGS)?;

    let mut sw_enforced = AuthorizationSet::new();
    for param in description.iter() {
        let tag = param.tag();
        if HIDDEN_TAGS.contains(&tag) || OPERATION_TAGS.contains(&tag) {
            continue;
        }
        sw_enforced.push(param.clone());
    }
    sw_enforced.push(KeyParam::Origin(origin));
    sw_enforced.check_valid()?;
    Ok((AuthorizationSet::new(), sw_enforced))
}

/// Checks an import description against a property derived from the
/// material, adding it when the caller left it out.
pub(crate) fn reconcile_import_param(
    description: &AuthorizationSet,
    derived: KeyParam,
) -> KmResult<AuthorizationSet> {
    let mut updated = description.try_clone()?;
    let tag = derived.tag();
    match description.find(tag) {
        None => updated.push(derived),
        Some(existing) if *existing == derived => {}
        Some(existing) => {
            warn!("import description has {existing:?} but the material implies {derived:?}");
            return Err(km_err!(
                ImportParameterMismatch,
                "{existing:?} does not match imported material"
            ));
        }
    }
    updated.check_valid()?;
    Ok(updated)
}

/// Fails unless the description's algorithm tag, if any, names `expected`.
pub(crate) fn check_algorithm(description: &AuthorizationSet, expected: Algorithm) -> KmResult<()> {
    match description.algorithm() {
        Some(found) if found != expected => Err(km_err!(
            IncompatibleAlgorithm,
            "{found:?} description given to {expected:?} factory"
        )),
        _ => Ok(()),
    }
}
