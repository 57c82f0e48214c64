use serde::{Deserialize, Serialize};

use crate::{
    error::{KmError, KmResult},
    km_err,
    types::{Algorithm, BlockMode, Digest, KeyOrigin, PaddingMode, Purpose},
};

/// Identifier of a key parameter, independent of its value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Tag {
    Purpose,
    Algorithm,
    KeySize,
    BlockMode,
    Digest,
    Padding,
    CallerNonce,
    MinMacLength,
    RsaPublicExponent,
    Nonce,
    MacLength,
    AssociatedData,
    Origin,
    ApplicationId,
    ApplicationData,
    RootOfTrust,
    NoAuthRequired,
    TrustedConfirmationRequired,
    ConfirmationToken,
    CreationDatetime,
    OsVersion,
    OsPatchlevel,
}

impl Tag {
    /// Tags that may legitimately appear more than once in a set.
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            Tag::Purpose | Tag::BlockMode | Tag::Digest | Tag::Padding | Tag::AssociatedData
        )
    }
}

/// A tag together with its typed value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(tag = "tag", content = "value")]
pub enum KeyParam {
    Purpose(Purpose),
    Algorithm(Algorithm),
    KeySize(u32),
    BlockMode(BlockMode),
    Digest(Digest),
    Padding(PaddingMode),
    CallerNonce,
    MinMacLength(u32),
    RsaPublicExponent(u64),
    Nonce(Vec<u8>),
    MacLength(u32),
    AssociatedData(Vec<u8>),
    Origin(KeyOrigin),
    ApplicationId(Vec<u8>),
    ApplicationData(Vec<u8>),
    RootOfTrust(Vec<u8>),
    NoAuthRequired,
    TrustedConfirmationRequired,
    ConfirmationToken(Vec<u8>),
    CreationDatetime(u64),
    OsVersion(u32),
    OsPatchlevel(u32),
}

impl KeyParam {
    pub fn tag(&self) -> Tag {
        match self {
            KeyParam::Purpose(_) => Tag::Purpose,
            KeyParam::Algorithm(_) => Tag::Algorithm,
            KeyParam::KeySize(_) => Tag::KeySize,
            KeyParam::BlockMode(_) => Tag::BlockMode,
            KeyParam::Digest(_) => Tag::Digest,
            KeyParam::Padding(_) => Tag::Padding,
            KeyParam::CallerNonce => Tag::CallerNonce,
            KeyParam::MinMacLength(_) => Tag::MinMacLength,
            KeyParam::RsaPublicExponent(_) => Tag::RsaPublicExponent,
            KeyParam::Nonce(_) => Tag::Nonce,
            KeyParam::MacLength(_) => Tag::MacLength,
            KeyParam::AssociatedData(_) => Tag::AssociatedData,
            KeyParam::Origin(_) => Tag::Origin,
            KeyParam::ApplicationId(_) => Tag::ApplicationId,
            KeyParam::ApplicationData(_) => Tag::ApplicationData,
            KeyParam::RootOfTrust(_) => Tag::RootOfTrust,
            KeyParam::NoAuthRequired => Tag::NoAuthRequired,
            KeyParam::TrustedConfirmationRequired => Tag::TrustedConfirmationRequired,
            KeyParam::ConfirmationToken(_) => Tag::ConfirmationToken,
            KeyParam::CreationDatetime(_) => Tag::CreationDatetime,
            KeyParam::OsVersion(_) => Tag::OsVersion,
            KeyParam::OsPatchlevel(_) => Tag::OsPatchlevel,
        }
    }
}

/// Read access shared by [`AuthorizationSet`] and [`AuthProxy`].
pub trait AuthorizationView {
    fn params(&self) -> impl Iterator<Item = &KeyParam>;

    fn contains(&self, tag: Tag) -> bool {
        self.params().any(|p| p.tag() == tag)
    }

    fn contains_param(&self, param: &KeyParam) -> bool {
        self.params().any(|p| p == param)
    }

    fn tag_count(&self, tag: Tag) -> usize {
        self.params().filter(|p| p.tag() == tag).count()
    }

    fn find(&self, tag: Tag) -> Option<&KeyParam> {
        self.params().find(|p| p.tag() == tag)
    }

    fn algorithm(&self) -> Option<Algorithm> {
        self.params().find_map(|p| match p {
            KeyParam::Algorithm(a) => Some(*a),
            _ => None,
        })
    }

    fn key_size(&self) -> Option<u32> {
        self.params().find_map(|p| match p {
            KeyParam::KeySize(v) => Some(*v),
            _ => None,
        })
    }

    fn min_mac_length(&self) -> Option<u32> {
        self.params().find_map(|p| match p {
            KeyParam::MinMacLength(v) => Some(*v),
            _ => None,
        })
    }

    fn mac_length(&self) -> Option<u32> {
        self.params().find_map(|p| match p {
            KeyParam::MacLength(v) => Some(*v),
            _ => None,
        })
    }

    fn rsa_public_exponent(&self) -> Option<u64> {
        self.params().find_map(|p| match p {
            KeyParam::RsaPublicExponent(v) => Some(*v),
            _ => None,
        })
    }

    fn origin(&self) -> Option<KeyOrigin> {
        self.params().find_map(|p| match p {
            KeyParam::Origin(o) => Some(*o),
            _ => None,
        })
    }

    fn nonce(&self) -> Option<&[u8]> {
        self.params().find_map(|p| match p {
            KeyParam::Nonce(n) => Some(n.as_slice()),
            _ => None,
        })
    }

    fn application_id(&self) -> Option<&[u8]> {
        self.params().find_map(|p| match p {
            KeyParam::ApplicationId(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    fn application_data(&self) -> Option<&[u8]> {
        self.params().find_map(|p| match p {
            KeyParam::ApplicationData(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    fn purposes(&self) -> impl Iterator<Item = Purpose> {
        self.params().filter_map(|p| match p {
            KeyParam::Purpose(v) => Some(*v),
            _ => None,
        })
    }

    fn digests(&self) -> impl Iterator<Item = Digest> {
        self.params().filter_map(|p| match p {
            KeyParam::Digest(v) => Some(*v),
            _ => None,
        })
    }

    fn paddings(&self) -> impl Iterator<Item = PaddingMode> {
        self.params().filter_map(|p| match p {
            KeyParam::Padding(v) => Some(*v),
            _ => None,
        })
    }

    fn block_modes(&self) -> impl Iterator<Item = BlockMode> {
        self.params().filter_map(|p| match p {
            KeyParam::BlockMode(v) => Some(*v),
            _ => None,
        })
    }

    /// The digest when exactly one is present.
    fn single_digest(&self) -> Option<Digest> {
        exactly_one(self.digests())
    }

    /// The padding mode when exactly one is present.
    fn single_padding(&self) -> Option<PaddingMode> {
        exactly_one(self.paddings())
    }

    /// The block mode when exactly one is present.
    fn single_block_mode(&self) -> Option<BlockMode> {
        exactly_one(self.block_modes())
    }
}

fn exactly_one<T>(mut values: impl Iterator<Item = T>) -> Option<T> {
    let first = values.next()?;
    match values.next() {
        Some(_) => None,
        None => Some(first),
    }
}

/// Whether a set is usable or has been poisoned by a failed allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetValidity {
    #[default]
    Valid,
    AllocationFailure,
}

/// Ordered multiset of key parameters.
///
/// Growth never aborts: when memory cannot be reserved the set flips into the
/// [`SetValidity::AllocationFailure`] state and stays there, and consumers
/// surface that through [`AuthorizationSet::check_valid`].
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationSet {
    #[serde(default)]
    params: Vec<KeyParam>,
    #[serde(skip)]
    validity: SetValidity,
}

impl AuthorizationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set already in the allocation-failure state.
    pub fn allocation_failure() -> Self {
        Self {
            params: Vec::new(),
            validity: SetValidity::AllocationFailure,
        }
    }

    /// Builder-style push.
    pub fn with(mut self, param: KeyParam) -> Self {
        self.push(param);
        self
    }

    pub fn validity(&self) -> SetValidity {
        self.validity
    }

    pub fn is_valid(&self) -> bool {
        self.validity == SetValidity::Valid
    }

    pub fn check_valid(&self) -> KmResult<()> {
        match self.validity {
            SetValidity::Valid => Ok(()),
            SetValidity::AllocationFailure => {
                Err(KmError::allocation("authorization set allocation failed"))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyParam> {
        self.params.iter()
    }

    pub fn push(&mut self, param: KeyParam) {
        if !self.is_valid() {
            return;
        }
        if self.params.try_reserve(1).is_err() {
            self.validity = SetValidity::AllocationFailure;
            return;
        }
        self.params.push(param);
    }

    /// Appends every entry of `other`, duplicates included.
    pub fn union(&mut self, other: &AuthorizationSet) {
        if !other.is_valid() {
            self.validity = SetValidity::AllocationFailure;
        }
        if !self.is_valid() {
            return;
        }
        if self.params.try_reserve(other.params.len()).is_err() {
            self.validity = SetValidity::AllocationFailure;
            return;
        }
        self.params.extend(other.params.iter().cloned());
    }

    /// Entries of `self` that also appear in `other`, in `self`'s order.
    pub fn intersection(&self, other: &AuthorizationSet) -> AuthorizationSet {
        let mut result = AuthorizationSet::new();
        if !self.is_valid() || !other.is_valid() {
            result.validity = SetValidity::AllocationFailure;
            return result;
        }
        for param in self.params.iter().filter(|p| other.contains_param(p)) {
            result.push(param.clone());
        }
        result
    }

    /// Removes every entry with `tag`, returning how many were dropped.
    pub fn erase_tag(&mut self, tag: Tag) -> usize {
        let before = self.params.len();
        self.params.retain(|p| p.tag() != tag);
        before - self.params.len()
    }

    /// Removes every entry equal to `param`.
    pub fn remove_param(&mut self, param: &KeyParam) -> bool {
        let before = self.params.len();
        self.params.retain(|p| p != param);
        before != self.params.len()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.params.truncate(len);
    }

    /// Deep copy that reports allocation failure instead of aborting.
    pub fn try_clone(&self) -> KmResult<Self> {
        self.check_valid()?;
        let mut params = Vec::new();
        params
            .try_reserve_exact(self.params.len())
            .map_err(|_| KmError::allocation("authorization set copy"))?;
        params.extend(self.params.iter().cloned());
        Ok(Self {
            params,
            validity: SetValidity::Valid,
        })
    }

    /// Fails with `InvalidTag` if any of `tags` is present.
    pub fn ensure_absent(&self, tags: &[Tag]) -> KmResult<()> {
        match self.params.iter().find(|p| tags.contains(&p.tag())) {
            Some(param) => Err(km_err!(
                InvalidTag,
                "tag {:?} may not be supplied by the caller",
                param.tag()
            )),
            None => Ok(()),
        }
    }
}

impl AuthorizationView for AuthorizationSet {
    fn params(&self) -> impl Iterator<Item = &KeyParam> {
        self.params.iter()
    }
}

impl From<Vec<KeyParam>> for AuthorizationSet {
    fn from(params: Vec<KeyParam>) -> Self {
        Self {
            params,
            validity: SetValidity::Valid,
        }
    }
}

impl FromIterator<KeyParam> for AuthorizationSet {
    fn from_iter<I: IntoIterator<Item = KeyParam>>(iter: I) -> Self {
        let mut set = AuthorizationSet::new();
        for param in iter {
            set.push(param);
        }
        set
    }
}

/// Read-only union of a key's hardware- and software-enforced sets.
#[derive(Clone, Copy, Debug)]
pub struct AuthProxy<'a> {
    hw_enforced: &'a AuthorizationSet,
    sw_enforced: &'a AuthorizationSet,
}

impl<'a> AuthProxy<'a> {
    pub fn new(hw_enforced: &'a AuthorizationSet, sw_enforced: &'a AuthorizationSet) -> Self {
        Self {
            hw_enforced,
            sw_enforced,
        }
    }

    pub fn hw_enforced(&self) -> &'a AuthorizationSet {
        self.hw_enforced
    }

    pub fn sw_enforced(&self) -> &'a AuthorizationSet {
        self.sw_enforced
    }

    pub fn len(&self) -> usize {
        self.hw_enforced.len() + self.sw_enforced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthorizationView for AuthProxy<'_> {
    fn params(&self) -> impl Iterator<Item = &KeyParam> {
        self.hw_enforced.iter().chain(self.sw_enforced.iter())
    }
}
