//! Operation factories, capability negotiation and the Begin/Update/Finish/
//! Abort state machine shared by every algorithm backend.

use std::{fmt, sync::Arc};

use tracing::{debug, error, warn};

use crate::{
    authorization::{AuthProxy, AuthorizationSet, AuthorizationView, KeyParam, Tag},
    buffer::Buffer,
    error::{ErrorCode, KmError, KmResult},
    key::Key,
    km_err,
    random::RandomSource,
    types::{Algorithm, BlockMode, Digest, OperationHandle, PaddingMode, Purpose},
};

/// Prefix of the data a trusted confirmation token is computed over.
pub const CONFIRMATION_TOKEN_MESSAGE_TAG: &[u8] = b"confirmation token";

/// Default cap on message bytes retained for confirmation checks.
pub const DEFAULT_CONFIRMATION_MESSAGE_MAX_LEN: usize = 6144;

/// Registry key of an operation factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyType {
    pub algorithm: Algorithm,
    pub purpose: Purpose,
}

impl KeyType {
    pub fn new(algorithm: Algorithm, purpose: Purpose) -> Self {
        Self { algorithm, purpose }
    }
}

/// Stateless builder of operations for one [`KeyType`].
pub trait OperationFactory: Send + Sync {
    fn registry_key(&self) -> KeyType;

    /// Consumes `key`; its authorization sets move into the operation.
    fn create_operation(
        &self,
        key: Box<dyn Key>,
        begin_params: &AuthorizationSet,
    ) -> KmResult<Operation>;

    fn supported_padding_modes(&self) -> &[PaddingMode] {
        &[]
    }

    fn supported_block_modes(&self) -> &[BlockMode] {
        &[]
    }

    fn supported_digests(&self) -> &[Digest] {
        &[]
    }

    fn supports_padding(&self, padding: PaddingMode) -> bool {
        self.supported_padding_modes().contains(&padding)
    }

    fn supports_block_mode(&self, block_mode: BlockMode) -> bool {
        self.supported_block_modes().contains(&block_mode)
    }

    fn supports_digest(&self, digest: Digest) -> bool {
        self.supported_digests().contains(&digest)
    }

    fn is_public_key_operation(&self) -> bool {
        let key_type = self.registry_key();
        matches!(key_type.algorithm, Algorithm::Rsa | Algorithm::Ec) && key_type.purpose.is_public()
    }

    /// The single padding mode requested in `begin_params`, provided this
    /// factory implements it and the key authorizes it.
    fn get_and_validate_padding(
        &self,
        begin_params: &AuthorizationSet,
        key: &dyn Key,
    ) -> KmResult<PaddingMode> {
        let Some(padding) = begin_params.single_padding() else {
            error!(
                "{} padding modes specified in begin params",
                begin_params.tag_count(Tag::Padding)
            );
            return Err(km_err!(UnsupportedPaddingMode, "exactly one padding mode required"));
        };
        if !self.supports_padding(padding) {
            error!("padding mode {padding:?} not supported");
            return Err(km_err!(UnsupportedPaddingMode, "{padding:?} not supported"));
        }
        if !key
            .authorizations()
            .contains_param(&KeyParam::Padding(padding))
        {
            error!("attempt to use padding mode {padding:?} not authorized by key");
            return Err(km_err!(IncompatiblePaddingMode, "{padding:?} not authorized"));
        }
        Ok(padding)
    }

    /// The digest requested in `begin_params`. When none is given and
    /// `require_explicit_digest` is false, falls back to [`Digest::None`] if
    /// the key authorizes it.
    fn get_and_validate_digest(
        &self,
        begin_params: &AuthorizationSet,
        key: &dyn Key,
        require_explicit_digest: bool,
    ) -> KmResult<Digest> {
        let requested = begin_params.tag_count(Tag::Digest);
        let digest = match begin_params.single_digest() {
            Some(digest) => digest,
            None if requested == 0 && !require_explicit_digest => {
                if key
                    .authorizations()
                    .contains_param(&KeyParam::Digest(Digest::None))
                {
                    return Ok(Digest::None);
                }
                error!("no digest specified in begin params and NONE not authorized");
                return Err(km_err!(UnsupportedDigest, "no digest specified"));
            }
            None => {
                error!("{requested} digests specified in begin params");
                return Err(km_err!(UnsupportedDigest, "exactly one digest required"));
            }
        };
        if !self.supports_digest(digest) {
            error!("digest {digest:?} not supported");
            return Err(km_err!(UnsupportedDigest, "{digest:?} not supported"));
        }
        if !key.authorizations().contains_param(&KeyParam::Digest(digest)) {
            error!("digest {digest:?} was specified, but not authorized by key");
            return Err(km_err!(IncompatibleDigest, "{digest:?} not authorized"));
        }
        Ok(digest)
    }

    fn get_and_validate_block_mode(
        &self,
        begin_params: &AuthorizationSet,
        key: &dyn Key,
    ) -> KmResult<BlockMode> {
        let Some(block_mode) = begin_params.single_block_mode() else {
            error!(
                "{} block modes specified in begin params",
                begin_params.tag_count(Tag::BlockMode)
            );
            return Err(km_err!(UnsupportedBlockMode, "exactly one block mode required"));
        };
        if !self.supports_block_mode(block_mode) {
            error!("block mode {block_mode:?} not supported");
            return Err(km_err!(UnsupportedBlockMode, "{block_mode:?} not supported"));
        }
        if !key
            .authorizations()
            .contains_param(&KeyParam::BlockMode(block_mode))
        {
            error!("attempt to use block mode {block_mode:?} not authorized by key");
            return Err(km_err!(IncompatibleBlockMode, "{block_mode:?} not authorized"));
        }
        Ok(block_mode)
    }
}

/// Algorithm half of an operation. Implementations may assume calls arrive
/// in a legal order; [`Operation`] enforces it.
pub trait OperationBackend: Send {
    fn begin(
        &mut self,
        input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<()>;

    /// Returns how many bytes of `input` were consumed.
    fn update(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize>;

    fn finish(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()>;

    fn abort(&mut self) -> KmResult<()>;

    /// Feeds Finish's trailing input through Update for backends that only
    /// accumulate, expecting it all to be consumed without output.
    fn update_for_finish(&mut self, input_params: &AuthorizationSet, input: &[u8]) -> KmResult<()> {
        if input_params.is_empty() && input.is_empty() {
            return Ok(());
        }
        let mut output_params = AuthorizationSet::new();
        let mut output = Buffer::new();
        let consumed = self.update(input_params, input, &mut output_params, &mut output)?;
        if consumed != input.len() || !output.is_empty() || !output_params.is_empty() {
            return Err(km_err!(
                InvalidInputLength,
                "final update consumed {consumed} of {} bytes",
                input.len()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Created,
    Active,
    Finished,
    Aborted,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Finished | OperationState::Aborted | OperationState::Failed
        )
    }
}

/// One in-flight use of a key.
pub struct Operation {
    purpose: Purpose,
    hw_enforced: AuthorizationSet,
    sw_enforced: AuthorizationSet,
    handle: Option<OperationHandle>,
    key_id: Option<u64>,
    secure_deletion_slot: Option<u32>,
    confirmation_verifier_buffer: Option<Buffer>,
    confirmation_message_max_len: usize,
    state: OperationState,
    random: Arc<dyn RandomSource>,
    backend: Box<dyn OperationBackend>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("purpose", &self.purpose)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub fn new(
        purpose: Purpose,
        hw_enforced: AuthorizationSet,
        sw_enforced: AuthorizationSet,
        random: Arc<dyn RandomSource>,
        backend: Box<dyn OperationBackend>,
    ) -> Self {
        Self {
            purpose,
            hw_enforced,
            sw_enforced,
            handle: None,
            key_id: None,
            secure_deletion_slot: None,
            confirmation_verifier_buffer: None,
            confirmation_message_max_len: DEFAULT_CONFIRMATION_MESSAGE_MAX_LEN,
            state: OperationState::Created,
            random,
            backend,
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Assigned by a successful [`Operation::begin`].
    pub fn operation_handle(&self) -> Option<OperationHandle> {
        self.handle
    }

    pub fn authorizations(&self) -> AuthProxy<'_> {
        AuthProxy::new(&self.hw_enforced, &self.sw_enforced)
    }

    pub fn hw_enforced(&self) -> &AuthorizationSet {
        &self.hw_enforced
    }

    pub fn sw_enforced(&self) -> &AuthorizationSet {
        &self.sw_enforced
    }

    pub fn key_id(&self) -> Option<u64> {
        self.key_id
    }

    pub fn set_key_id(&mut self, key_id: u64) {
        self.key_id = Some(key_id);
    }

    pub fn secure_deletion_slot(&self) -> Option<u32> {
        self.secure_deletion_slot
    }

    pub fn set_secure_deletion_slot(&mut self, slot: u32) {
        self.secure_deletion_slot = Some(slot);
    }

    pub fn set_confirmation_message_max_len(&mut self, max_len: usize) {
        self.confirmation_message_max_len = max_len;
    }

    /// Creates the confirmation buffer on first call; later calls keep the
    /// existing one.
    pub fn create_confirmation_verifier_buffer(&mut self) -> KmResult<()> {
        if self.confirmation_verifier_buffer.is_some() {
            return Ok(());
        }
        let mut buffer = Buffer::new();
        buffer.append(CONFIRMATION_TOKEN_MESSAGE_TAG)?;
        self.confirmation_verifier_buffer = Some(buffer);
        Ok(())
    }

    pub fn confirmation_verifier_buffer(&self) -> Option<&Buffer> {
        self.confirmation_verifier_buffer.as_ref()
    }

    fn requires_confirmation(&self) -> bool {
        self.purpose == Purpose::Sign
            && self
                .authorizations()
                .contains(Tag::TrustedConfirmationRequired)
    }

    fn check_confirmation_room(&self, additional: usize) -> KmResult<()> {
        if let Some(buffer) = &self.confirmation_verifier_buffer {
            let used = buffer.len() - CONFIRMATION_TOKEN_MESSAGE_TAG.len();
            if used + additional > self.confirmation_message_max_len {
                warn!(
                    "confirmation message would exceed {} bytes",
                    self.confirmation_message_max_len
                );
                return Err(km_err!(
                    InvalidArgument,
                    "confirmation message longer than {} bytes",
                    self.confirmation_message_max_len
                ));
            }
        }
        Ok(())
    }

    fn record_confirmed_input(&mut self, input: &[u8]) -> KmResult<()> {
        match self.confirmation_verifier_buffer.as_mut() {
            Some(buffer) => buffer.append(input),
            None => Ok(()),
        }
    }

    fn misuse(&self, call: &str) -> KmError {
        let reason = match self.state {
            OperationState::Created => "operation not begun",
            OperationState::Active => "operation already begun",
            OperationState::Finished | OperationState::Failed => "operation already finished",
            OperationState::Aborted => "operation aborted",
        };
        warn!("{call} rejected: {reason}");
        km_err!(InvalidOperation, "{call}: {reason}")
    }

    fn allocate_handle(&self) -> KmResult<OperationHandle> {
        loop {
            let candidate = self.random.next_u64()?;
            if candidate != 0 {
                return Ok(OperationHandle(candidate));
            }
        }
    }

    pub fn begin(
        &mut self,
        input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<()> {
        if self.state != OperationState::Created {
            return Err(self.misuse("begin"));
        }
        let params_len = output_params.len();
        let result = self.begin_inner(input_params, output_params);
        match result {
            Ok(handle) => {
                debug!("{:?} operation {handle} begun", self.purpose);
                self.handle = Some(handle);
                self.state = OperationState::Active;
                Ok(())
            }
            Err(err) => {
                output_params.truncate(params_len);
                self.state = OperationState::Failed;
                Err(err)
            }
        }
    }

    fn begin_inner(
        &mut self,
        input_params: &AuthorizationSet,
        output_params: &mut AuthorizationSet,
    ) -> KmResult<OperationHandle> {
        input_params.check_valid()?;
        if self.requires_confirmation() {
            self.create_confirmation_verifier_buffer()?;
        }
        self.backend.begin(input_params, output_params)?;
        output_params.check_valid()?;
        self.allocate_handle()
    }

    pub fn update(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize> {
        if self.state != OperationState::Active {
            return Err(self.misuse("update"));
        }
        let params_len = output_params.len();
        let output_len = output.len();
        let result = self.update_inner(input_params, input, output_params, output);
        if let Err(err) = &result {
            output_params.truncate(params_len);
            output.truncate(output_len);
            self.state = OperationState::Failed;
            debug!("update failed: {err}");
        }
        result
    }

    fn update_inner(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<usize> {
        input_params.check_valid()?;
        self.check_confirmation_room(input.len())?;
        let consumed = self
            .backend
            .update(input_params, input, output_params, output)?;
        if consumed > input.len() {
            return Err(km_err!(
                UnknownError,
                "backend reported {consumed} of {} bytes consumed",
                input.len()
            ));
        }
        self.record_confirmed_input(&input[..consumed])?;
        Ok(consumed)
    }

    /// Completes the operation. A signature mismatch ends it as Finished
    /// but still reports `VerificationFailed`.
    pub fn finish(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        if self.state != OperationState::Active {
            return Err(self.misuse("finish"));
        }
        let params_len = output_params.len();
        let output_len = output.len();
        let result = self.finish_inner(input_params, input, signature, output_params, output);
        match &result {
            Ok(()) => {
                self.state = OperationState::Finished;
            }
            Err(err) if err.code == ErrorCode::VerificationFailed => {
                output_params.truncate(params_len);
                output.truncate(output_len);
                self.state = OperationState::Finished;
            }
            Err(err) => {
                output_params.truncate(params_len);
                output.truncate(output_len);
                self.state = OperationState::Failed;
                debug!("finish failed: {err}");
            }
        }
        result
    }

    fn finish_inner(
        &mut self,
        input_params: &AuthorizationSet,
        input: &[u8],
        signature: &[u8],
        output_params: &mut AuthorizationSet,
        output: &mut Buffer,
    ) -> KmResult<()> {
        input_params.check_valid()?;
        self.check_confirmation_room(input.len())?;
        self.record_confirmed_input(input)?;
        self.backend
            .finish(input_params, input, signature, output_params, output)
    }

    /// Idempotent; a second abort returns `Ok` without touching the backend
    /// again. Aborting a failed operation still releases the backend.
    pub fn abort(&mut self) -> KmResult<()> {
        match self.state {
            OperationState::Aborted => Ok(()),
            OperationState::Finished => Err(self.misuse("abort")),
            OperationState::Failed => {
                self.state = OperationState::Aborted;
                self.confirmation_verifier_buffer = None;
                if let Err(err) = self.backend.abort() {
                    warn!("releasing failed operation: {err}");
                }
                Ok(())
            }
            OperationState::Created | OperationState::Active => {
                self.state = OperationState::Aborted;
                self.confirmation_verifier_buffer = None;
                self.backend.abort()
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if matches!(self.state, OperationState::Active | OperationState::Failed)
            && let Err(err) = self.backend.abort()
        {
            warn!("abandoned operation failed to abort: {err}");
        }
    }
}
