use std::fmt;

use thiserror::Error;

pub type KmResult<T> = Result<T, KmError>;

/// Closed set of keymaster result codes. Numeric values match the wire
/// encoding used by callers, so they must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    RootOfTrustAlreadySet = -1,
    UnsupportedPurpose = -2,
    IncompatiblePurpose = -3,
    UnsupportedAlgorithm = -4,
    IncompatibleAlgorithm = -5,
    UnsupportedKeySize = -6,
    UnsupportedBlockMode = -7,
    IncompatibleBlockMode = -8,
    UnsupportedMacLength = -9,
    UnsupportedPaddingMode = -10,
    IncompatiblePaddingMode = -11,
    UnsupportedDigest = -12,
    IncompatibleDigest = -13,
    UnsupportedKeyFormat = -17,
    IncompatibleKeyFormat = -18,
    InvalidInputLength = -21,
    InvalidOperationHandle = -28,
    InsufficientBufferSpace = -29,
    VerificationFailed = -30,
    TooManyOperations = -31,
    UnexpectedNullPointer = -32,
    InvalidKeyBlob = -33,
    InvalidArgument = -38,
    UnsupportedTag = -39,
    InvalidTag = -40,
    MemoryAllocationFailed = -41,
    ImportParameterMismatch = -44,
    SecureHwAccessDenied = -45,
    OperationCancelled = -46,
    SecureHwBusy = -48,
    SecureHwCommunicationFailed = -49,
    MissingNonce = -51,
    InvalidNonce = -52,
    MissingMacLength = -53,
    CallerNonceProhibited = -55,
    InvalidMacLength = -57,
    MissingMinMacLength = -58,
    UnsupportedMinMacLength = -59,
    KeyRequiresUpgrade = -62,
    KeymasterNotConfigured = -64,
    InvalidOperation = -76,
    Unimplemented = -100,
    VersionMismatch = -101,
    UnknownError = -1000,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Error carried through every fallible core API: a result code plus a
/// human readable context string for logs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {context}")]
pub struct KmError {
    pub code: ErrorCode,
    pub context: String,
}

impl KmError {
    pub fn new<E: fmt::Display>(code: ErrorCode, context: E) -> Self {
        Self {
            code,
            context: context.to_string(),
        }
    }

    /// Failure reported by a crypto primitive that has no finer-grained code.
    pub fn crypto<E: fmt::Display>(err: E) -> Self {
        Self::new(ErrorCode::UnknownError, err)
    }

    pub fn invalid<E: fmt::Display>(err: E) -> Self {
        Self::new(ErrorCode::InvalidArgument, err)
    }

    pub fn allocation<E: fmt::Display>(err: E) -> Self {
        Self::new(ErrorCode::MemoryAllocationFailed, err)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_resource_error(&self) -> bool {
        matches!(self.code, ErrorCode::MemoryAllocationFailed)
    }

    pub fn is_verification_failure(&self) -> bool {
        matches!(self.code, ErrorCode::VerificationFailed)
    }

    /// Codes that describe a caller request the core refused to act on.
    pub fn is_validation_error(&self) -> bool {
        use ErrorCode::*;
        matches!(
            self.code,
            UnsupportedPurpose
                | IncompatiblePurpose
                | UnsupportedAlgorithm
                | IncompatibleAlgorithm
                | UnsupportedKeySize
                | UnsupportedBlockMode
                | IncompatibleBlockMode
                | UnsupportedMacLength
                | UnsupportedPaddingMode
                | IncompatiblePaddingMode
                | UnsupportedDigest
                | IncompatibleDigest
                | UnsupportedKeyFormat
                | IncompatibleKeyFormat
                | InvalidInputLength
                | InvalidArgument
                | UnsupportedTag
                | InvalidTag
                | ImportParameterMismatch
                | MissingNonce
                | InvalidNonce
                | MissingMacLength
                | CallerNonceProhibited
                | InvalidMacLength
                | MissingMinMacLength
                | UnsupportedMinMacLength
        )
    }
}

impl From<ErrorCode> for KmError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code,
            context: String::new(),
        }
    }
}

/// Build a [`KmError`] from a code name and a format string.
///
/// ```
/// use km_core::{km_err, ErrorCode};
/// let err = km_err!(UnsupportedKeySize, "{} bits", 100);
/// assert_eq!(err.code, ErrorCode::UnsupportedKeySize);
/// ```
#[macro_export]
macro_rules! km_err {
    ($code:ident, $($arg:tt)+) => {
        $crate::error::KmError::new($crate::error::ErrorCode::$code, format!($($arg)+))
    };
}
