#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("UserError: {0}")]
    UserError(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("role chain cannot be empty")]
    EmptyChain,

    #[error("role chain exceeds maximum steps ({len} > {max})")]
    ChainTooLong { len: usize, max: usize },

    #[error("step {step}: invalid role ARN format: {arn}")]
    InvalidArn { step: usize, arn: String },

    #[error("step {step}: circular dependency detected for role {arn}")]
    CircularDependency { step: usize, arn: String },

    #[error("step {step}: external ID too short")]
    ExternalIdTooShort { step: usize },

    #[error("external ID must not be empty")]
    ExternalIdEmpty,

    #[error("invalid MFA token: {0}")]
    MfaTokenMalformed(String),

    #[error("MFA device validation failed: {0}")]
    MfaDeviceInvalid(String),

    #[error(transparent)]
    RemoteError(#[from] crate::provider::Error),

    #[error("failed to assume role {role_arn}: {source}")]
    AssumeRoleFailed {
        role_arn: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed at step {step} (role: {role_arn}): {source}")]
    ChainStepFailed {
        step: usize,
        role_arn: String,
        #[source]
        source: Box<Error>,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("EncryptionError: {0}")]
    Encryption(String),

    #[error("DecryptionError: {0}")]
    Decryption(String),

    #[error("credentials not found for {0}")]
    CredentialsNotFound(String),

    #[error("credentials expired for {0}")]
    CredentialsExpired(String),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    NixError(#[from] nix::Error),

    /// Failure, but we don't want to emit error to stderr/out anymore. Used in cmd
    #[error("")]
    FailureButSilentlyExit,

    /// Failure, but we don't want to emit error to stderr/out anymore. Used in cmd
    #[error("")]
    SilentlyExitWithCode(std::process::ExitCode),
}

impl Error {
    /// Cancellation and deadline errors travel un-wrapped up to the caller.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RemoteError(e) => e.is_transient(),
            Error::IoError(_) | Error::JsonError(_) => true,
            Error::AssumeRoleFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Walks `AssumeRoleFailed`/`ChainStepFailed` wrappers down to the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::AssumeRoleFailed { source, .. } | Error::ChainStepFailed { source, .. } => {
                source.root()
            }
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
