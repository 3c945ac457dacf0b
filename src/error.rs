use rust_decimal::Decimal;
use thiserror::Error;

/// Caller-facing errors for the validated entry points (wallet allocation,
/// withdrawal creation, webhook crediting). Chain/transport failures stay
/// inside the owning task as `eyre` reports and never cross this boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid amount")]
    InvalidAmount,

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid address for the selected network")]
    InvalidAddress,

    #[error("net amount below minimum: minimum is {minimum_net} after the {fee} fee")]
    BelowMinimum { minimum_net: Decimal, fee: Decimal },

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    #[error("a withdrawal is already in flight for this user")]
    WithdrawalPending,

    #[error("could not allocate a deposit address (index contention)")]
    AddressAllocationExhausted,

    #[error("could not assign a unique invite code")]
    InviteCodeExhausted,

    #[error("invalid invite code")]
    InvalidInviteCode,

    #[error("users cannot refer themselves")]
    SelfReferral,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown plan: {0}")]
    UnknownPlan(i64),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Decimal(#[from] rust_decimal::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Error::Internal(e.to_string())
    }
}

impl Error {
    /// Validation errors are the caller's fault; everything else is ours.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Error::Store(_) | Error::Decimal(_) | Error::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
