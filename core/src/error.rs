use crate::{
    request::{Action, RequestStatus},
    types::{AccountId, MinorUnits, RequestId},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: MinorUnits, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request '{request_id}' not found")]
    NotFound { request_id: RequestId },

    #[error("Actor '{actor_id}' may not {action} request '{request_id}'")]
    Forbidden {
        request_id: RequestId,
        actor_id:   AccountId,
        action:     Action,
    },

    #[error("Fan '{fan_id}' is blocked by DJ '{dj_id}'")]
    Blocked { dj_id: AccountId, fan_id: AccountId },

    #[error("Cannot {action} request '{request_id}' in status {status}")]
    InvalidTransition {
        request_id: RequestId,
        status:     RequestStatus,
        action:     Action,
    },

    #[error("Ledger write attempted outside an active unit of work")]
    LedgerWriteConflict,

    #[error("Insufficient funds on '{account_id}': available {available}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        available:  MinorUnits,
        requested:  MinorUnits,
    },

    #[error("Payment declined for '{account_id}': {reason}")]
    PaymentDeclined { account_id: AccountId, reason: String },

    #[error("Request '{request_id}' was modified concurrently (expected version {expected})")]
    StaleVersion { request_id: RequestId, expected: i64 },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code used by the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. }     => "invalid_amount",
            Self::InvalidInput(_)          => "invalid_input",
            Self::NotFound { .. }          => "not_found",
            Self::Forbidden { .. }
            | Self::Blocked { .. }         => "forbidden",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::PaymentDeclined { .. }   => "payment_declined",
            _                              => "internal",
        }
    }

    /// True for errors caused by the caller's input rather than the engine.
    pub fn is_user_facing(&self) -> bool {
        self.code() != "internal"
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
