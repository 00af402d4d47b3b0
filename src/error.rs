//! Error types for the sync engine.
//!
//! `SyncError` covers background work (database, admin API, credentials).
//! `CartError` covers cart command preconditions; optimistic failures never
//! surface through it, they roll back or open an interactive dialog instead.

use thiserror::Error;

use crate::api::ApiError;
use crate::cart::model::{ItemId, OrderStatus};

/// Errors raised by persistence, sync and configuration code paths.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed sync response for {dataset}: {reason}")]
    MalformedResponse { dataset: String, reason: String },

    #[error("terminal not paired")]
    NotPaired,
}

impl SyncError {
    /// Transient failures are retried on the next tick and never surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Api(e) => e.is_transient(),
            SyncError::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}

/// Precondition failures for cart commands.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CartError {
    #[error("cannot {action} while order is {status:?}")]
    InvalidTransition {
        action: &'static str,
        status: OrderStatus,
    },

    #[error("offline orders cannot be held")]
    HoldUnavailableOffline,

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("adjustment not found: {0}")]
    AdjustmentNotFound(String),

    #[error("discount not found: {0}")]
    DiscountNotFound(String),

    #[error("cart is empty")]
    EmptyCart,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("no stock override is pending")]
    NoStockOverride,

    #[error("no approval request is pending")]
    NoApprovalRequest,

    #[error("failed to persist offline order: {0}")]
    Persistence(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
