use sea_orm::error::{DbErr, RuntimeErr};
use sea_orm::sqlx::{self, sqlite::SqliteError};
use sea_orm::SqlErr;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    /// Store failure that is not a connectivity problem.
    #[error("Database error: {0}")]
    DatabaseError(#[serde(skip)] DbErr),

    /// The store could not be reached or no connection could be acquired.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(
        "Insufficient inventory for variant {variant_id} at {location_code}: requested {requested}, available {available}"
    )]
    InsufficientInventory {
        variant_id: Uuid,
        location_code: String,
        requested: i32,
        available: i32,
    },

    #[error("Cart {0} has no items")]
    EmptyCart(Uuid),

    /// Promotion could not be applied. Never surfaced by checkout.
    #[error("Invalid promotion: {0}")]
    InvalidPromotion(String),

    #[error("Requested slot conflicts with an existing appointment: {0}")]
    ConflictingSlot(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        if let Some(SqlErr::UniqueConstraintViolation(msg)) = err.sql_err() {
            return ServiceError::Conflict(msg);
        }
        if is_lock_contention(&err) {
            return ServiceError::StoreUnavailable(format!("Store busy: {}", err));
        }
        match err {
            DbErr::Conn(e) => ServiceError::StoreUnavailable(e.to_string()),
            DbErr::ConnectionAcquire(e) => ServiceError::StoreUnavailable(e.to_string()),
            other => ServiceError::DatabaseError(other),
        }
    }
}

/// SQLite busy or locked, or a Postgres serialization failure or deadlock.
fn is_lock_contention(err: &DbErr) -> bool {
    let runtime = match err {
        DbErr::Exec(e) | DbErr::Query(e) => e,
        _ => return false,
    };
    let RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) = runtime else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };
    if db_err.try_downcast_ref::<SqliteError>().is_some() {
        // Extended result codes keep the primary code in the low byte
        return code
            .parse::<u32>()
            .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false);
    }
    matches!(&*code, "40001" | "40P01")
}

const SQLITE_BUSY: u32 = 5;
const SQLITE_LOCKED: u32 = 6;

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        ServiceError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::ConcurrentModification(_)
        )
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InsufficientInventory { .. } => "insufficient_inventory",
            Self::EmptyCart(_) => "empty_cart",
            Self::InvalidPromotion(_) => "invalid_promotion",
            Self::ConflictingSlot(_) => "conflicting_slot",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::Conflict(_) => "conflict",
            Self::EventError(_) => "event_error",
            Self::ConfigError(_) => "config_error",
            Self::InternalError(_) => "internal_error",
        }
    }
}

/// Errors surfaced by process-level plumbing (startup, migrations, shutdown).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::AppConfigError),

    #[error(transparent)]
    ServiceError(#[from] ServiceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
