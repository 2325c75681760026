//! Error taxonomy for allocation, redemption and storage.
//!
//! Business rejections (`QuotaExceeded`, `EmptyRequest`, `UnknownCategory`) and transient
//! contention (`LockTimeout`) are distinct variants so callers can decide whether to retry.
//! `Unknown` and `AlreadyRedeemed` scans are not errors at all: they are
//! [`RedeemOutcome`](crate::types::RedeemOutcome) values.

use crate::credential::Credential;
use crate::types::{CategoryId, EventId, QuotaScope};
use thiserror::Error;

/// Errors raised by a [`TicketStore`](crate::store::TicketStore) or its transactions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row lock could not be acquired within the configured timeout.
    #[error("Lock wait timed out")]
    LockTimeout,

    /// The credential is already held by another ticket.
    ///
    /// Reported by `insert_ticket` without poisoning the surrounding transaction.
    #[error("Credential already in use: {0}")]
    CredentialCollision(Credential),

    /// A row referenced by the operation does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether retrying the whole operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout)
    }
}

/// Errors returned by `allocate`. None of them leave partial state behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The request named no categories.
    #[error("Allocation request is empty")]
    EmptyRequest,

    /// The request references a category the catalog does not know.
    #[error("Unknown category: {0}")]
    UnknownCategory(CategoryId),

    /// The request is malformed in some other way (too many tickets, total overflow).
    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    /// A quota scope cannot absorb the request. The whole batch was rolled back.
    #[error("Quota exceeded for {scope}: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        /// Exhausted scope
        scope: QuotaScope,
        /// Tickets the request needed from this scope
        requested: u32,
        /// Tickets the scope still had
        remaining: u32,
    },

    /// Lock contention exceeded the timeout. Safe to retry.
    #[error("Lock wait timed out during allocation")]
    LockTimeout,

    /// Every credential drawn for one ticket collided with an existing one.
    #[error("Credential collision persisted after {attempts} attempts")]
    CredentialCollision {
        /// Number of credentials tried for the failing ticket
        attempts: u32,
    },

    /// Underlying storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AllocationError {
    /// Whether retrying the allocation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout)
    }

    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::EmptyRequest => "empty_request",
            Self::UnknownCategory(_) => "unknown_category",
            Self::InvalidRequest(_) => "invalid_request",
            Self::QuotaExceeded {
                scope: QuotaScope::Category(_),
                ..
            } => "quota_exceeded_category",
            Self::QuotaExceeded {
                scope: QuotaScope::Event(_),
                ..
            } => "quota_exceeded_event",
            Self::LockTimeout => "lock_timeout",
            Self::CredentialCollision { .. } => "credential_collision",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<StoreError> for AllocationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::LockTimeout => Self::LockTimeout,
            // The engine retries collisions per ticket; one that escapes it is a fault.
            StoreError::CredentialCollision(credential) => {
                Self::Storage(format!("credential collision outside issuance: {credential}"))
            }
            StoreError::NotFound(what) => Self::Storage(format!("missing row: {what}")),
            StoreError::Database(message) => Self::Storage(message),
        }
    }
}

/// Faults raised by `redeem`. Scan classifications are never errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedeemError {
    /// Lock contention exceeded the timeout. Safe to retry; nothing was recorded.
    #[error("Lock wait timed out during redemption")]
    LockTimeout,

    /// Underlying storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RedeemError {
    /// Whether retrying the redemption may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout)
    }
}

impl From<StoreError> for RedeemError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::LockTimeout => Self::LockTimeout,
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Errors from catalog seeding and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Field-level validation failed.
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The category references an event that does not exist.
    #[error("Unknown event: {0}")]
    UnknownEvent(EventId),

    /// The event already has a category with this name.
    #[error("Category '{name}' already exists for event {event_id}")]
    DuplicateCategory {
        /// Event
        event_id: EventId,
        /// Conflicting name
        name: String,
    },

    /// Underlying storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for CatalogError {
    fn from(error: StoreError) -> Self {
        Self::Storage(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lock_timeouts_are_retryable() {
        assert!(AllocationError::LockTimeout.is_retryable());
        assert!(RedeemError::LockTimeout.is_retryable());
        assert!(!AllocationError::EmptyRequest.is_retryable());
        assert!(
            !AllocationError::QuotaExceeded {
                scope: QuotaScope::Event(EventId::new()),
                requested: 3,
                remaining: 1,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_quota_message_names_scope() {
        let category_id = CategoryId::new();
        let error = AllocationError::QuotaExceeded {
            scope: QuotaScope::Category(category_id),
            requested: 2,
            remaining: 0,
        };
        assert!(error.to_string().contains(&format!("category {category_id}")));
        assert_eq!(error.label(), "quota_exceeded_category");
    }

    #[test]
    fn test_store_lock_timeout_maps_to_retryable_errors() {
        assert_eq!(AllocationError::from(StoreError::LockTimeout), AllocationError::LockTimeout);
        assert_eq!(RedeemError::from(StoreError::LockTimeout), RedeemError::LockTimeout);
    }
}
