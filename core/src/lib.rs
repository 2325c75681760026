//! # Boxoffice Core
//!
//! Domain types and seams for quota-safe ticket allocation and one-shot redemption.
//!
//! This crate provides:
//!
//! - **Types**: events, categories, quota snapshots, tickets, orders, scan attempts
//! - **Credentials**: unguessable fixed-length redemption tokens
//! - **Errors**: the allocation / redemption / storage taxonomy
//! - **Store seam**: [`store::TicketStore`] and [`store::StoreTransaction`], the only
//!   path through which quota consumption and ticket state change
//! - **Environment**: injected dependencies such as [`environment::Clock`]
//!
//! The engine that drives these seams lives in `boxoffice-runtime`.
//!
//! ## Architecture Principles
//!
//! - Correctness comes from locks keyed by resource identity, not from a single writer
//! - Consumed counts are derived from ticket rows, never stored as counters
//! - Dependencies are passed in explicitly; there is no ambient connection or user

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod catalog;
pub mod credential;
pub mod error;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub use audit::{AuditSink, FanoutAuditSink, NullAuditSink};
pub use credential::{Credential, CredentialGenerator, Sha256CredentialGenerator};
pub use error::{AllocationError, CatalogError, RedeemError, StoreError};
pub use store::{StoreTransaction, TicketStore};
pub use types::*;

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the engine's constructor.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use boxoffice_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
