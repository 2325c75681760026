//! # Boxoffice Runtime
//!
//! Engines that drive the [`boxoffice_core`] store seam.
//!
//! ## Core Components
//!
//! - **[`AllocationEngine`]**: all-or-nothing issuance under category and event quotas
//! - **[`RedemptionMachine`]**: one-shot `Valid -> Redeemed` with an audited scan log
//! - **[`ledger`]**: quota arithmetic and the locked reservation step
//! - **[`retry`]**: bounded backoff for lock timeouts
//! - **[`metrics`]**: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_runtime::{AllocationConfig, AllocationEngine};
//!
//! let config = AllocationConfig::default();
//! let engine = AllocationEngine::new(store, credentials, clock, audit, config);
//! let order = engine.allocate(owner, &[standard, standard, vip]).await?;
//! ```

pub mod allocation;
pub mod audit;
pub mod ledger;
pub mod metrics;
pub mod redemption;
pub mod retry;

pub use allocation::{AllocationConfig, AllocationEngine};
pub use audit::TracingAuditSink;
pub use ledger::{Demand, QuotaConstraint, QuotaLedger, Reservation};
pub use redemption::RedemptionMachine;
pub use retry::{RetryPolicy, retry_with_predicate};
