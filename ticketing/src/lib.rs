//! Ticketing - quota-safe ticket sales and one-shot gate redemption
//!
//! Application crate on top of the Boxoffice engines. It showcases:
//!
//! - **Allocation**: all-or-nothing orders under category and event quotas
//! - **Redemption**: exactly one `Accepted` per ticket, every scan audited
//! - **Rendering**: QR payloads produced after commit, outside any lock
//! - **Configuration**: environment-driven choice of in-memory or `PostgreSQL` store
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────┐
//!            │   TicketingService   │  retry on LockTimeout
//!            └──────────────────────┘
//!               │               │
//!               ▼               ▼
//!   ┌──────────────────┐ ┌───────────────────┐
//!   │ AllocationEngine │ │ RedemptionMachine │
//!   └──────────────────┘ └───────────────────┘
//!               │               │
//!               └───────┬───────┘
//!                       ▼
//!          TicketStore (memory | postgres)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let service = TicketingService::from_config(&Config::from_env()).await?;
//! let order = service.allocate(owner, &[standard, standard]).await?;
//! let credential = order.tickets[0].credential.as_str();
//! let outcome = service.redeem(credential, ScanContext::default()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod render;
pub mod service;

pub use config::{Config, ConfigError, StoreKind};
pub use render::{QrPayloadRenderer, RenderError, RenderedTicket, TicketRenderer};
pub use service::{AppError, TicketingService, TicketingServiceBuilder};
