//! `PostgreSQL` ticket store for Boxoffice.
//!
//! This crate provides a production `TicketStore` implementation from
//! `boxoffice-core`. It uses sqlx with runtime-checked queries and supports:
//!
//! - Row-lock serialization of allocations (`SELECT ... FOR UPDATE`)
//! - Bounded lock waits via `SET LOCAL lock_timeout`
//! - Credential uniqueness enforced by a unique index
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use boxoffice_postgres::PostgresTicketStore;
//! use sqlx::postgres::PgPoolOptions;
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPoolOptions::new()
//!         .max_connections(10)
//!         .connect("postgres://localhost/boxoffice")
//!         .await?;
//!     let store = PostgresTicketStore::new(pool, Duration::from_millis(2000));
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod rows;
mod store;

pub use store::{PostgresTicketStore, PostgresTransaction};
