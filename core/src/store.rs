//! Storage seam for tickets, orders, quotas and the scan audit log.
//!
//! # Design
//!
//! All mutation goes through a [`StoreTransaction`]. The allocation engine and the
//! redemption state machine open one per request, take exclusive locks keyed by resource
//! identity, read fresh derived counts under those locks, write, and commit. Nothing
//! outside a transaction can change quota consumption or ticket state.
//!
//! # Lock order
//!
//! Allocations lock every category key ascending, then every event key ascending.
//! Callers must pass sorted, de-duplicated id slices; with one global order two requests
//! over overlapping resources cannot deadlock.
//!
//! # Implementations
//!
//! - `PostgresTicketStore` (in `boxoffice-postgres`): `SELECT ... FOR UPDATE` row locks
//!   under a `lock_timeout`
//! - `InMemoryTicketStore` (in `boxoffice-testing`): async mutex per resource key
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the engine can
//! hold `Arc<dyn TicketStore>` and `Box<dyn StoreTransaction>`.

use crate::catalog::{NewCategory, NewEvent};
use crate::credential::Credential;
use crate::error::{CatalogError, StoreError};
use crate::types::{
    Category, CategoryId, CategoryQuota, Event, EventId, EventQuota, LockedTicket, Order, OrderId,
    ScanAttempt, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Boxed future returned by catalog operations.
pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CatalogError>> + Send + 'a>>;

/// Persistent store for the allocation and redemption core.
///
/// Read accessors always reflect committed data at call time; implementations must not
/// cache derived counts across calls.
pub trait TicketStore: Send + Sync {
    /// Opens a transaction. Lock waits inside it are bounded by the store's lock timeout.
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>>;

    /// Persists a validated event.
    fn create_event(&self, event: NewEvent) -> CatalogFuture<'_, Event>;

    /// Persists a category after validating it against its event and sibling names.
    fn create_category(&self, category: NewCategory) -> CatalogFuture<'_, Category>;

    /// Catalog lookup without locks. Ids that do not exist are absent from the result.
    fn load_categories<'a>(&'a self, ids: &'a [CategoryId]) -> StoreFuture<'a, Vec<Category>>;

    /// Remaining capacity of a category, or `None` if it does not exist.
    fn category_remaining(&self, id: CategoryId) -> StoreFuture<'_, Option<u32>>;

    /// Remaining capacity of an event, or `None` if it does not exist.
    fn event_remaining(&self, id: EventId) -> StoreFuture<'_, Option<u32>>;

    /// Looks up a ticket by id.
    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// Looks up a ticket by its redemption credential.
    fn ticket_by_credential<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<Ticket>>;

    /// All tickets issued in a category.
    fn tickets_in_category(&self, id: CategoryId) -> StoreFuture<'_, Vec<Ticket>>;

    /// Loads an order with its tickets.
    fn order(&self, id: OrderId) -> StoreFuture<'_, Option<Order>>;

    /// Scan attempts recorded for a presented credential, oldest first.
    ///
    /// `presented` is matched after [`storable_text`](crate::types::storable_text), the
    /// same normalization applied when the attempt was recorded.
    fn scan_attempts<'a>(&'a self, presented: &'a str) -> StoreFuture<'a, Vec<ScanAttempt>>;
}

/// A unit of work holding exclusive locks until commit or rollback.
///
/// Dropping a transaction without committing discards its writes and releases its locks.
pub trait StoreTransaction: Send {
    /// Locks the given categories and returns them with fresh consumed counts.
    ///
    /// `ids` must be sorted ascending and de-duplicated. Missing categories are absent
    /// from the result.
    fn lock_categories<'a>(
        &'a mut self,
        ids: &'a [CategoryId],
    ) -> StoreFuture<'a, Vec<CategoryQuota>>;

    /// Locks the given events and returns them with fresh consumed counts.
    ///
    /// `ids` must be sorted ascending and de-duplicated.
    fn lock_events<'a>(&'a mut self, ids: &'a [EventId]) -> StoreFuture<'a, Vec<EventQuota>>;

    /// Inserts an order header. Its tickets are inserted separately.
    fn insert_order<'a>(&'a mut self, order: &'a Order) -> StoreFuture<'a, ()>;

    /// Inserts a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CredentialCollision`] if the credential is already taken; the
    /// transaction stays usable so the caller can retry with a fresh credential.
    fn insert_ticket<'a>(&'a mut self, ticket: &'a Ticket) -> StoreFuture<'a, ()>;

    /// Finds a ticket by credential and locks it, with gate display data.
    fn lock_ticket_by_credential<'a>(
        &'a mut self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<LockedTicket>>;

    /// Moves a locked ticket to `Redeemed` with the given timestamp.
    fn mark_redeemed(&mut self, id: TicketId, at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Appends a scan attempt to the audit log.
    fn append_scan_attempt<'a>(&'a mut self, attempt: &'a ScanAttempt) -> StoreFuture<'a, ()>;

    /// Commits all writes and releases locks.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discards all writes and releases locks.
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}
