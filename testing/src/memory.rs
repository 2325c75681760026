//! In-memory [`TicketStore`] with per-resource async locks.
//!
//! Mirrors the row-lock semantics of the Postgres store closely enough to exercise the
//! engines under real concurrency:
//!
//! - each category, event and ticket has its own `tokio::sync::Mutex`, acquired with a
//!   timeout and held by the transaction until commit, rollback or drop
//! - writes are staged in the transaction and applied atomically on commit
//! - counts read under a lock include the transaction's own staged tickets
//! - staged credentials are reserved store-wide, so a clash with a concurrent
//!   transaction surfaces at `insert_ticket` like a unique index would
//!
//! Lock ordering is the caller's responsibility, exactly as with the database.

use boxoffice_core::catalog::{NewCategory, NewEvent};
use boxoffice_core::store::{CatalogFuture, StoreFuture, StoreTransaction, TicketStore};
use boxoffice_core::{
    CatalogError, Category, CategoryId, CategoryQuota, Credential, DateTime, Event, EventId,
    EventQuota, LockedTicket, Order, OrderId, ScanAttempt, StoreError, Ticket, TicketId,
    TicketState, Utc, storable_text,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Default bound on lock waits, matching the service default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum LockKey {
    Category(CategoryId),
    Event(EventId),
    Ticket(TicketId),
}

#[derive(Default)]
struct Tables {
    events: BTreeMap<EventId, Event>,
    categories: BTreeMap<CategoryId, Category>,
    orders: HashMap<OrderId, Order>,
    tickets: Vec<Ticket>,
    ticket_index: HashMap<TicketId, usize>,
    credential_index: HashMap<Credential, usize>,
    scans: Vec<ScanAttempt>,
}

impl Tables {
    fn consumed_in_category(&self, id: CategoryId) -> usize {
        self.tickets.iter().filter(|t| t.category_id == id).count()
    }

    fn consumed_in_event(&self, id: EventId) -> usize {
        self.tickets.iter().filter(|t| t.event_id == id).count()
    }

    fn ticket(&self, id: TicketId) -> Option<&Ticket> {
        self.ticket_index.get(&id).and_then(|i| self.tickets.get(*i))
    }
}

struct Shared {
    tables: RwLock<Tables>,
    locks: std::sync::Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    reserved: std::sync::Mutex<HashSet<Credential>>,
    lock_timeout: Duration,
}

impl Shared {
    /// Claims `credential` for one staged ticket; `false` if another one holds it.
    fn reserve(&self, credential: &Credential) -> Result<bool, StoreError> {
        self.reserved
            .lock()
            .map(|mut reserved| reserved.insert(credential.clone()))
            .map_err(|_| StoreError::Database("credential reservations poisoned".to_string()))
    }

    /// Drops lock entries nobody holds or waits on.
    fn prune(&self, keys: impl IntoIterator<Item = LockKey>) {
        if let Ok(mut locks) = self.locks.lock() {
            for key in keys {
                if locks.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
                    locks.remove(&key);
                }
            }
        }
    }

    fn release<'a>(&self, credentials: impl IntoIterator<Item = &'a Credential>) {
        if let Ok(mut reserved) = self.reserved.lock() {
            for credential in credentials {
                reserved.remove(credential);
            }
        }
    }
}

/// Thread-safe in-memory store for tests and the demo binary.
///
/// Cloning shares the underlying data.
#[derive(Clone)]
pub struct InMemoryTicketStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryTicketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTicketStore {
    /// Creates an empty store with [`DEFAULT_LOCK_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates an empty store with the given lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                locks: std::sync::Mutex::new(HashMap::new()),
                reserved: std::sync::Mutex::new(HashSet::new()),
                lock_timeout,
            }),
        }
    }

    /// Number of committed tickets across all events.
    pub async fn ticket_count(&self) -> usize {
        self.shared.tables.read().await.tickets.len()
    }

    /// Number of committed orders.
    pub async fn order_count(&self) -> usize {
        self.shared.tables.read().await.orders.len()
    }

    /// Every committed scan attempt, oldest first.
    pub async fn all_scan_attempts(&self) -> Vec<ScanAttempt> {
        self.shared.tables.read().await.scans.clone()
    }

    /// Opens a concrete transaction (handy for holding locks in contention tests).
    pub fn transaction(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            guards: Vec::new(),
            held: HashSet::new(),
            orders: Vec::new(),
            tickets: Vec::new(),
            redemptions: Vec::new(),
            scans: Vec::new(),
        }
    }
}

impl std::fmt::Debug for InMemoryTicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTicketStore")
            .field("lock_timeout", &self.shared.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl TicketStore for InMemoryTicketStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move { Ok(Box::new(self.transaction()) as Box<dyn StoreTransaction>) })
    }

    fn create_event(&self, event: NewEvent) -> CatalogFuture<'_, Event> {
        Box::pin(async move {
            let event = event.into_event()?;
            self.shared
                .tables
                .write()
                .await
                .events
                .insert(event.id, event.clone());
            Ok(event)
        })
    }

    fn create_category(&self, category: NewCategory) -> CatalogFuture<'_, Category> {
        Box::pin(async move {
            let mut tables = self.shared.tables.write().await;
            let event = tables
                .events
                .get(&category.event_id)
                .ok_or(CatalogError::UnknownEvent(category.event_id))?;
            let category = category.into_category(event)?;

            if tables
                .categories
                .values()
                .any(|c| c.event_id == category.event_id && c.name == category.name)
            {
                return Err(CatalogError::DuplicateCategory {
                    event_id: category.event_id,
                    name: category.name,
                });
            }

            tables.categories.insert(category.id, category.clone());
            Ok(category)
        })
    }

    fn load_categories<'a>(&'a self, ids: &'a [CategoryId]) -> StoreFuture<'a, Vec<Category>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(ids
                .iter()
                .filter_map(|id| tables.categories.get(id).cloned())
                .collect())
        })
    }

    fn category_remaining(&self, id: CategoryId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(tables.categories.get(&id).map(|category| {
                remaining(category.capacity.value(), tables.consumed_in_category(id))
            }))
        })
    }

    fn event_remaining(&self, id: EventId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(tables
                .events
                .get(&id)
                .map(|event| remaining(event.capacity.value(), tables.consumed_in_event(id))))
        })
    }

    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move { Ok(self.shared.tables.read().await.ticket(id).cloned()) })
    }

    fn ticket_by_credential<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(tables
                .credential_index
                .get(credential)
                .and_then(|i| tables.tickets.get(*i))
                .cloned())
        })
    }

    fn tickets_in_category(&self, id: CategoryId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(tables
                .tickets
                .iter()
                .filter(|t| t.category_id == id)
                .cloned()
                .collect())
        })
    }

    fn order(&self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let tables = self.shared.tables.read().await;
            Ok(tables.orders.get(&id).map(|header| {
                let mut order = header.clone();
                order.tickets = tables
                    .tickets
                    .iter()
                    .filter(|t| t.order_id == id)
                    .cloned()
                    .collect();
                order
            }))
        })
    }

    fn scan_attempts<'a>(&'a self, presented: &'a str) -> StoreFuture<'a, Vec<ScanAttempt>> {
        Box::pin(async move {
            let presented = storable_text(presented);
            let tables = self.shared.tables.read().await;
            Ok(tables
                .scans
                .iter()
                .filter(|s| s.presented == presented)
                .cloned()
                .collect())
        })
    }
}

/// A transaction over [`InMemoryTicketStore`].
///
/// Locks are released when the transaction is committed, rolled back or dropped.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    guards: Vec<OwnedMutexGuard<()>>,
    held: HashSet<LockKey>,
    orders: Vec<Order>,
    tickets: Vec<Ticket>,
    redemptions: Vec<(TicketId, DateTime<Utc>)>,
    scans: Vec<ScanAttempt>,
}

impl InMemoryTransaction {
    async fn acquire(&mut self, key: LockKey) -> Result<(), StoreError> {
        if self.held.contains(&key) {
            return Ok(());
        }

        let mutex = {
            let mut locks = self
                .shared
                .locks
                .lock()
                .map_err(|_| StoreError::Database("lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(key).or_default())
        };

        let Ok(guard) = tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned()).await
        else {
            self.shared.prune([key]);
            return Err(StoreError::LockTimeout);
        };

        self.guards.push(guard);
        self.held.insert(key);
        Ok(())
    }

    fn staged_in_category(&self, id: CategoryId) -> usize {
        self.tickets.iter().filter(|t| t.category_id == id).count()
    }

    fn staged_in_event(&self, id: EventId) -> usize {
        self.tickets.iter().filter(|t| t.event_id == id).count()
    }

    fn apply_redemptions(&self, ticket: &mut Ticket) {
        if let Some((_, at)) = self.redemptions.iter().find(|(id, _)| *id == ticket.id) {
            ticket.state = TicketState::Redeemed;
            ticket.redeemed_at = Some(*at);
        }
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn lock_categories<'a>(
        &'a mut self,
        ids: &'a [CategoryId],
    ) -> StoreFuture<'a, Vec<CategoryQuota>> {
        Box::pin(async move {
            let mut quotas = Vec::with_capacity(ids.len());
            for id in ids {
                let exists = self.shared.tables.read().await.categories.contains_key(id);
                if !exists {
                    continue;
                }
                self.acquire(LockKey::Category(*id)).await?;

                let tables = self.shared.tables.read().await;
                if let Some(category) = tables.categories.get(id) {
                    let consumed = tables.consumed_in_category(*id) + self.staged_in_category(*id);
                    quotas.push(CategoryQuota {
                        category: category.clone(),
                        consumed: saturate(consumed),
                    });
                }
            }
            Ok(quotas)
        })
    }

    fn lock_events<'a>(&'a mut self, ids: &'a [EventId]) -> StoreFuture<'a, Vec<EventQuota>> {
        Box::pin(async move {
            let mut quotas = Vec::with_capacity(ids.len());
            for id in ids {
                let exists = self.shared.tables.read().await.events.contains_key(id);
                if !exists {
                    continue;
                }
                self.acquire(LockKey::Event(*id)).await?;

                let tables = self.shared.tables.read().await;
                if let Some(event) = tables.events.get(id) {
                    let consumed = tables.consumed_in_event(*id) + self.staged_in_event(*id);
                    quotas.push(EventQuota {
                        event: event.clone(),
                        consumed: saturate(consumed),
                    });
                }
            }
            Ok(quotas)
        })
    }

    fn insert_order<'a>(&'a mut self, order: &'a Order) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut header = order.clone();
            header.tickets.clear();
            self.orders.push(header);
            Ok(())
        })
    }

    fn insert_ticket<'a>(&'a mut self, ticket: &'a Ticket) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !self.orders.iter().any(|o| o.id == ticket.order_id) {
                return Err(StoreError::NotFound(format!("order {}", ticket.order_id)));
            }

            // Reserve before checking committed tickets: commit indexes a credential
            // before releasing its reservation, so one of the two checks sees it.
            if !self.shared.reserve(&ticket.credential)? {
                return Err(StoreError::CredentialCollision(ticket.credential.clone()));
            }
            let committed = self
                .shared
                .tables
                .read()
                .await
                .credential_index
                .contains_key(&ticket.credential);
            if committed {
                self.shared.release([&ticket.credential]);
                return Err(StoreError::CredentialCollision(ticket.credential.clone()));
            }

            self.tickets.push(ticket.clone());
            Ok(())
        })
    }

    fn lock_ticket_by_credential<'a>(
        &'a mut self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<LockedTicket>> {
        Box::pin(async move {
            let ticket_id = {
                let tables = self.shared.tables.read().await;
                tables
                    .credential_index
                    .get(credential)
                    .and_then(|i| tables.tickets.get(*i))
                    .map(|t| t.id)
            };
            let Some(ticket_id) = ticket_id else {
                return Ok(None);
            };

            self.acquire(LockKey::Ticket(ticket_id)).await?;

            let tables = self.shared.tables.read().await;
            let Some(mut ticket) = tables.ticket(ticket_id).cloned() else {
                return Ok(None);
            };
            self.apply_redemptions(&mut ticket);

            let event_title = tables
                .events
                .get(&ticket.event_id)
                .map(|e| e.title.clone())
                .unwrap_or_default();
            let category_name = tables
                .categories
                .get(&ticket.category_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();

            Ok(Some(LockedTicket {
                ticket,
                event_title,
                category_name,
            }))
        })
    }

    fn mark_redeemed(&mut self, id: TicketId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if !self.held.contains(&LockKey::Ticket(id)) {
                return Err(StoreError::Database(format!(
                    "ticket {id} must be locked before it is redeemed"
                )));
            }
            self.redemptions.push((id, at));
            Ok(())
        })
    }

    fn append_scan_attempt<'a>(&'a mut self, attempt: &'a ScanAttempt) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.scans.push(attempt.clone());
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let mut tx = *self;
            let tickets = std::mem::take(&mut tx.tickets);
            let shared = Arc::clone(&tx.shared);
            let mut tables = shared.tables.write().await;

            for order in tx.orders.drain(..) {
                tables.orders.insert(order.id, order);
            }

            for ticket in &tickets {
                let index = tables.tickets.len();
                tables.ticket_index.insert(ticket.id, index);
                tables.credential_index.insert(ticket.credential.clone(), index);
                tables.tickets.push(ticket.clone());
            }
            shared.release(tickets.iter().map(|t| &t.credential));

            for (id, at) in tx.redemptions.drain(..) {
                if let Some(index) = tables.ticket_index.get(&id).copied() {
                    if let Some(ticket) = tables.tickets.get_mut(index) {
                        ticket.state = TicketState::Redeemed;
                        ticket.redeemed_at = Some(at);
                    }
                }
            }

            tables.scans.append(&mut tx.scans);
            drop(tables);
            drop(tx);
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.shared.release(self.tickets.iter().map(|t| &t.credential));
        self.guards.clear();
        self.shared.prune(self.held.drain());
    }
}

fn remaining(capacity: u32, consumed: usize) -> u32 {
    capacity.saturating_sub(saturate(consumed))
}

fn saturate(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
