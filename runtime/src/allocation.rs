//! Allocation Engine: all-or-nothing ticket issuance under nested quotas.
//!
//! # Flow
//!
//! ```text
//! allocate(owner, [A, A, B])
//!   1. group request            -> EmptyRequest / InvalidRequest   (no locks)
//!   2. catalog existence check  -> UnknownCategory                 (no locks)
//!   3. BEGIN
//!   4. lock categories asc, check each   -> QuotaExceeded(category)
//!   5. lock events asc, check each       -> QuotaExceeded(event)
//!   6. insert order, insert one ticket per unit (fresh credential each)
//!   7. COMMIT                            -> tickets now count as consumed
//! ```
//!
//! Any failure after step 3 rolls the transaction back, so no caller ever observes a
//! partially issued order.

use crate::ledger::{Demand, QuotaLedger};
use crate::metrics::{AllocationMetrics, LockMetrics};
use boxoffice_core::environment::Clock;
use boxoffice_core::store::{StoreTransaction, TicketStore};
use boxoffice_core::{
    AllocationError, AuditSink, Category, CategoryId, CredentialGenerator, DateTime, Money, Order,
    OrderId, OrderStatus, OwnerId, StoreError, Ticket, TicketId, TicketState, Utc,
};
use std::sync::Arc;
use std::time::Instant;

/// Limits applied by the [`AllocationEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationConfig {
    /// Largest number of tickets one request may ask for
    pub max_tickets_per_order: u32,
    /// Credentials drawn per ticket before a collision fails the batch
    pub credential_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_tickets_per_order: 50,
            credential_attempts: 3,
        }
    }
}

/// Issues orders of tickets against category and event quotas.
#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<dyn TicketStore>,
    credentials: Arc<dyn CredentialGenerator>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: AllocationConfig,
}

impl AllocationEngine {
    /// Creates a new `AllocationEngine`
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        credentials: Arc<dyn CredentialGenerator>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: AllocationConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            clock,
            audit,
            config,
        }
    }

    /// Allocates one ticket per entry of `request` to `owner`, or none at all.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::EmptyRequest`] / [`AllocationError::InvalidRequest`] /
    ///   [`AllocationError::UnknownCategory`]: rejected before any lock is taken
    /// - [`AllocationError::QuotaExceeded`]: a category or event has too little room
    /// - [`AllocationError::LockTimeout`]: contention; safe to retry
    /// - [`AllocationError::CredentialCollision`]: credential retries exhausted
    /// - [`AllocationError::Storage`]: database failure
    pub async fn allocate(
        &self,
        owner: OwnerId,
        request: &[CategoryId],
    ) -> Result<Order, AllocationError> {
        let started = Instant::now();
        let result = self.try_allocate(owner, request).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(order) => {
                tracing::info!(
                    order_id = %order.id,
                    owner = %owner,
                    tickets = order.tickets.len(),
                    total = %order.total,
                    elapsed_ms = elapsed.as_millis(),
                    "Order allocated"
                );
                AllocationMetrics::record("allocated", elapsed, order.tickets.len());
                self.audit.order_allocated(order);
            }
            Err(error) => {
                if error.is_retryable() {
                    tracing::warn!(owner = %owner, error = %error, "Allocation hit lock timeout");
                    LockMetrics::record_timeout("allocate");
                } else {
                    tracing::info!(owner = %owner, error = %error, "Allocation rejected");
                }
                AllocationMetrics::record(error.label(), elapsed, 0);
            }
        }

        result
    }

    /// Runs the locked part of an allocation inside a caller-supplied transaction.
    ///
    /// The caller owns the transaction and decides whether to commit. Nothing is
    /// visible to other requests until it does.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate), except that catalog existence is checked
    /// under the locks rather than before them.
    pub async fn allocate_in(
        &self,
        tx: &mut dyn StoreTransaction,
        owner: OwnerId,
        request: &[CategoryId],
    ) -> Result<Order, AllocationError> {
        let demand = self.validate(request)?;
        self.issue(tx, owner, request, &demand).await
    }

    async fn try_allocate(
        &self,
        owner: OwnerId,
        request: &[CategoryId],
    ) -> Result<Order, AllocationError> {
        let demand = self.validate(request)?;

        let category_ids = demand.category_ids();
        let known = self.store.load_categories(&category_ids).await?;
        if let Some(missing) = category_ids
            .iter()
            .find(|id| !known.iter().any(|category| category.id == **id))
        {
            return Err(AllocationError::UnknownCategory(*missing));
        }

        let mut tx = self.store.begin().await?;
        match self.issue(tx.as_mut(), owner, request, &demand).await {
            Ok(order) => {
                tx.commit().await?;
                Ok(order)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(
                        error = %rollback_error,
                        "Rollback after failed allocation failed"
                    );
                }
                Err(error)
            }
        }
    }

    fn validate(&self, request: &[CategoryId]) -> Result<Demand, AllocationError> {
        let demand = Demand::from_request(request)?;
        if demand.total() > self.config.max_tickets_per_order {
            return Err(AllocationError::InvalidRequest(format!(
                "requested {} tickets, at most {} allowed per order",
                demand.total(),
                self.config.max_tickets_per_order
            )));
        }
        Ok(demand)
    }

    async fn issue(
        &self,
        tx: &mut dyn StoreTransaction,
        owner: OwnerId,
        request: &[CategoryId],
        demand: &Demand,
    ) -> Result<Order, AllocationError> {
        let reservation = QuotaLedger::reserve(tx, demand).await?;

        let categories = request
            .iter()
            .map(|id| {
                reservation
                    .category(*id)
                    .ok_or(AllocationError::UnknownCategory(*id))
            })
            .collect::<Result<Vec<&Category>, _>>()?;

        // Prices come from the snapshot read under lock.
        let total = Money::checked_sum(categories.iter().map(|category| category.price))
            .ok_or_else(|| AllocationError::InvalidRequest("order total overflows".to_string()))?;

        let now = self.clock.now();
        let mut order = Order {
            id: OrderId::new(),
            owner,
            status: OrderStatus::Allocated,
            total,
            created_at: now,
            tickets: Vec::with_capacity(categories.len()),
        };
        tx.insert_order(&order).await?;

        for category in categories {
            let ticket = self.issue_ticket(tx, order.id, category, now).await?;
            order.tickets.push(ticket);
        }

        Ok(order)
    }

    async fn issue_ticket(
        &self,
        tx: &mut dyn StoreTransaction,
        order_id: OrderId,
        category: &Category,
        now: DateTime<Utc>,
    ) -> Result<Ticket, AllocationError> {
        let ticket_id = TicketId::new();

        for attempt in 1..=self.config.credential_attempts {
            let ticket = Ticket {
                id: ticket_id,
                order_id,
                category_id: category.id,
                event_id: category.event_id,
                price: category.price,
                state: TicketState::Valid,
                credential: self.credentials.generate(ticket_id, order_id),
                created_at: now,
                redeemed_at: None,
            };

            match tx.insert_ticket(&ticket).await {
                Ok(()) => return Ok(ticket),
                Err(StoreError::CredentialCollision(_)) => {
                    tracing::warn!(
                        ticket_id = %ticket_id,
                        attempt,
                        "Credential collision, drawing a fresh credential"
                    );
                    AllocationMetrics::record_collision();
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(AllocationError::CredentialCollision {
            attempts: self.config.credential_attempts,
        })
    }
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

