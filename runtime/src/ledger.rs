//! Quota Ledger: two-level (category + event) capacity checks.
//!
//! Remaining capacity is always `capacity - consumed`, where `consumed` is a live count
//! of issued tickets read under the allocation's locks. The ledger never decrements a
//! stored counter: committing ticket rows is itself the consumption.
//!
//! The checks form an ordered list of [`QuotaConstraint`]s evaluated inside one
//! transaction: every category first, then every event the request touches.

use boxoffice_core::store::{StoreTransaction, TicketStore};
use boxoffice_core::{
    AllocationError, Category, CategoryId, CategoryQuota, EventId, EventQuota, QuotaScope,
    StoreError,
};
use std::collections::BTreeMap;

/// Requested ticket counts grouped by category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Demand {
    per_category: BTreeMap<CategoryId, u32>,
    total: u32,
}

impl Demand {
    /// Groups a request (one entry per ticket) by category.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::EmptyRequest`] for an empty request and
    /// [`AllocationError::InvalidRequest`] if the count does not fit in `u32`.
    pub fn from_request(request: &[CategoryId]) -> Result<Self, AllocationError> {
        if request.is_empty() {
            return Err(AllocationError::EmptyRequest);
        }

        let total = u32::try_from(request.len()).map_err(|_| {
            AllocationError::InvalidRequest(format!("{} tickets requested", request.len()))
        })?;

        let mut per_category = BTreeMap::new();
        for id in request {
            *per_category.entry(*id).or_insert(0u32) += 1;
        }

        Ok(Self {
            per_category,
            total,
        })
    }

    /// Distinct categories, ascending (the lock order).
    #[must_use]
    pub fn category_ids(&self) -> Vec<CategoryId> {
        self.per_category.keys().copied().collect()
    }

    /// Tickets requested for one category.
    #[must_use]
    pub fn count_for(&self, id: CategoryId) -> u32 {
        self.per_category.get(&id).copied().unwrap_or(0)
    }

    /// Tickets requested in total.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    /// Tickets requested per event, given the categories' owning events.
    fn per_event<'a>(
        &self,
        categories: impl IntoIterator<Item = &'a Category>,
    ) -> BTreeMap<EventId, u32> {
        let mut per_event = BTreeMap::new();
        for category in categories {
            *per_event.entry(category.event_id).or_insert(0u32) += self.count_for(category.id);
        }
        per_event
    }
}

/// One capacity check in the layered quota.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuotaConstraint {
    /// Category-level check
    Category {
        /// Locked snapshot
        quota: CategoryQuota,
        /// Tickets requested from it
        requested: u32,
    },
    /// Event-level check
    Event {
        /// Locked snapshot
        quota: EventQuota,
        /// Tickets requested from it across all categories
        requested: u32,
    },
}

impl QuotaConstraint {
    /// The scope this constraint guards.
    #[must_use]
    pub const fn scope(&self) -> QuotaScope {
        match self {
            Self::Category { quota, .. } => QuotaScope::Category(quota.category.id),
            Self::Event { quota, .. } => QuotaScope::Event(quota.event.id),
        }
    }

    /// Tickets still available in this scope.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        match self {
            Self::Category { quota, .. } => quota.remaining(),
            Self::Event { quota, .. } => quota.remaining(),
        }
    }

    /// Tickets the request needs from this scope.
    #[must_use]
    pub const fn requested(&self) -> u32 {
        match self {
            Self::Category { requested, .. } | Self::Event { requested, .. } => *requested,
        }
    }

    /// Checks `remaining >= requested`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::QuotaExceeded`] naming this scope.
    pub const fn check(&self) -> Result<(), AllocationError> {
        if self.remaining() >= self.requested() {
            Ok(())
        } else {
            Err(AllocationError::QuotaExceeded {
                scope: self.scope(),
                requested: self.requested(),
                remaining: self.remaining(),
            })
        }
    }
}

/// Evaluates constraints in order and stops at the first violation.
///
/// # Errors
///
/// Returns the first [`AllocationError::QuotaExceeded`].
pub fn evaluate(constraints: &[QuotaConstraint]) -> Result<(), AllocationError> {
    constraints.iter().try_for_each(QuotaConstraint::check)
}

/// Categories locked and verified for one allocation.
#[derive(Clone, Debug)]
pub struct Reservation {
    categories: BTreeMap<CategoryId, Category>,
}

impl Reservation {
    /// The locked snapshot of a requested category.
    #[must_use]
    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.get(&id)
    }
}

/// Read and reserve access to category and event quotas.
pub struct QuotaLedger;

impl QuotaLedger {
    /// Remaining capacity of a category, read fresh from the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn category_remaining(
        store: &dyn TicketStore,
        id: CategoryId,
    ) -> Result<Option<u32>, StoreError> {
        store.category_remaining(id).await
    }

    /// Remaining capacity of an event, read fresh from the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn event_remaining(
        store: &dyn TicketStore,
        id: EventId,
    ) -> Result<Option<u32>, StoreError> {
        store.event_remaining(id).await
    }

    /// Locks every quota row the demand touches and verifies all constraints.
    ///
    /// Categories are locked (ascending) and checked first; then the events they belong
    /// to are locked (ascending) and checked against the combined demand. The locks stay
    /// held by `tx` until it commits or rolls back, so the verified headroom cannot be
    /// consumed by anyone else in between.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::UnknownCategory`] if a category vanished before locking
    /// - [`AllocationError::QuotaExceeded`] for the first exhausted scope
    /// - [`AllocationError::LockTimeout`] if a lock could not be acquired in time
    pub async fn reserve(
        tx: &mut dyn StoreTransaction,
        demand: &Demand,
    ) -> Result<Reservation, AllocationError> {
        let category_ids = demand.category_ids();
        let locked = tx.lock_categories(&category_ids).await?;

        let quotas: BTreeMap<CategoryId, CategoryQuota> = locked
            .into_iter()
            .map(|quota| (quota.category.id, quota))
            .collect();
        if let Some(missing) = category_ids.iter().find(|id| !quotas.contains_key(id)) {
            return Err(AllocationError::UnknownCategory(*missing));
        }

        let category_constraints: Vec<QuotaConstraint> = quotas
            .values()
            .map(|quota| QuotaConstraint::Category {
                requested: demand.count_for(quota.category.id),
                quota: quota.clone(),
            })
            .collect();
        evaluate(&category_constraints)?;

        let per_event = demand.per_event(quotas.values().map(|quota| &quota.category));
        let event_ids: Vec<EventId> = per_event.keys().copied().collect();
        let events = tx.lock_events(&event_ids).await?;
        if events.len() != event_ids.len() {
            return Err(AllocationError::Storage(
                "category references a missing event".to_string(),
            ));
        }

        let event_constraints: Vec<QuotaConstraint> = events
            .into_iter()
            .map(|quota| QuotaConstraint::Event {
                requested: per_event.get(&quota.event.id).copied().unwrap_or(0),
                quota,
            })
            .collect();
        evaluate(&event_constraints)?;

        tracing::debug!(
            categories = category_ids.len(),
            events = event_ids.len(),
            total = demand.total(),
            "Quota reserved"
        );

        Ok(Reservation {
            categories: quotas
                .into_iter()
                .map(|(id, quota)| (id, quota.category))
                .collect(),
        })
    }
}
