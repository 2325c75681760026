//! Catalog records and the validation applied before they reach a store.
//!
//! The catalog (events and their ticket categories) is owned by an external service.
//! Stores still need seeding, and the quota rules rely on a few invariants the catalog
//! enforces: positive capacities, a category never larger than its event, and unique
//! category names per event.

use crate::error::CatalogError;
use crate::types::{Capacity, Category, CategoryId, Event, EventId, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to create an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Display title
    pub title: String,
    /// Total tickets sellable across all categories
    pub capacity: Capacity,
    /// Start of the event
    pub starts_at: DateTime<Utc>,
    /// End of the event
    pub ends_at: DateTime<Utc>,
}

impl NewEvent {
    /// Validates the request and assigns an id.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Invalid`] for an empty title, a zero capacity, or an
    /// end time that is not after the start time.
    pub fn into_event(self) -> Result<Event, CatalogError> {
        if self.title.trim().is_empty() {
            return Err(CatalogError::Invalid {
                field: "title",
                reason: "must not be empty".to_string(),
            });
        }

        if self.capacity.value() == 0 {
            return Err(CatalogError::Invalid {
                field: "capacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.ends_at <= self.starts_at {
            return Err(CatalogError::Invalid {
                field: "ends_at",
                reason: "must be after starts_at".to_string(),
            });
        }

        Ok(Event {
            id: EventId::new(),
            title: self.title,
            capacity: self.capacity,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        })
    }
}

/// Request to create a ticket category under an existing event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCategory {
    /// Owning event
    pub event_id: EventId,
    /// Display name, unique within the event
    pub name: String,
    /// Price per ticket
    pub price: Money,
    /// Tickets sellable for this category
    pub capacity: Capacity,
}

impl NewCategory {
    /// Validates the request against its event and assigns an id.
    ///
    /// Name uniqueness is checked by the store, which sees the other categories.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownEvent`] if `event` is not the owning event, and
    /// [`CatalogError::Invalid`] for an empty name, a zero capacity, or a capacity above
    /// the event's.
    pub fn into_category(self, event: &Event) -> Result<Category, CatalogError> {
        if event.id != self.event_id {
            return Err(CatalogError::UnknownEvent(self.event_id));
        }

        if self.name.trim().is_empty() {
            return Err(CatalogError::Invalid {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }

        if self.capacity.value() == 0 {
            return Err(CatalogError::Invalid {
                field: "capacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.capacity > event.capacity {
            return Err(CatalogError::Invalid {
                field: "capacity",
                reason: format!(
                    "category capacity {} exceeds event capacity {}",
                    self.capacity, event.capacity
                ),
            });
        }

        Ok(Category {
            id: CategoryId::new(),
            event_id: self.event_id,
            name: self.name,
            price: self.price,
            capacity: self.capacity,
        })
    }
}
