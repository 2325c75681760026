//! Domain types for quota-safe ticket allocation and redemption.
//!
//! Identifiers are UUID newtypes. Quantities use [`Capacity`] and prices use [`Money`]
//! (minor currency units), so no floating point ever reaches a total.

use crate::credential::Credential;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a scheduled event (the event-level quota scope)
    EventId
);
define_id!(
    /// Unique identifier for a ticket category (the category-level quota scope)
    CategoryId
);
define_id!(
    /// Unique identifier for an order
    OrderId
);
define_id!(
    /// Unique identifier for a ticket
    TicketId
);
define_id!(
    /// Identifier of the acting user (buyer or scanner operator)
    OwnerId
);
define_id!(
    /// Unique identifier for a recorded scan attempt
    ScanAttemptId
);

// ============================================================================
// Value Objects
// ============================================================================

/// Monetary amount in minor units (cents).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Sums an iterator of amounts, returning `None` on overflow.
    #[must_use]
    pub fn checked_sum<I>(amounts: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Number of tickets a quota scope may issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capacity(pub u32);

impl Capacity {
    /// Creates a new `Capacity`
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the capacity value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Catalog records
// ============================================================================

/// A scheduled event as known to the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID
    pub id: EventId,
    /// Display title
    pub title: String,
    /// Total tickets sellable across all categories
    pub capacity: Capacity,
    /// Start of the event
    pub starts_at: DateTime<Utc>,
    /// End of the event
    pub ends_at: DateTime<Utc>,
}

/// A ticket category (Standard, VIP, ...) belonging to one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category ID
    pub id: CategoryId,
    /// Owning event
    pub event_id: EventId,
    /// Display name, unique within the event
    pub name: String,
    /// Current price; copied onto each ticket at allocation time
    pub price: Money,
    /// Tickets sellable for this category
    pub capacity: Capacity,
}

// ============================================================================
// Quota snapshots
// ============================================================================

/// Category capacity together with the live count of tickets issued for it.
///
/// `consumed` is always derived from ticket rows at read time, never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryQuota {
    /// The category
    pub category: Category,
    /// Tickets currently issued in this category
    pub consumed: u32,
}

impl CategoryQuota {
    /// Remaining capacity (`capacity - consumed`, saturating at zero)
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.category.capacity.value().saturating_sub(self.consumed)
    }
}

/// Event capacity together with the live count of tickets issued across its categories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventQuota {
    /// The event
    pub event: Event,
    /// Tickets currently issued in any category of this event
    pub consumed: u32,
}

impl EventQuota {
    /// Remaining capacity (`capacity - consumed`, saturating at zero)
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.event.capacity.value().saturating_sub(self.consumed)
    }
}

/// The quota scope a rejection refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaScope {
    /// Category-level quota
    Category(CategoryId),
    /// Event-level quota
    Event(EventId),
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Category(id) => write!(f, "category {id}"),
            Self::Event(id) => write!(f, "event {id}"),
        }
    }
}

// ============================================================================
// Tickets and Orders
// ============================================================================

/// Lifecycle state of a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketState {
    /// Issued and not yet scanned
    Valid,
    /// Scanned once; terminal
    Redeemed,
}

impl TicketState {
    /// Convert state to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Redeemed => "redeemed",
        }
    }

    /// Parse state from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "redeemed" => Some(Self::Redeemed),
            _ => None,
        }
    }

    /// Applies a scan to this state.
    ///
    /// `Valid` moves to `Redeemed`; a redeemed ticket stays where it is.
    #[must_use]
    pub const fn scan(self) -> ScanTransition {
        match self {
            Self::Valid => ScanTransition::Redeem,
            Self::Redeemed => ScanTransition::AlreadyRedeemed,
        }
    }
}

/// Result of applying a scan to a [`TicketState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanTransition {
    /// Ticket moves `Valid -> Redeemed`
    Redeem,
    /// Ticket was already redeemed; no mutation
    AlreadyRedeemed,
}

/// An issued ticket.
///
/// Immutable after creation except for `state` and `redeemed_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket ID
    pub id: TicketId,
    /// Owning order
    pub order_id: OrderId,
    /// Category the ticket was issued in
    pub category_id: CategoryId,
    /// Event of that category
    pub event_id: EventId,
    /// Category price at allocation time
    pub price: Money,
    /// Lifecycle state
    pub state: TicketState,
    /// Redemption credential, unique across the store
    pub credential: Credential,
    /// When the ticket was issued
    pub created_at: DateTime<Utc>,
    /// When the ticket was first redeemed
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// Status of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Tickets were issued in full
    Allocated,
}

impl OrderStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
        }
    }

    /// Parse status from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allocated" => Some(Self::Allocated),
            _ => None,
        }
    }
}

/// A group of tickets issued by a single allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order ID
    pub id: OrderId,
    /// Buyer
    pub owner: OwnerId,
    /// Status
    pub status: OrderStatus,
    /// Sum of the tickets' price snapshots
    pub total: Money,
    /// When the order was created
    pub created_at: DateTime<Utc>,
    /// Issued tickets, in request order
    pub tickets: Vec<Ticket>,
}

// ============================================================================
// Redemption
// ============================================================================

/// Classified outcome of a scan, as stored in the audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// First scan of a valid ticket
    Accepted,
    /// Ticket had already been redeemed
    AlreadyRedeemed,
    /// No ticket matches the credential
    Unknown,
}

impl ScanOutcome {
    /// Convert outcome to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AlreadyRedeemed => "already_redeemed",
            Self::Unknown => "unknown",
        }
    }

    /// Parse outcome from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "already_redeemed" => Some(Self::AlreadyRedeemed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result returned to the scanning client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemOutcome {
    /// Ticket accepted; carries display data for the gate
    Accepted {
        /// Title of the event
        event_title: String,
        /// Name of the ticket category
        category_name: String,
    },
    /// Ticket had already been redeemed
    AlreadyRedeemed,
    /// Credential does not match any issued ticket
    Unknown,
}

impl RedeemOutcome {
    /// The audit classification of this outcome.
    #[must_use]
    pub const fn classification(&self) -> ScanOutcome {
        match self {
            Self::Accepted { .. } => ScanOutcome::Accepted,
            Self::AlreadyRedeemed => ScanOutcome::AlreadyRedeemed,
            Self::Unknown => ScanOutcome::Unknown,
        }
    }
}

/// Maximum stored length of the device description.
pub const MAX_DEVICE_INFO_LEN: usize = 120;

/// Replaces NUL characters, which text columns cannot hold, with U+FFFD.
///
/// Applied to everything a client can put into the scan audit log, and to audit lookups
/// so a query for the raw text finds the stored row.
#[must_use]
pub fn storable_text(text: &str) -> String {
    text.replace('\0', "\u{FFFD}")
}

/// Opaque client metadata attached to a scan attempt.
///
/// Deserialization goes through [`ScanContext::new`], so the device bound holds for
/// contexts read off the wire as well.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ScanContextFields")]
pub struct ScanContext {
    /// Operator performing the scan, if authenticated
    pub scanner: Option<OwnerId>,
    /// Device description (user agent), truncated to [`MAX_DEVICE_INFO_LEN`] characters
    pub device: String,
}

impl ScanContext {
    /// Creates a scan context, truncating the device description.
    #[must_use]
    pub fn new(scanner: Option<OwnerId>, device: impl Into<String>) -> Self {
        let device = storable_text(&device.into())
            .chars()
            .take(MAX_DEVICE_INFO_LEN)
            .collect();
        Self { scanner, device }
    }

    /// Re-applies the bounds of [`ScanContext::new`] to a context built field by field.
    #[must_use]
    pub fn bounded(self) -> Self {
        Self::new(self.scanner, self.device)
    }
}

#[derive(Deserialize)]
struct ScanContextFields {
    #[serde(default)]
    scanner: Option<OwnerId>,
    #[serde(default)]
    device: String,
}

impl From<ScanContextFields> for ScanContext {
    fn from(fields: ScanContextFields) -> Self {
        Self::new(fields.scanner, fields.device)
    }
}

/// A ticket located by credential under a row lock, with gate display data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockedTicket {
    /// The ticket as currently committed
    pub ticket: Ticket,
    /// Title of the ticket's event
    pub event_title: String,
    /// Name of the ticket's category
    pub category_name: String,
}

/// Immutable audit record, one per `redeem` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAttempt {
    /// Attempt ID
    pub id: ScanAttemptId,
    /// Credential as presented by the client, passed through [`storable_text`]
    pub presented: String,
    /// Resolved ticket, if any
    pub ticket_id: Option<TicketId>,
    /// Classified outcome
    pub outcome: ScanOutcome,
    /// When the attempt was recorded
    pub scanned_at: DateTime<Utc>,
    /// Client metadata
    pub context: ScanContext,
}

impl ScanAttempt {
    /// Builds the audit record for one scan, bounding the client-supplied text.
    #[must_use]
    pub fn record(
        presented: &str,
        ticket_id: Option<TicketId>,
        outcome: ScanOutcome,
        scanned_at: DateTime<Utc>,
        context: ScanContext,
    ) -> Self {
        Self {
            id: ScanAttemptId::new(),
            presented: storable_text(presented),
            ticket_id,
            outcome,
            scanned_at,
            context: context.bounded(),
        }
    }
}
