//! # Boxoffice Testing
//!
//! Testing utilities for the allocation and redemption engines.
//!
//! This crate provides:
//! - [`InMemoryTicketStore`]: a lock-faithful in-memory store
//! - Mock implementations of environment traits (clock, credentials, audit sink)
//! - Catalog fixtures for the common test scenarios
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::{InMemoryTicketStore, fixtures};
//!
//! #[tokio::test]
//! async fn test_last_ticket() {
//!     let store = InMemoryTicketStore::new();
//!     let (event, category) = fixtures::single_category(&store, 3).await;
//!     // build an AllocationEngine over `store` and race six requests...
//! }
//! ```

use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod memory;

pub use memory::{InMemoryTicketStore, InMemoryTransaction};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use boxoffice_core::{
        AuditSink, Credential, CredentialGenerator, Order, OrderId, ScanAttempt, TicketId,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock a test can move forward between calls.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::SettableClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = SettableClock::new(start);
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now(), start + Duration::minutes(5));
    /// ```
    #[derive(Debug)]
    pub struct SettableClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl SettableClock {
        /// Create a clock reading `time` until it is moved
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Set the current time
        pub fn set(&self, time: DateTime<Utc>) {
            if let Ok(mut current) = self.time.lock() {
                *current = time;
            }
        }

        /// Move the current time forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut current) = self.time.lock() {
                *current += by;
            }
        }
    }

    impl Clock for SettableClock {
        fn now(&self) -> DateTime<Utc> {
            match self.time.lock() {
                Ok(current) => *current,
                Err(poisoned) => *poisoned.into_inner(),
            }
        }
    }

    /// Predictable credentials: the hex of a zero-padded counter.
    ///
    /// Every value is distinct and well-formed, so tests can assert on exact
    /// credentials without depending on randomness.
    #[derive(Debug, Default)]
    pub struct SequentialCredentialGenerator {
        next: AtomicU64,
    }

    impl SequentialCredentialGenerator {
        /// Starts counting from zero
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }
    }

    impl CredentialGenerator for SequentialCredentialGenerator {
        fn generate(&self, _ticket_id: TicketId, _order_id: OrderId) -> Credential {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            let mut digest = [0u8; 32];
            digest[24..].copy_from_slice(&n.to_be_bytes());
            Credential::from_digest(digest)
        }
    }

    /// Returns the same credential for the first `repeats` draws, then fresh ones.
    ///
    /// Forces the collision path: every draw after the first one that repeats the
    /// credential is rejected by the store.
    #[derive(Debug)]
    pub struct CollidingCredentialGenerator {
        repeats: u64,
        drawn: AtomicU64,
        fresh: SequentialCredentialGenerator,
    }

    impl CollidingCredentialGenerator {
        /// Repeats one fixed credential for `repeats` draws
        #[must_use]
        pub const fn new(repeats: u64) -> Self {
            Self {
                repeats,
                drawn: AtomicU64::new(0),
                fresh: SequentialCredentialGenerator {
                    next: AtomicU64::new(1_000_000),
                },
            }
        }

        /// The credential handed out while repeating
        #[must_use]
        pub fn repeated() -> Credential {
            Credential::from_digest([0xab; 32])
        }
    }

    impl CredentialGenerator for CollidingCredentialGenerator {
        fn generate(&self, ticket_id: TicketId, order_id: OrderId) -> Credential {
            if self.drawn.fetch_add(1, Ordering::SeqCst) < self.repeats {
                Self::repeated()
            } else {
                self.fresh.generate(ticket_id, order_id)
            }
        }
    }

    /// Audit sink that keeps every notification for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingAuditSink {
        orders: Mutex<Vec<Order>>,
        scans: Mutex<Vec<ScanAttempt>>,
    }

    impl RecordingAuditSink {
        /// Creates an empty sink
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Orders received so far
        #[must_use]
        pub fn orders(&self) -> Vec<Order> {
            self.orders.lock().map(|o| o.clone()).unwrap_or_default()
        }

        /// Scan attempts received so far
        #[must_use]
        pub fn scans(&self) -> Vec<ScanAttempt> {
            self.scans.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    impl AuditSink for RecordingAuditSink {
        fn order_allocated(&self, order: &Order) {
            if let Ok(mut orders) = self.orders.lock() {
                orders.push(order.clone());
            }
        }

        fn scan_recorded(&self, attempt: &ScanAttempt) {
            if let Ok(mut scans) = self.scans.lock() {
                scans.push(attempt.clone());
            }
        }
    }
}

/// Catalog fixtures shared by the engine and service tests.
pub mod fixtures {
    use boxoffice_core::catalog::{NewCategory, NewEvent};
    use boxoffice_core::{Capacity, Category, Event, Money, TicketStore};
    use chrono::{Duration, TimeZone, Utc};

    /// A valid event request with the given capacity.
    ///
    /// # Panics
    ///
    /// Never in practice; the start timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_event(title: &str, capacity: u32) -> NewEvent {
        let starts_at = Utc
            .with_ymd_and_hms(2025, 6, 1, 19, 0, 0)
            .single()
            .expect("hardcoded timestamp is unambiguous");
        NewEvent {
            title: title.to_string(),
            capacity: Capacity::new(capacity),
            starts_at,
            ends_at: starts_at + Duration::hours(3),
        }
    }

    /// Seeds an event.
    ///
    /// # Panics
    ///
    /// If the store rejects the event.
    #[allow(clippy::expect_used)]
    pub async fn seed_event(store: &dyn TicketStore, title: &str, capacity: u32) -> Event {
        store
            .create_event(new_event(title, capacity))
            .await
            .expect("fixture event is valid")
    }

    /// Seeds a category under `event`.
    ///
    /// # Panics
    ///
    /// If the store rejects the category.
    #[allow(clippy::expect_used)]
    pub async fn seed_category(
        store: &dyn TicketStore,
        event: &Event,
        name: &str,
        price_cents: u64,
        capacity: u32,
    ) -> Category {
        store
            .create_category(NewCategory {
                event_id: event.id,
                name: name.to_string(),
                price: Money::from_cents(price_cents),
                capacity: Capacity::new(capacity),
            })
            .await
            .expect("fixture category is valid")
    }

    /// One event with a single category; the event capacity is ten times larger.
    pub async fn single_category(store: &dyn TicketStore, capacity: u32) -> (Event, Category) {
        let event = seed_event(store, "Sold Out Night", capacity.saturating_mul(10)).await;
        let category = seed_category(store, &event, "General", 1000, capacity).await;
        (event, category)
    }

    /// Event of 20 with category A (15 at 10.00) and B (5 at 50.00), whose sum equals
    /// the event capacity.
    pub async fn two_tier(store: &dyn TicketStore) -> (Event, Category, Category) {
        let event = seed_event(store, "Two Tier Gala", 20).await;
        let a = seed_category(store, &event, "A", 1000, 15).await;
        let b = seed_category(store, &event, "B", 5000, 5).await;
        (event, a, b)
    }
}

// Re-export commonly used items
pub use mocks::{
    CollidingCredentialGenerator, FixedClock, RecordingAuditSink, SequentialCredentialGenerator,
    SettableClock, test_clock,
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use boxoffice_core::{CredentialGenerator, OrderId, TicketId};

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_settable_clock_moves_only_when_told() {
        let clock = SettableClock::new(test_clock().now());
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_sequential_credentials_are_distinct_and_well_formed() {
        let generator = SequentialCredentialGenerator::new();
        let first = generator.generate(TicketId::new(), OrderId::new());
        let second = generator.generate(TicketId::new(), OrderId::new());

        assert_ne!(first, second);
        assert!(boxoffice_core::Credential::parse(first.as_str()).is_some());
        assert!(first.as_str().ends_with("0000000000000000"));
    }

    #[test]
    fn test_colliding_generator_repeats_then_recovers() {
        let generator = CollidingCredentialGenerator::new(2);
        let draws: Vec<_> = (0..3)
            .map(|_| generator.generate(TicketId::new(), OrderId::new()))
            .collect();

        assert_eq!(draws[0], CollidingCredentialGenerator::repeated());
        assert_eq!(draws[1], CollidingCredentialGenerator::repeated());
        assert_ne!(draws[2], CollidingCredentialGenerator::repeated());
    }
}
