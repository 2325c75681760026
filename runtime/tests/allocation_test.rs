//! Allocation engine tests against the in-memory store.
//!
//! Concurrency tests run on a multi-threaded runtime so requests genuinely race for
//! the category and event locks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_core::environment::Clock;
use boxoffice_core::{
    AllocationError, CategoryId, CredentialGenerator, Money, Order, OwnerId, QuotaScope,
    StoreError, StoreTransaction, TicketState, TicketStore,
};
use boxoffice_runtime::{AllocationConfig, AllocationEngine};
use boxoffice_testing::{
    CollidingCredentialGenerator, InMemoryTicketStore, RecordingAuditSink,
    SequentialCredentialGenerator, fixtures, test_clock,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Fixtures
// ============================================================================

fn engine_with(
    store: &InMemoryTicketStore,
    credentials: Arc<dyn CredentialGenerator>,
    audit: Arc<RecordingAuditSink>,
    config: AllocationConfig,
) -> AllocationEngine {
    AllocationEngine::new(
        Arc::new(store.clone()),
        credentials,
        Arc::new(test_clock()),
        audit,
        config,
    )
}

fn engine(store: &InMemoryTicketStore) -> AllocationEngine {
    engine_with(
        store,
        Arc::new(SequentialCredentialGenerator::new()),
        Arc::new(RecordingAuditSink::new()),
        AllocationConfig::default(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("boxoffice_runtime=debug")
        .with_test_writer()
        .try_init();
}

async fn race(
    engine: &AllocationEngine,
    requests: usize,
    request: Vec<CategoryId>,
) -> Vec<Result<Order, AllocationError>> {
    init_tracing();
    let handles = (0..requests).map(|_| {
        let engine = engine.clone();
        let request = request.clone();
        tokio::spawn(async move { engine.allocate(OwnerId::new(), &request).await })
    });

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("allocation task panicked"))
        .collect()
}

// ============================================================================
// Quota Safety Under Contention
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_tickets_go_to_exactly_capacity_requests() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 3).await;
    let engine = engine(&store);

    let results = race(&engine, 6, vec![category.id]).await;

    let allocated = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(allocated, 3);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(AllocationError::QuotaExceeded {
                scope: QuotaScope::Category(id),
                requested: 1,
                remaining: 0,
            }) if *id == category.id
        ));
    }

    assert_eq!(store.category_remaining(category.id).await.unwrap(), Some(0));
    assert_eq!(store.tickets_in_category(category.id).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_orders_bound_by_tightest_category() {
    let store = InMemoryTicketStore::new();
    let (event, a, b) = fixtures::two_tier(&store).await;
    let engine = engine(&store);

    let results = race(&engine, 10, vec![a.id, a.id, b.id]).await;

    let orders: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(orders.len(), 5);
    for order in &orders {
        assert_eq!(order.tickets.len(), 3);
        assert_eq!(order.total, Money::from_cents(7000));
    }
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(AllocationError::QuotaExceeded {
                scope: QuotaScope::Category(id),
                ..
            }) if *id == b.id
        ));
    }

    assert_eq!(store.category_remaining(a.id).await.unwrap(), Some(5));
    assert_eq!(store.category_remaining(b.id).await.unwrap(), Some(0));
    assert_eq!(store.event_remaining(event.id).await.unwrap(), Some(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_event_cap_binds_across_categories() {
    let store = InMemoryTicketStore::new();
    let event = fixtures::seed_event(&store, "Overbooked Hall", 10).await;
    let floor = fixtures::seed_category(&store, &event, "Floor", 2000, 8).await;
    let balcony = fixtures::seed_category(&store, &event, "Balcony", 1500, 8).await;
    let engine = engine(&store);

    let results = race(&engine, 10, vec![floor.id, balcony.id]).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(AllocationError::QuotaExceeded {
                scope: QuotaScope::Event(id),
                ..
            }) if *id == event.id
        ));
    }
    assert_eq!(store.event_remaining(event.id).await.unwrap(), Some(0));
    assert_eq!(store.category_remaining(floor.id).await.unwrap(), Some(3));
}

// ============================================================================
// All-or-Nothing
// ============================================================================

#[tokio::test]
async fn test_partial_fit_issues_nothing() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 3).await;
    let engine = engine(&store);

    assert_ok!(
        engine
            .allocate(OwnerId::new(), &[category.id, category.id])
            .await
    );

    let result = engine
        .allocate(OwnerId::new(), &[category.id, category.id])
        .await;

    assert_eq!(
        result,
        Err(AllocationError::QuotaExceeded {
            scope: QuotaScope::Category(category.id),
            requested: 2,
            remaining: 1,
        })
    );
    assert_eq!(store.category_remaining(category.id).await.unwrap(), Some(1));
    assert_eq!(store.order_count().await, 1);
}

#[tokio::test]
async fn test_unknown_category_rejected_without_writes() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 3).await;
    let engine = engine(&store);
    let missing = CategoryId::new();

    let result = engine.allocate(OwnerId::new(), &[category.id, missing]).await;

    assert_eq!(result, Err(AllocationError::UnknownCategory(missing)));
    assert_eq!(store.ticket_count().await, 0);
}

#[tokio::test]
async fn test_empty_and_oversized_requests_rejected() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 100).await;
    let engine = engine_with(
        &store,
        Arc::new(SequentialCredentialGenerator::new()),
        Arc::new(RecordingAuditSink::new()),
        AllocationConfig {
            max_tickets_per_order: 4,
            ..AllocationConfig::default()
        },
    );

    assert_eq!(
        engine.allocate(OwnerId::new(), &[]).await,
        Err(AllocationError::EmptyRequest)
    );
    assert!(matches!(
        engine.allocate(OwnerId::new(), &[category.id; 5]).await,
        Err(AllocationError::InvalidRequest(_))
    ));
    assert_eq!(store.ticket_count().await, 0);
}

// ============================================================================
// Order Contents
// ============================================================================

#[tokio::test]
async fn test_order_snapshots_prices_and_persists() {
    let store = InMemoryTicketStore::new();
    let (event, a, b) = fixtures::two_tier(&store).await;
    let audit = Arc::new(RecordingAuditSink::new());
    let engine = engine_with(
        &store,
        Arc::new(SequentialCredentialGenerator::new()),
        Arc::clone(&audit),
        AllocationConfig::default(),
    );
    let owner = OwnerId::new();

    let order = engine.allocate(owner, &[a.id, b.id, a.id]).await.unwrap();

    assert_eq!(order.owner, owner);
    assert_eq!(order.total, Money::from_cents(7000));
    assert_eq!(order.created_at, test_clock().now());
    let categories: Vec<_> = order.tickets.iter().map(|t| t.category_id).collect();
    assert_eq!(categories, vec![a.id, b.id, a.id]);
    for ticket in &order.tickets {
        assert_eq!(ticket.state, TicketState::Valid);
        assert_eq!(ticket.event_id, event.id);
        assert_eq!(ticket.order_id, order.id);
        assert!(ticket.redeemed_at.is_none());
    }

    let stored = store.order(order.id).await.unwrap().unwrap();
    assert_eq!(stored, order);
    assert_eq!(audit.orders(), vec![order]);
}

// ============================================================================
// Credential Collisions
// ============================================================================

#[tokio::test]
async fn test_collision_retried_with_fresh_credential() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 10).await;
    let engine = engine_with(
        &store,
        Arc::new(CollidingCredentialGenerator::new(2)),
        Arc::new(RecordingAuditSink::new()),
        AllocationConfig::default(),
    );

    let order = engine
        .allocate(OwnerId::new(), &[category.id, category.id])
        .await
        .unwrap();

    assert_eq!(order.tickets.len(), 2);
    assert_eq!(order.tickets[0].credential, CollidingCredentialGenerator::repeated());
    assert_ne!(order.tickets[1].credential, CollidingCredentialGenerator::repeated());
}

#[tokio::test]
async fn test_exhausted_collisions_fail_whole_batch() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 10).await;
    let engine = engine_with(
        &store,
        Arc::new(CollidingCredentialGenerator::new(100)),
        Arc::new(RecordingAuditSink::new()),
        AllocationConfig::default(),
    );

    let result = engine
        .allocate(OwnerId::new(), &[category.id, category.id])
        .await;

    assert_eq!(result, Err(AllocationError::CredentialCollision { attempts: 3 }));
    assert_eq!(store.ticket_count().await, 0);
    assert_eq!(store.order_count().await, 0);
}

#[tokio::test]
async fn test_collision_with_uncommitted_ticket_is_retried() {
    let store = InMemoryTicketStore::new();
    let (_, first_category) = fixtures::single_category(&store, 5).await;
    let (_, second_category) = fixtures::single_category(&store, 5).await;
    let engine = engine_with(
        &store,
        Arc::new(CollidingCredentialGenerator::new(2)),
        Arc::new(RecordingAuditSink::new()),
        AllocationConfig::default(),
    );

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    let first_order = engine
        .allocate_in(first.as_mut(), OwnerId::new(), &[first_category.id])
        .await
        .unwrap();
    let second_order = engine
        .allocate_in(second.as_mut(), OwnerId::new(), &[second_category.id])
        .await
        .unwrap();

    assert_ok!(first.commit().await);
    assert_ok!(second.commit().await);
    assert_eq!(first_order.tickets[0].credential, CollidingCredentialGenerator::repeated());
    assert_ne!(second_order.tickets[0].credential, CollidingCredentialGenerator::repeated());
    assert_eq!(store.ticket_count().await, 2);
}

#[test]
fn test_commit_time_collision_is_a_storage_fault() {
    let error = AllocationError::from(StoreError::CredentialCollision(
        CollidingCredentialGenerator::repeated(),
    ));

    assert!(matches!(error, AllocationError::Storage(_)));
}

// ============================================================================
// Lock Timeout
// ============================================================================

#[tokio::test]
async fn test_lock_timeout_is_retryable_and_writes_nothing() {
    let store = InMemoryTicketStore::with_lock_timeout(Duration::from_millis(25));
    let (_, category) = fixtures::single_category(&store, 3).await;
    let engine = engine(&store);

    let mut holder = store.transaction();
    holder.lock_categories(&[category.id]).await.unwrap();

    let error = assert_err!(engine.allocate(OwnerId::new(), &[category.id]).await);
    assert_eq!(error, AllocationError::LockTimeout);
    assert!(error.is_retryable());

    drop(holder);
    assert!(engine.allocate(OwnerId::new(), &[category.id]).await.is_ok());
    assert_eq!(store.category_remaining(category.id).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_allocate_in_leaves_commit_to_caller() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 3).await;
    let engine = engine(&store);

    let mut tx = store.begin().await.unwrap();
    let order = engine
        .allocate_in(tx.as_mut(), OwnerId::new(), &[category.id])
        .await
        .unwrap();
    assert_eq!(store.category_remaining(category.id).await.unwrap(), Some(3));

    tx.commit().await.unwrap();
    assert_eq!(store.category_remaining(category.id).await.unwrap(), Some(2));
    assert!(store.order(order.id).await.unwrap().is_some());
}
