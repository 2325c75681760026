//! `TicketingService` tests against the in-memory store.
//!
//! Run with: `cargo test --test service_test`

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_core::{
    AllocationError, Money, OwnerId, RedeemOutcome, ScanContext, ScanOutcome, StoreTransaction,
    Ticket, TicketId, TicketState,
};
use boxoffice_runtime::RetryPolicy;
use boxoffice_testing::{
    InMemoryTicketStore, RecordingAuditSink, SequentialCredentialGenerator, fixtures, test_clock,
};
use std::sync::Arc;
use std::time::Duration;
use ticketing::render::{RenderFuture, RenderedTicket};
use ticketing::{
    AppError, Config, ConfigError, QrPayloadRenderer, RenderError, TicketRenderer,
    TicketingService,
};
use tokio::sync::mpsc;

// ============================================================================
// Test Fixtures
// ============================================================================

struct ChannelRenderer {
    rendered: mpsc::UnboundedSender<TicketId>,
}

impl TicketRenderer for ChannelRenderer {
    fn render<'a>(&'a self, ticket: &'a Ticket) -> RenderFuture<'a> {
        Box::pin(async move {
            let _ = self.rendered.send(ticket.id);
            Ok(RenderedTicket {
                ticket_id: ticket.id,
                payload: QrPayloadRenderer::payload(ticket),
            })
        })
    }
}

struct BrokenRenderer;

impl TicketRenderer for BrokenRenderer {
    fn render<'a>(&'a self, ticket: &'a Ticket) -> RenderFuture<'a> {
        Box::pin(async move {
            Err(RenderError::Failed {
                ticket_id: ticket.id,
                reason: "template missing".to_string(),
            })
        })
    }
}

fn service(store: &InMemoryTicketStore) -> TicketingService {
    TicketingService::builder(Arc::new(store.clone()))
        .credentials(Arc::new(SequentialCredentialGenerator::new()))
        .clock(Arc::new(test_clock()))
        .audit(Arc::new(RecordingAuditSink::new()))
        .build()
}

// ============================================================================
// Allocation and Redemption Through the Service
// ============================================================================

#[tokio::test]
async fn test_payload_scan_accepts_then_reports_redeemed() {
    let store = InMemoryTicketStore::new();
    let (event, category) = fixtures::single_category(&store, 5).await;
    let service = service(&store);

    let order = service.allocate(OwnerId::new(), &[category.id]).await.unwrap();
    let ticket = &order.tickets[0];
    let payload = QrPayloadRenderer::payload(ticket);

    let first = service.redeem(&payload, ScanContext::default()).await.unwrap();
    assert_eq!(
        first,
        RedeemOutcome::Accepted {
            event_title: event.title.clone(),
            category_name: category.name.clone(),
        }
    );
    let second = service
        .redeem(ticket.credential.as_str(), ScanContext::default())
        .await
        .unwrap();
    assert_eq!(second, RedeemOutcome::AlreadyRedeemed);

    let attempts = service.scan_attempts(ticket.credential.as_str()).await.unwrap();
    let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![ScanOutcome::Accepted, ScanOutcome::AlreadyRedeemed]);

    let stored = service
        .ticket_by_credential(ticket.credential.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, TicketState::Redeemed);
}

#[tokio::test]
async fn test_order_total_round_trips() {
    let store = InMemoryTicketStore::new();
    let (_, a, b) = fixtures::two_tier(&store).await;
    let service = service(&store);

    let order = service
        .allocate(OwnerId::new(), &[a.id, a.id, b.id])
        .await
        .unwrap();

    let stored = service.order(order.id).await.unwrap().unwrap();
    let sum = stored
        .tickets
        .iter()
        .try_fold(Money::from_cents(0), |acc, t| acc.checked_add(t.price))
        .unwrap();
    assert_eq!(stored.total, Money::from_cents(7000));
    assert_eq!(stored.total, sum);
    assert_eq!(stored.total, order.total);
}

#[tokio::test]
async fn test_reads_are_idempotent_without_allocation() {
    let store = InMemoryTicketStore::new();
    let (event, category) = fixtures::single_category(&store, 4).await;
    let service = service(&store);
    service.allocate(OwnerId::new(), &[category.id]).await.unwrap();

    let first = (
        service.category_remaining(category.id).await.unwrap(),
        service.event_remaining(event.id).await.unwrap(),
    );
    let second = (
        service.category_remaining(category.id).await.unwrap(),
        service.event_remaining(event.id).await.unwrap(),
    );

    assert_eq!(first, second);
    assert_eq!(first, (Some(3), Some(39)));
}

#[tokio::test]
async fn test_garbage_credential_lookup_finds_nothing() {
    let store = InMemoryTicketStore::new();
    let service = service(&store);

    assert!(service.ticket_by_credential("not-hex").await.unwrap().is_none());
    assert!(service.ticket(TicketId::new()).await.unwrap().is_none());
}

// ============================================================================
// Retry of Lock Timeouts
// ============================================================================

#[tokio::test]
async fn test_lock_timeout_retried_until_holder_releases() {
    let store = InMemoryTicketStore::with_lock_timeout(Duration::from_millis(20));
    let (_, category) = fixtures::single_category(&store, 3).await;
    let service = TicketingService::builder(Arc::new(store.clone()))
        .retry_policy(
            RetryPolicy::builder()
                .max_retries(20)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
        .build();

    let mut holder = store.transaction();
    holder.lock_categories(&[category.id]).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(holder);
    });

    let order = service.allocate(OwnerId::new(), &[category.id]).await;
    release.await.unwrap();

    assert!(order.is_ok());
    assert_eq!(service.category_remaining(category.id).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_lock_timeout_surfaces_when_retries_disabled() {
    let store = InMemoryTicketStore::with_lock_timeout(Duration::from_millis(20));
    let (_, category) = fixtures::single_category(&store, 3).await;
    let service = TicketingService::builder(Arc::new(store.clone()))
        .retry_policy(RetryPolicy::none())
        .build();

    let mut holder = store.transaction();
    holder.lock_categories(&[category.id]).await.unwrap();

    let result = service.allocate(OwnerId::new(), &[category.id]).await;

    assert_eq!(result, Err(AllocationError::LockTimeout));
    drop(holder);
}

#[tokio::test]
async fn test_business_rejections_are_not_retried() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 1).await;
    let audit = Arc::new(RecordingAuditSink::new());
    let service = TicketingService::builder(Arc::new(store.clone()))
        .audit(audit.clone())
        .build();

    service.allocate(OwnerId::new(), &[category.id]).await.unwrap();
    let result = service.allocate(OwnerId::new(), &[category.id]).await;

    assert!(matches!(result, Err(AllocationError::QuotaExceeded { .. })));
    assert_eq!(audit.orders().len(), 1);
    assert_eq!(store.order_count().await, 1);
}

#[tokio::test]
async fn test_every_added_audit_sink_is_notified() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 5).await;
    let first = Arc::new(RecordingAuditSink::new());
    let second = Arc::new(RecordingAuditSink::new());
    let service = TicketingService::builder(Arc::new(store.clone()))
        .audit(first.clone())
        .audit(second.clone())
        .build();

    let order = service.allocate(OwnerId::new(), &[category.id]).await.unwrap();
    service
        .redeem(order.tickets[0].credential.as_str(), ScanContext::default())
        .await
        .unwrap();

    for sink in [&first, &second] {
        assert_eq!(sink.orders(), vec![order.clone()]);
        assert_eq!(sink.scans().len(), 1);
        assert_eq!(sink.scans()[0].outcome, ScanOutcome::Accepted);
    }
}

// ============================================================================
// Post-Commit Rendering
// ============================================================================

#[tokio::test]
async fn test_committed_tickets_are_rendered() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 5).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = TicketingService::builder(Arc::new(store.clone()))
        .renderer(Arc::new(ChannelRenderer { rendered: tx }))
        .build();

    let order = service
        .allocate(OwnerId::new(), &[category.id, category.id])
        .await
        .unwrap();

    let mut rendered = Vec::new();
    for _ in 0..2 {
        let id = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("render within a second")
            .expect("renderer alive");
        rendered.push(id);
    }
    let issued: Vec<_> = order.tickets.iter().map(|t| t.id).collect();
    assert_eq!(rendered, issued);
}

#[tokio::test]
async fn test_render_failure_keeps_ticket_valid() {
    let store = InMemoryTicketStore::new();
    let (_, category) = fixtures::single_category(&store, 5).await;
    let service = TicketingService::builder(Arc::new(store.clone()))
        .renderer(Arc::new(BrokenRenderer))
        .build();

    let order = service.allocate(OwnerId::new(), &[category.id]).await.unwrap();

    assert!(service.render_order(&order).await.is_empty());
    let ticket = service.ticket(order.tickets[0].id).await.unwrap().unwrap();
    assert_eq!(ticket.state, TicketState::Valid);
    assert_eq!(service.category_remaining(category.id).await.unwrap(), Some(4));
}

// ============================================================================
// Construction From Config
// ============================================================================

#[tokio::test]
async fn test_from_config_builds_memory_service() {
    let service = TicketingService::from_config(&Config::default()).await.unwrap();
    let (_, category) = fixtures::single_category(service.store().as_ref(), 2).await;

    let order = service.allocate(OwnerId::new(), &[category.id]).await.unwrap();

    assert_eq!(order.tickets.len(), 1);
    assert_eq!(order.tickets[0].credential.as_str().len(), 64);
}

#[tokio::test]
async fn test_from_config_rejects_invalid_settings() {
    let config =
        Config::from_lookup(|key| (key == "MAX_TICKETS_PER_ORDER").then(|| "0".to_string()));

    let result = TicketingService::from_config(&config).await;

    assert!(matches!(
        result,
        Err(AppError::Config(ConfigError::Invalid {
            key: "MAX_TICKETS_PER_ORDER",
            ..
        }))
    ));
}
