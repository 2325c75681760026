//! Redemption state machine tests against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_core::environment::Clock;
use boxoffice_core::{
    Credential, OwnerId, RedeemError, RedeemOutcome, ScanContext, ScanOutcome, StoreTransaction,
    Ticket, TicketState, TicketStore, MAX_DEVICE_INFO_LEN,
};
use boxoffice_runtime::{AllocationConfig, AllocationEngine, RedemptionMachine};
use boxoffice_testing::{
    InMemoryTicketStore, RecordingAuditSink, SequentialCredentialGenerator, SettableClock,
    fixtures, test_clock,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: InMemoryTicketStore,
    machine: RedemptionMachine,
    audit: Arc<RecordingAuditSink>,
}

impl Harness {
    fn new(store: InMemoryTicketStore) -> Self {
        Self::with_clock(store, Arc::new(test_clock()))
    }

    fn with_clock(store: InMemoryTicketStore, clock: Arc<dyn Clock>) -> Self {
        let audit = Arc::new(RecordingAuditSink::new());
        let machine = RedemptionMachine::new(Arc::new(store.clone()), clock, audit.clone());
        Self {
            store,
            machine,
            audit,
        }
    }

    /// Issues one ticket in a fresh "Gate Night / Standard" catalog.
    async fn issue_ticket(&self) -> Ticket {
        let event = fixtures::seed_event(&self.store, "Gate Night", 50).await;
        let category = fixtures::seed_category(&self.store, &event, "Standard", 1500, 10).await;
        let engine = AllocationEngine::new(
            Arc::new(self.store.clone()),
            Arc::new(SequentialCredentialGenerator::new()),
            Arc::new(test_clock()),
            Arc::new(RecordingAuditSink::new()),
            AllocationConfig::default(),
        );
        let mut order = engine.allocate(OwnerId::new(), &[category.id]).await.unwrap();
        order.tickets.remove(0)
    }
}

fn gate(device: &str) -> ScanContext {
    ScanContext::new(Some(OwnerId::new()), device)
}

// ============================================================================
// One-Shot Transition
// ============================================================================

#[tokio::test]
async fn test_first_scan_accepts_second_reports_redeemed() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;
    let presented = ticket.credential.as_str();

    let first = harness.machine.redeem(presented, gate("gate-1")).await.unwrap();
    assert_eq!(
        first,
        RedeemOutcome::Accepted {
            event_title: "Gate Night".to_string(),
            category_name: "Standard".to_string(),
        }
    );

    let second = harness.machine.redeem(presented, gate("gate-2")).await.unwrap();
    assert_eq!(second, RedeemOutcome::AlreadyRedeemed);

    let stored = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TicketState::Redeemed);
    assert_eq!(stored.redeemed_at, Some(test_clock().now()));

    let attempts = harness.store.scan_attempts(presented).await.unwrap();
    let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![ScanOutcome::Accepted, ScanOutcome::AlreadyRedeemed]);
    assert!(attempts.iter().all(|a| a.ticket_id == Some(ticket.id)));
    assert_eq!(harness.audit.scans(), attempts);
}

#[tokio::test]
async fn test_unknown_credential_is_recorded() {
    let harness = Harness::new(InMemoryTicketStore::new());
    harness.issue_ticket().await;
    let stranger = Credential::from_digest([0x5a; 32]);

    let outcome = harness
        .machine
        .redeem(stranger.as_str(), gate("gate-1"))
        .await
        .unwrap();

    assert_eq!(outcome, RedeemOutcome::Unknown);
    let attempts = harness.store.scan_attempts(stranger.as_str()).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, ScanOutcome::Unknown);
    assert_eq!(attempts[0].ticket_id, None);
}

#[tokio::test]
async fn test_malformed_and_empty_credentials_are_unknown() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;
    let truncated = &ticket.credential.as_str()[..63];
    let padded = format!(" {}", ticket.credential);

    for presented in ["", "not-a-credential", truncated, padded.as_str()] {
        let outcome = harness.machine.redeem(presented, gate("gate-1")).await.unwrap();
        assert_eq!(outcome, RedeemOutcome::Unknown);
    }

    assert_eq!(harness.store.all_scan_attempts().await.len(), 4);
    let stored = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TicketState::Valid);
}

#[tokio::test]
async fn test_device_description_is_truncated() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;
    let user_agent = "x".repeat(300);

    harness
        .machine
        .redeem(ticket.credential.as_str(), gate(&user_agent))
        .await
        .unwrap();

    let attempts = harness.store.scan_attempts(ticket.credential.as_str()).await.unwrap();
    assert_eq!(attempts[0].context.device.chars().count(), MAX_DEVICE_INFO_LEN);
}

#[tokio::test]
async fn test_second_scan_keeps_first_redemption_time() {
    let clock = Arc::new(SettableClock::new(test_clock().now()));
    let harness = Harness::with_clock(InMemoryTicketStore::new(), clock.clone());
    let ticket = harness.issue_ticket().await;
    let presented = ticket.credential.as_str();
    let first_scan = clock.now();

    harness.machine.redeem(presented, gate("gate-1")).await.unwrap();
    clock.advance(chrono::Duration::minutes(10));
    let second = harness.machine.redeem(presented, gate("gate-2")).await.unwrap();

    assert_eq!(second, RedeemOutcome::AlreadyRedeemed);
    let stored = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.redeemed_at, Some(first_scan));

    let attempts = harness.store.scan_attempts(presented).await.unwrap();
    let times: Vec<_> = attempts.iter().map(|a| a.scanned_at).collect();
    assert_eq!(times, vec![first_scan, first_scan + chrono::Duration::minutes(10)]);
}

#[tokio::test]
async fn test_context_built_field_by_field_is_bounded() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;
    let context = ScanContext {
        scanner: None,
        device: "x".repeat(300),
    };

    let outcome = harness
        .machine
        .redeem(ticket.credential.as_str(), context)
        .await
        .unwrap();

    assert!(matches!(outcome, RedeemOutcome::Accepted { .. }));
    let attempts = harness.store.scan_attempts(ticket.credential.as_str()).await.unwrap();
    assert_eq!(attempts[0].context.device.chars().count(), MAX_DEVICE_INFO_LEN);
}

#[tokio::test]
async fn test_nul_in_presented_text_is_unknown_and_recorded() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;
    let presented = format!("{}\0", ticket.credential);

    let outcome = harness.machine.redeem(&presented, gate("gate-1")).await.unwrap();

    assert_eq!(outcome, RedeemOutcome::Unknown);
    let attempts = harness.store.scan_attempts(&presented).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(!attempts[0].presented.contains('\0'));
    let stored = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TicketState::Valid);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scans_accept_exactly_once() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;

    let handles = (0..8).map(|i| {
        let machine = harness.machine.clone();
        let presented = ticket.credential.to_string();
        tokio::spawn(async move { machine.redeem(&presented, gate(&format!("gate-{i}"))).await })
    });
    let outcomes: Vec<RedeemOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let accepted = outcomes
        .iter()
        .filter(|o| matches!(o, RedeemOutcome::Accepted { .. }))
        .count();
    let repeated = outcomes
        .iter()
        .filter(|o| **o == RedeemOutcome::AlreadyRedeemed)
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(repeated, 7);

    let attempts = harness.store.scan_attempts(ticket.credential.as_str()).await.unwrap();
    assert_eq!(attempts.len(), 8);
    assert_eq!(
        attempts.iter().filter(|a| a.outcome == ScanOutcome::Accepted).count(),
        1
    );
}

#[tokio::test]
async fn test_lock_timeout_records_nothing() {
    let harness = Harness::new(InMemoryTicketStore::with_lock_timeout(Duration::from_millis(25)));
    let ticket = harness.issue_ticket().await;

    let mut holder = harness.store.transaction();
    holder
        .lock_ticket_by_credential(&ticket.credential)
        .await
        .unwrap()
        .unwrap();

    let result = harness
        .machine
        .redeem(ticket.credential.as_str(), gate("gate-1"))
        .await;
    assert_eq!(result, Err(RedeemError::LockTimeout));
    assert!(harness.store.all_scan_attempts().await.is_empty());

    drop(holder);
    let outcome = harness
        .machine
        .redeem(ticket.credential.as_str(), gate("gate-1"))
        .await
        .unwrap();
    assert!(matches!(outcome, RedeemOutcome::Accepted { .. }));
}

#[tokio::test]
async fn test_redeem_in_is_invisible_until_commit() {
    let harness = Harness::new(InMemoryTicketStore::new());
    let ticket = harness.issue_ticket().await;

    let mut tx = harness.store.begin().await.unwrap();
    let (outcome, attempt) = harness
        .machine
        .redeem_in(tx.as_mut(), ticket.credential.as_str(), ScanContext::default())
        .await
        .unwrap();
    assert!(matches!(outcome, RedeemOutcome::Accepted { .. }));
    assert_eq!(attempt.outcome, ScanOutcome::Accepted);

    let before = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(before.state, TicketState::Valid);

    tx.rollback().await.unwrap();
    let after = harness.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(after.state, TicketState::Valid);
    assert!(harness.store.all_scan_attempts().await.is_empty());
}
