//! Audit sink that writes committed orders and scans to `tracing`.

use boxoffice_core::{AuditSink, Order, ScanAttempt};

/// Emits one structured `tracing` event per committed order or scan.
///
/// Events use the `boxoffice::audit` target so they can be routed separately with
/// `RUST_LOG=boxoffice::audit=info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn order_allocated(&self, order: &Order) {
        tracing::info!(
            target: "boxoffice::audit",
            order_id = %order.id,
            owner = %order.owner,
            status = order.status.as_str(),
            tickets = order.tickets.len(),
            total = %order.total,
            "order_allocated"
        );
    }

    fn scan_recorded(&self, attempt: &ScanAttempt) {
        tracing::info!(
            target: "boxoffice::audit",
            attempt_id = %attempt.id,
            ticket_id = ?attempt.ticket_id.map(|id| id.to_string()),
            outcome = attempt.outcome.as_str(),
            scanner = ?attempt.context.scanner.map(|id| id.to_string()),
            device = %attempt.context.device,
            "scan_recorded"
        );
    }
}
