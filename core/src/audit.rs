//! Downstream sinks for committed orders and scan attempts.
//!
//! The durable audit log is the `scan_attempts` data written inside each redemption
//! transaction. Sinks receive a copy after commit for logging or notification; they
//! must return quickly and their failure never affects the operation.

use crate::types::{Order, ScanAttempt};
use std::sync::Arc;

/// Receives notifications after allocation and redemption commits.
pub trait AuditSink: Send + Sync {
    /// An order was committed.
    fn order_allocated(&self, order: &Order);

    /// A scan attempt was committed.
    fn scan_recorded(&self, attempt: &ScanAttempt);
}

/// Sink that drops every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn order_allocated(&self, _order: &Order) {}

    fn scan_recorded(&self, _attempt: &ScanAttempt) {}
}

/// Fans notifications out to several sinks in order.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    /// Creates a fan-out over the given sinks
    #[must_use]
    pub const fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn order_allocated(&self, order: &Order) {
        for sink in &self.sinks {
            sink.order_allocated(order);
        }
    }

    fn scan_recorded(&self, attempt: &ScanAttempt) {
        for sink in &self.sinks {
            sink.scan_recorded(attempt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanAttemptId, ScanContext, ScanOutcome};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        scans: AtomicUsize,
    }

    impl AuditSink for CountingSink {
        fn order_allocated(&self, _order: &Order) {}

        fn scan_recorded(&self, _attempt: &ScanAttempt) {
            self.scans.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attempt() -> ScanAttempt {
        ScanAttempt {
            id: ScanAttemptId::new(),
            presented: "nope".to_string(),
            ticket_id: None,
            outcome: ScanOutcome::Unknown,
            scanned_at: Utc::now(),
            context: ScanContext::default(),
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(CountingSink::default());
        let second = Arc::new(CountingSink::default());
        let sinks: Vec<Arc<dyn AuditSink>> =
            vec![first.clone(), Arc::new(NullAuditSink), second.clone()];
        let fanout = FanoutAuditSink::new(sinks);

        fanout.scan_recorded(&attempt());
        fanout.scan_recorded(&attempt());

        assert_eq!(first.scans.load(Ordering::SeqCst), 2);
        assert_eq!(second.scans.load(Ordering::SeqCst), 2);
    }
}
