//! Redemption state machine: one-shot `Valid -> Redeemed` under a row lock.
//!
//! Every call to [`RedemptionMachine::redeem`] writes exactly one [`ScanAttempt`], in the
//! same transaction as the state change. Concurrent scans of one credential serialize on
//! the ticket lock, so at most one of them ever observes `Valid`.

use crate::metrics::{LockMetrics, RedemptionMetrics};
use boxoffice_core::environment::Clock;
use boxoffice_core::store::{StoreTransaction, TicketStore};
use boxoffice_core::types::ScanTransition;
use boxoffice_core::{AuditSink, Credential, RedeemError, RedeemOutcome, ScanAttempt, ScanContext};
use std::sync::Arc;
use std::time::Instant;

/// Classifies scans and redeems valid tickets exactly once.
#[derive(Clone)]
pub struct RedemptionMachine {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl RedemptionMachine {
    /// Creates a new `RedemptionMachine`
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, clock, audit }
    }

    /// Classifies a presented credential and records the attempt.
    ///
    /// `Accepted`, `AlreadyRedeemed` and `Unknown` are all normal outcomes. An empty or
    /// malformed credential is `Unknown`. The presented text and device description are
    /// bounded before they reach the audit log, so client input alone cannot fail a scan.
    ///
    /// # Errors
    ///
    /// - [`RedeemError::LockTimeout`]: the ticket lock was not granted in time; nothing
    ///   was recorded and the scan may be retried
    /// - [`RedeemError::Storage`]: database failure
    pub async fn redeem(
        &self,
        presented: &str,
        context: ScanContext,
    ) -> Result<RedeemOutcome, RedeemError> {
        let started = Instant::now();
        let result = self.try_redeem(presented, context).await;
        let elapsed = started.elapsed();

        match &result {
            Ok((outcome, attempt)) => {
                tracing::info!(
                    attempt_id = %attempt.id,
                    ticket_id = ?attempt.ticket_id,
                    outcome = %attempt.outcome,
                    elapsed_ms = elapsed.as_millis(),
                    "Scan recorded"
                );
                RedemptionMetrics::record(outcome.classification().as_str(), elapsed);
                self.audit.scan_recorded(attempt);
            }
            Err(error) => {
                if error.is_retryable() {
                    tracing::warn!(error = %error, "Redemption hit lock timeout");
                    LockMetrics::record_timeout("redeem");
                } else {
                    tracing::error!(error = %error, "Redemption failed");
                }
            }
        }

        result.map(|(outcome, _)| outcome)
    }

    /// Runs a redemption inside a caller-supplied transaction.
    ///
    /// Returns the outcome together with the scan attempt written to `tx`. Neither is
    /// visible to other callers until the transaction commits.
    ///
    /// # Errors
    ///
    /// Same as [`redeem`](Self::redeem).
    pub async fn redeem_in(
        &self,
        tx: &mut dyn StoreTransaction,
        presented: &str,
        context: ScanContext,
    ) -> Result<(RedeemOutcome, ScanAttempt), RedeemError> {
        let now = self.clock.now();

        let locked = match Credential::parse(presented) {
            Some(credential) => tx.lock_ticket_by_credential(&credential).await?,
            None => None,
        };

        let (outcome, ticket_id) = match locked {
            None => (RedeemOutcome::Unknown, None),
            Some(locked) => match locked.ticket.state.scan() {
                ScanTransition::Redeem => {
                    tx.mark_redeemed(locked.ticket.id, now).await?;
                    (
                        RedeemOutcome::Accepted {
                            event_title: locked.event_title,
                            category_name: locked.category_name,
                        },
                        Some(locked.ticket.id),
                    )
                }
                ScanTransition::AlreadyRedeemed => {
                    (RedeemOutcome::AlreadyRedeemed, Some(locked.ticket.id))
                }
            },
        };

        let attempt =
            ScanAttempt::record(presented, ticket_id, outcome.classification(), now, context);
        tx.append_scan_attempt(&attempt).await?;

        Ok((outcome, attempt))
    }

    async fn try_redeem(
        &self,
        presented: &str,
        context: ScanContext,
    ) -> Result<(RedeemOutcome, ScanAttempt), RedeemError> {
        let mut tx = self.store.begin().await?;
        match self.redeem_in(tx.as_mut(), presented, context).await {
            Ok(recorded) => {
                tx.commit().await?;
                Ok(recorded)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(
                        error = %rollback_error,
                        "Rollback after failed redemption failed"
                    );
                }
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for RedemptionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedemptionMachine").finish_non_exhaustive()
    }
}
