//! Ticketing service: one entry point wiring store, engines, audit and rendering.
//!
//! The service owns no state of its own. Every call goes straight to the store seam, so
//! remaining capacities and ticket states are read fresh each time.
//!
//! # Lifecycle of an order
//!
//! ```text
//! allocate ──► AllocationEngine (locks, checks, commit) ──► Order
//!                     │ LockTimeout: back off and retry
//!                     ▼
//!             spawn render_all(tickets)     (after commit, no locks held)
//! ```

use crate::config::{Config, ConfigError, StoreKind};
use crate::render::{QrPayloadRenderer, RenderedTicket, TicketRenderer, render_all};
use boxoffice_core::catalog::{NewCategory, NewEvent};
use boxoffice_core::environment::{Clock, SystemClock};
use boxoffice_core::{
    AllocationError, AuditSink, Category, CatalogError, CategoryId, Credential,
    CredentialGenerator, Event, FanoutAuditSink, EventId, Order, OrderId, OwnerId, RedeemError, RedeemOutcome,
    ScanAttempt, ScanContext, Sha256CredentialGenerator, StoreError, Ticket, TicketId,
    TicketStore,
};
use boxoffice_postgres::PostgresTicketStore;
use boxoffice_runtime::{
    AllocationConfig, AllocationEngine, RedemptionMachine, RetryPolicy, TracingAuditSink,
    retry_with_predicate,
};
use boxoffice_testing::InMemoryTicketStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database connection failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store setup (migrations) failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Facade over allocation, redemption and read accessors.
#[derive(Clone)]
pub struct TicketingService {
    store: Arc<dyn TicketStore>,
    engine: AllocationEngine,
    machine: RedemptionMachine,
    renderer: Arc<dyn TicketRenderer>,
    retry: RetryPolicy,
}

impl TicketingService {
    /// Start building a service over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn TicketStore>) -> TicketingServiceBuilder {
        TicketingServiceBuilder::new(store)
    }

    /// Build a service from configuration, connecting to the configured store.
    ///
    /// For `postgres` this opens a pool and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the database is unreachable, or
    /// migrations fail.
    pub async fn from_config(config: &Config) -> Result<Self, AppError> {
        config.validate()?;

        let store: Arc<dyn TicketStore> = match config.store {
            StoreKind::Memory => {
                tracing::info!("Using in-memory ticket store");
                Arc::new(InMemoryTicketStore::with_lock_timeout(config.lock_timeout()))
            }
            StoreKind::Postgres => {
                tracing::info!(
                    max_connections = config.postgres.max_connections,
                    "Connecting to PostgreSQL"
                );
                let pool = PgPoolOptions::new()
                    .max_connections(config.postgres.max_connections)
                    .min_connections(config.postgres.min_connections)
                    .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
                    .connect(&config.postgres.url)
                    .await?;

                let store = PostgresTicketStore::new(pool, config.lock_timeout());
                tracing::info!("Running database migrations...");
                store.migrate().await?;
                Arc::new(store)
            }
        };

        Ok(Self::builder(store)
            .allocation_config(config.allocation_config())
            .retry_policy(config.retry_policy())
            .build())
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    /// Allocate one ticket per entry of `request`, retrying lock timeouts.
    ///
    /// Committed tickets are handed to the renderer on a background task.
    ///
    /// # Errors
    ///
    /// Returns the engine's error once it is not retryable or retries are exhausted.
    pub async fn allocate(
        &self,
        owner: OwnerId,
        request: &[CategoryId],
    ) -> Result<Order, AllocationError> {
        let order = retry_with_predicate(
            &self.retry,
            || self.engine.allocate(owner, request),
            AllocationError::is_retryable,
        )
        .await?;

        let renderer = Arc::clone(&self.renderer);
        let tickets = order.tickets.clone();
        tokio::spawn(async move {
            render_all(renderer.as_ref(), &tickets).await;
        });

        Ok(order)
    }

    /// Classify a scan, retrying lock timeouts.
    ///
    /// Accepts either a bare credential or a full QR payload.
    ///
    /// # Errors
    ///
    /// Returns error only for storage faults or exhausted lock retries; `Unknown` and
    /// `AlreadyRedeemed` are outcomes.
    pub async fn redeem(
        &self,
        scanned: &str,
        context: ScanContext,
    ) -> Result<RedeemOutcome, RedeemError> {
        let presented = QrPayloadRenderer::credential_from_payload(scanned);

        retry_with_predicate(
            &self.retry,
            || self.machine.redeem(presented, context.clone()),
            RedeemError::is_retryable,
        )
        .await
    }

    /// Render an order's tickets now, e.g. to re-send them to the holder.
    pub async fn render_order(&self, order: &Order) -> Vec<RenderedTicket> {
        render_all(self.renderer.as_ref(), &order.tickets).await
    }

    /// Create an event.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if validation or storage fails.
    pub async fn create_event(&self, event: NewEvent) -> Result<Event, CatalogError> {
        self.store.create_event(event).await
    }

    /// Create a category within an existing event.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if validation or storage fails.
    pub async fn create_category(&self, category: NewCategory) -> Result<Category, CatalogError> {
        self.store.create_category(category).await
    }

    /// Remaining capacity of a category.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn category_remaining(&self, id: CategoryId) -> Result<Option<u32>, StoreError> {
        self.store.category_remaining(id).await
    }

    /// Remaining capacity of an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn event_remaining(&self, id: EventId) -> Result<Option<u32>, StoreError> {
        self.store.event_remaining(id).await
    }

    /// Ticket by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        self.store.ticket(id).await
    }

    /// Ticket by presented credential. Strings that are not credentials find nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn ticket_by_credential(
        &self,
        presented: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        match Credential::parse(presented) {
            Some(credential) => self.store.ticket_by_credential(&credential).await,
            None => Ok(None),
        }
    }

    /// Order with its tickets.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.store.order(id).await
    }

    /// Tickets issued in a category.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn tickets_in_category(&self, id: CategoryId) -> Result<Vec<Ticket>, StoreError> {
        self.store.tickets_in_category(id).await
    }

    /// Audit trail for a presented credential, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    pub async fn scan_attempts(&self, presented: &str) -> Result<Vec<ScanAttempt>, StoreError> {
        self.store.scan_attempts(presented).await
    }
}

impl std::fmt::Debug for TicketingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketingService")
            .field("engine", &self.engine)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TicketingService`].
///
/// Defaults: SHA-256 credentials, system clock, `tracing` audit sink, QR payload
/// renderer, default allocation limits and retry policy. Sinks added with
/// [`audit`](Self::audit) are notified after the `tracing` sink.
pub struct TicketingServiceBuilder {
    store: Arc<dyn TicketStore>,
    credentials: Arc<dyn CredentialGenerator>,
    clock: Arc<dyn Clock>,
    audit: Vec<Arc<dyn AuditSink>>,
    renderer: Arc<dyn TicketRenderer>,
    allocation: AllocationConfig,
    retry: RetryPolicy,
}

impl TicketingServiceBuilder {
    fn new(store: Arc<dyn TicketStore>) -> Self {
        Self {
            store,
            credentials: Arc::new(Sha256CredentialGenerator),
            clock: Arc::new(SystemClock),
            audit: vec![Arc::new(TracingAuditSink)],
            renderer: Arc::new(QrPayloadRenderer),
            allocation: AllocationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the credential generator.
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialGenerator>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add an audit sink.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit.push(audit);
        self
    }

    /// Set the ticket renderer.
    #[must_use]
    pub fn renderer(mut self, renderer: Arc<dyn TicketRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Set allocation limits.
    #[must_use]
    pub fn allocation_config(mut self, allocation: AllocationConfig) -> Self {
        self.allocation = allocation;
        self
    }

    /// Set the lock-timeout retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the service.
    #[must_use]
    pub fn build(self) -> TicketingService {
        let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(self.audit));
        let engine = AllocationEngine::new(
            Arc::clone(&self.store),
            self.credentials,
            Arc::clone(&self.clock),
            Arc::clone(&audit),
            self.allocation,
        );
        let machine = RedemptionMachine::new(Arc::clone(&self.store), self.clock, audit);

        TicketingService {
            store: self.store,
            engine,
            machine,
            renderer: self.renderer,
            retry: self.retry,
        }
    }
}
