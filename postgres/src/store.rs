//! [`TicketStore`] over `PostgreSQL` row locks.
//!
//! Each transaction runs at READ COMMITTED with `SET LOCAL lock_timeout`. Locks are
//! taken with `SELECT ... FOR UPDATE` in one statement and the derived counts are read
//! in the next: a fresh statement snapshot is what makes tickets committed by the
//! previous lock holder visible.

use crate::rows::{self, classify, is_unique_violation};
use boxoffice_core::catalog::{NewCategory, NewEvent};
use boxoffice_core::store::{CatalogFuture, StoreFuture, StoreTransaction, TicketStore};
use boxoffice_core::{
    CatalogError, Category, CategoryId, CategoryQuota, Credential, DateTime, Event, EventId,
    EventQuota, LockedTicket, Order, OrderId, ScanAttempt, StoreError, Ticket, TicketId, Utc,
    storable_text,
};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const TICKET_COLUMNS: &str = "t.id, t.order_id, t.category_id, t.event_id, t.price_cents, \
     t.state, t.credential, t.created_at, t.redeemed_at";

/// `PostgreSQL`-backed ticket store.
///
/// # Example
///
/// ```no_run
/// use boxoffice_postgres::PostgresTicketStore;
/// use std::time::Duration;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresTicketStore::new(pool, Duration::from_millis(2000));
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresTicketStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresTicketStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn insert_category(&self, category: NewCategory) -> Result<Category, CatalogError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let event_row = sqlx::query(
            "SELECT id, title, capacity, starts_at, ends_at FROM events WHERE id = $1 FOR SHARE",
        )
        .bind(category.event_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?
        .ok_or(CatalogError::UnknownEvent(category.event_id))?;
        let event = rows::event(&event_row)?;

        let category = category.into_category(&event)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO categories (id, event_id, name, price_cents, capacity)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(category.id.as_uuid())
        .bind(category.event_id.as_uuid())
        .bind(&category.name)
        .bind(rows::money_param(category.price)?)
        .bind(rows::capacity_param(category.capacity)?)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CatalogError::DuplicateCategory {
                    event_id: category.event_id,
                    name: category.name,
                });
            }
            Err(e) => return Err(classify(e).into()),
        }

        tx.commit().await.map_err(classify)?;
        tracing::debug!(
            category_id = %category.id,
            event_id = %category.event_id,
            "Category created"
        );
        Ok(category)
    }
}

impl TicketStore for PostgresTicketStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(classify)?;

            // SET cannot take bind parameters; the value is an integer we produced.
            let statement = format!(
                "SET LOCAL lock_timeout = '{}ms'",
                self.lock_timeout.as_millis()
            );
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;

            Ok(Box::new(PostgresTransaction { tx }) as Box<dyn StoreTransaction>)
        })
    }

    fn create_event(&self, event: NewEvent) -> CatalogFuture<'_, Event> {
        Box::pin(async move {
            let event = event.into_event()?;

            sqlx::query(
                r"
                INSERT INTO events (id, title, capacity, starts_at, ends_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(event.id.as_uuid())
            .bind(&event.title)
            .bind(rows::capacity_param(event.capacity)?)
            .bind(event.starts_at)
            .bind(event.ends_at)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

            tracing::debug!(event_id = %event.id, capacity = %event.capacity, "Event created");
            Ok(event)
        })
    }

    fn create_category(&self, category: NewCategory) -> CatalogFuture<'_, Category> {
        Box::pin(self.insert_category(category))
    }

    fn load_categories<'a>(&'a self, ids: &'a [CategoryId]) -> StoreFuture<'a, Vec<Category>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            let records = sqlx::query(
                r"
                SELECT id, event_id, name, price_cents, capacity
                FROM categories
                WHERE id = ANY($1)
                ORDER BY id
                ",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

            records.iter().map(rows::category).collect()
        })
    }

    fn category_remaining(&self, id: CategoryId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT c.capacity,
                       (SELECT COUNT(*) FROM tickets t WHERE t.category_id = c.id) AS consumed
                FROM categories c
                WHERE c.id = $1
                ",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

            row.map(|row| remaining(&row)).transpose()
        })
    }

    fn event_remaining(&self, id: EventId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT e.capacity,
                       (SELECT COUNT(*) FROM tickets t WHERE t.event_id = e.id) AS consumed
                FROM events e
                WHERE e.id = $1
                ",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

            row.map(|row| remaining(&row)).transpose()
        })
    }

    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn ticket_by_credential<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.credential = $1"
            ))
            .bind(credential.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn tickets_in_category(&self, id: CategoryId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let records = sqlx::query(&format!(
                r"
                SELECT {TICKET_COLUMNS} FROM tickets t
                WHERE t.category_id = $1
                ORDER BY t.issued_seq
                "
            ))
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

            records.iter().map(rows::ticket).collect()
        })
    }

    fn order(&self, id: OrderId) -> StoreFuture<'_, Option<Order>> {
        Box::pin(async move {
            let Some(header) = sqlx::query(
                "SELECT id, owner_id, status, total_cents, created_at FROM orders WHERE id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            else {
                return Ok(None);
            };

            let mut order = rows::order(&header)?;
            let tickets = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.order_id = $1 ORDER BY t.issued_seq"
            ))
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

            order.tickets = tickets.iter().map(rows::ticket).collect::<Result<_, _>>()?;
            Ok(Some(order))
        })
    }

    fn scan_attempts<'a>(&'a self, presented: &'a str) -> StoreFuture<'a, Vec<ScanAttempt>> {
        Box::pin(async move {
            let records = sqlx::query(
                r"
                SELECT id, presented, ticket_id, outcome, scanned_at, scanner_id, device
                FROM scan_attempts
                WHERE presented = $1
                ORDER BY scan_seq
                ",
            )
            .bind(storable_text(presented))
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

            records.iter().map(rows::scan_attempt).collect()
        })
    }
}

fn remaining(row: &sqlx::postgres::PgRow) -> Result<u32, StoreError> {
    let capacity: i32 = row.try_get("capacity").map_err(classify)?;
    Ok(rows::to_capacity(capacity, "capacity")?
        .value()
        .saturating_sub(consumed(row)?))
}

fn consumed(row: &sqlx::postgres::PgRow) -> Result<u32, StoreError> {
    rows::to_count(row.try_get("consumed").map_err(classify)?, "consumed")
}

/// A READ COMMITTED transaction holding row locks until commit or rollback.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl StoreTransaction for PostgresTransaction {
    fn lock_categories<'a>(
        &'a mut self,
        ids: &'a [CategoryId],
    ) -> StoreFuture<'a, Vec<CategoryQuota>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

            sqlx::query("SELECT id FROM categories WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(&ids)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(classify)?;

            let records = sqlx::query(
                r"
                SELECT c.id, c.event_id, c.name, c.price_cents, c.capacity,
                       (SELECT COUNT(*) FROM tickets t WHERE t.category_id = c.id) AS consumed
                FROM categories c
                WHERE c.id = ANY($1)
                ORDER BY c.id
                ",
            )
            .bind(&ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(classify)?;

            records
                .iter()
                .map(|row| -> Result<CategoryQuota, StoreError> {
                    Ok(CategoryQuota {
                        category: rows::category(row)?,
                        consumed: consumed(row)?,
                    })
                })
                .collect()
        })
    }

    fn lock_events<'a>(&'a mut self, ids: &'a [EventId]) -> StoreFuture<'a, Vec<EventQuota>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

            sqlx::query("SELECT id FROM events WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(&ids)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(classify)?;

            let records = sqlx::query(
                r"
                SELECT e.id, e.title, e.capacity, e.starts_at, e.ends_at,
                       (SELECT COUNT(*) FROM tickets t WHERE t.event_id = e.id) AS consumed
                FROM events e
                WHERE e.id = ANY($1)
                ORDER BY e.id
                ",
            )
            .bind(&ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(classify)?;

            records
                .iter()
                .map(|row| -> Result<EventQuota, StoreError> {
                    Ok(EventQuota {
                        event: rows::event(row)?,
                        consumed: consumed(row)?,
                    })
                })
                .collect()
        })
    }

    fn insert_order<'a>(&'a mut self, order: &'a Order) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO orders (id, owner_id, status, total_cents, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.owner.as_uuid())
            .bind(order.status.as_str())
            .bind(rows::money_param(order.total)?)
            .bind(order.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
            Ok(())
        })
    }

    fn insert_ticket<'a>(&'a mut self, ticket: &'a Ticket) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            // DO NOTHING keeps the transaction alive on a credential clash.
            let result = sqlx::query(
                r"
                INSERT INTO tickets (
                    id, order_id, category_id, event_id, price_cents,
                    state, credential, created_at, redeemed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (credential) DO NOTHING
                ",
            )
            .bind(ticket.id.as_uuid())
            .bind(ticket.order_id.as_uuid())
            .bind(ticket.category_id.as_uuid())
            .bind(ticket.event_id.as_uuid())
            .bind(rows::money_param(ticket.price)?)
            .bind(ticket.state.as_str())
            .bind(ticket.credential.as_str())
            .bind(ticket.created_at)
            .bind(ticket.redeemed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::CredentialCollision(ticket.credential.clone()));
            }
            Ok(())
        })
    }

    fn lock_ticket_by_credential<'a>(
        &'a mut self,
        credential: &'a Credential,
    ) -> StoreFuture<'a, Option<LockedTicket>> {
        Box::pin(async move {
            // FOR UPDATE re-reads the locked ticket row at its latest committed version.
            let row = sqlx::query(&format!(
                r"
                SELECT {TICKET_COLUMNS}, e.title AS event_title, c.name AS category_name
                FROM tickets t
                JOIN events e ON e.id = t.event_id
                JOIN categories c ON c.id = t.category_id
                WHERE t.credential = $1
                FOR UPDATE OF t
                "
            ))
            .bind(credential.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?;

            row.map(|row| -> Result<LockedTicket, StoreError> {
                Ok(LockedTicket {
                    ticket: rows::ticket(&row)?,
                    event_title: row.try_get("event_title").map_err(classify)?,
                    category_name: row.try_get("category_name").map_err(classify)?,
                })
            })
            .transpose()
        })
    }

    fn mark_redeemed(&mut self, id: TicketId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE tickets SET state = 'redeemed', redeemed_at = $2
                WHERE id = $1 AND state = 'valid'
                ",
            )
            .bind(id.as_uuid())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("valid ticket {id}")));
            }
            Ok(())
        })
    }

    fn append_scan_attempt<'a>(&'a mut self, attempt: &'a ScanAttempt) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO scan_attempts (
                    id, presented, ticket_id, outcome, scanned_at, scanner_id, device
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(attempt.id.as_uuid())
            .bind(&attempt.presented)
            .bind(attempt.ticket_id.map(|id| *id.as_uuid()))
            .bind(attempt.outcome.as_str())
            .bind(attempt.scanned_at)
            .bind(attempt.context.scanner.map(|id| *id.as_uuid()))
            .bind(&attempt.context.device)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move { self.tx.commit().await.map_err(classify) })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move { self.tx.rollback().await.map_err(classify) })
    }
}
