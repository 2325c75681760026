//! Row decoding and integer conversions between SQL columns and domain types.

use boxoffice_core::{
    Capacity, Category, CategoryId, Credential, Event, EventId, Money, Order, OrderId,
    OrderStatus, OwnerId, ScanAttempt, ScanAttemptId, ScanContext, ScanOutcome, StoreError,
    Ticket, TicketId, TicketState,
};
use sqlx::Row;
use sqlx::postgres::PgRow;

/// Maps a sqlx error to the store taxonomy.
///
/// Lock-not-available (`55P03`), deadlock (`40P01`) and serialization failures (`40001`)
/// all mean the transaction wrote nothing and may be retried.
pub(crate) fn classify(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(db.code().as_deref(), Some("55P03" | "40P01" | "40001")) {
            return StoreError::LockTimeout;
        }
    }
    StoreError::Database(error.to_string())
}

/// Whether the error is a unique-constraint violation (`23505`).
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn decode(column: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("column {column}: {error}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| decode(column, e))
}

pub(crate) fn to_capacity(value: i32, column: &str) -> Result<Capacity, StoreError> {
    u32::try_from(value)
        .map(Capacity::new)
        .map_err(|e| decode(column, e))
}

pub(crate) fn to_money(value: i64, column: &str) -> Result<Money, StoreError> {
    u64::try_from(value)
        .map(Money::from_cents)
        .map_err(|e| decode(column, e))
}

pub(crate) fn to_count(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| decode(column, e))
}

pub(crate) fn capacity_param(capacity: Capacity) -> Result<i32, StoreError> {
    i32::try_from(capacity.value()).map_err(|e| decode("capacity", e))
}

pub(crate) fn money_param(money: Money) -> Result<i64, StoreError> {
    i64::try_from(money.cents()).map_err(|e| decode("price_cents", e))
}

pub(crate) fn event(row: &PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: EventId::from_uuid(get(row, "id")?),
        title: get(row, "title")?,
        capacity: to_capacity(get(row, "capacity")?, "capacity")?,
        starts_at: get(row, "starts_at")?,
        ends_at: get(row, "ends_at")?,
    })
}

pub(crate) fn category(row: &PgRow) -> Result<Category, StoreError> {
    Ok(Category {
        id: CategoryId::from_uuid(get(row, "id")?),
        event_id: EventId::from_uuid(get(row, "event_id")?),
        name: get(row, "name")?,
        price: to_money(get(row, "price_cents")?, "price_cents")?,
        capacity: to_capacity(get(row, "capacity")?, "capacity")?,
    })
}

pub(crate) fn ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    let state: String = get(row, "state")?;
    let credential: String = get(row, "credential")?;

    Ok(Ticket {
        id: TicketId::from_uuid(get(row, "id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        category_id: CategoryId::from_uuid(get(row, "category_id")?),
        event_id: EventId::from_uuid(get(row, "event_id")?),
        price: to_money(get(row, "price_cents")?, "price_cents")?,
        state: TicketState::parse(&state).ok_or_else(|| decode("state", state.as_str()))?,
        credential: Credential::parse(&credential)
            .ok_or_else(|| decode("credential", "not a 64-character hex credential"))?,
        created_at: get(row, "created_at")?,
        redeemed_at: get(row, "redeemed_at")?,
    })
}

/// Order header; tickets are loaded separately.
pub(crate) fn order(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = get(row, "status")?;

    Ok(Order {
        id: OrderId::from_uuid(get(row, "id")?),
        owner: OwnerId::from_uuid(get(row, "owner_id")?),
        status: OrderStatus::parse(&status).ok_or_else(|| decode("status", status.as_str()))?,
        total: to_money(get(row, "total_cents")?, "total_cents")?,
        created_at: get(row, "created_at")?,
        tickets: Vec::new(),
    })
}

pub(crate) fn scan_attempt(row: &PgRow) -> Result<ScanAttempt, StoreError> {
    let outcome: String = get(row, "outcome")?;
    let ticket_id: Option<uuid::Uuid> = get(row, "ticket_id")?;
    let scanner: Option<uuid::Uuid> = get(row, "scanner_id")?;

    Ok(ScanAttempt {
        id: ScanAttemptId::from_uuid(get(row, "id")?),
        presented: get(row, "presented")?,
        ticket_id: ticket_id.map(TicketId::from_uuid),
        outcome: ScanOutcome::parse(&outcome).ok_or_else(|| decode("outcome", outcome.as_str()))?,
        scanned_at: get(row, "scanned_at")?,
        context: ScanContext {
            scanner: scanner.map(OwnerId::from_uuid),
            device: get(row, "device")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_columns_are_rejected() {
        assert!(to_capacity(-1, "capacity").is_err());
        assert!(to_money(-5, "price_cents").is_err());
        assert!(to_count(-1, "consumed").is_err());
    }

    #[test]
    fn test_params_round_trip() {
        assert_eq!(capacity_param(Capacity::new(20)), Ok(20));
        assert_eq!(money_param(Money::from_cents(7000)), Ok(7000));
        assert!(capacity_param(Capacity::new(u32::MAX)).is_err());
    }

    #[test]
    fn test_plain_errors_are_database_errors() {
        assert!(matches!(classify(sqlx::Error::RowNotFound), StoreError::Database(_)));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
