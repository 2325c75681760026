//! Ticketing System Demo
//!
//! Walks through the guarantees of the ticketing core:
//! - Last tickets of a category under concurrent demand
//! - Mixed orders bounded by the tightest category and the event pool
//! - One-shot redemption with an audited scan log
//!
//! # Usage
//!
//! ```bash
//! # In-memory store
//! cargo run --bin demo
//!
//! # Against PostgreSQL
//! TICKETING_STORE=postgres DATABASE_URL=postgres://localhost/boxoffice cargo run --bin demo
//! ```

use anyhow::Context;
use boxoffice_core::catalog::{NewCategory, NewEvent};
use boxoffice_core::{
    AllocationError, Capacity, Category, CategoryId, Event, Money, Order, OwnerId, ScanContext,
};
use boxoffice_runtime::metrics::MetricsServer;
use chrono::{Duration, Utc};
use ticketing::{Config, QrPayloadRenderer, TicketingService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    // Initialize tracing (RUST_LOG, defaulting to info,ticketing=debug,sqlx=warn)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.server.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("\n🎫 ============================================");
    println!("   Ticketing System - Live Demo");
    println!("============================================\n");

    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start()?;

    println!("⚙️  Initializing service ({:?} store)...", config.store);
    let service = TicketingService::from_config(&config).await?;
    println!("✓ Service ready\n");

    last_tickets(&service).await?;
    mixed_orders(&service).await?;
    gate_scans(&service).await?;

    if let Some(rendered) = metrics.render() {
        println!("📈 Metrics snapshot:");
        for line in rendered.lines().filter(|l| !l.starts_with('#')) {
            println!("   {line}");
        }
    }

    println!("\n✓ Demo complete\n");
    Ok(())
}

async fn seed(
    service: &TicketingService,
    title: &str,
    event_capacity: u32,
    categories: &[(&str, u64, u32)],
) -> anyhow::Result<(Event, Vec<Category>)> {
    let starts_at = Utc::now() + Duration::days(30);
    let event = service
        .create_event(NewEvent {
            title: title.to_string(),
            capacity: Capacity::new(event_capacity),
            starts_at,
            ends_at: starts_at + Duration::hours(4),
        })
        .await
        .with_context(|| format!("creating event '{title}'"))?;

    let mut created = Vec::with_capacity(categories.len());
    for &(name, price_cents, capacity) in categories {
        let category = service
            .create_category(NewCategory {
                event_id: event.id,
                name: name.to_string(),
                price: Money::from_cents(price_cents),
                capacity: Capacity::new(capacity),
            })
            .await
            .with_context(|| format!("creating category '{name}'"))?;
        created.push(category);
    }

    Ok((event, created))
}

async fn race(
    service: &TicketingService,
    requests: usize,
    request: &[CategoryId],
) -> anyhow::Result<Vec<Result<Order, AllocationError>>> {
    let mut handles = Vec::with_capacity(requests);
    for _ in 0..requests {
        let service = service.clone();
        let request = request.to_vec();
        handles.push(tokio::spawn(async move {
            service.allocate(OwnerId::new(), &request).await
        }));
    }

    let mut results = Vec::with_capacity(requests);
    for handle in handles {
        results.push(handle.await.context("allocation task panicked")?);
    }
    Ok(results)
}

fn summarize(results: &[Result<Order, AllocationError>]) {
    let allocated = results.iter().filter(|r| r.is_ok()).count();
    println!("   ✓ Allocated: {allocated}");
    for error in results.iter().filter_map(|r| r.as_ref().err()) {
        println!("   ✗ Rejected: {error}");
    }
}

async fn last_tickets(service: &TicketingService) -> anyhow::Result<()> {
    println!("📋 Scenario 1: Last three tickets, six buyers");

    let (_, categories) = seed(service, "Club Night", 30, &[("General", 1000, 3)]).await?;
    let general = categories[0].id;

    let results = race(service, 6, &[general]).await?;
    summarize(&results);

    let remaining = service.category_remaining(general).await?.unwrap_or_default();
    let issued = service.tickets_in_category(general).await?.len();
    println!("   Remaining: {remaining}, tickets issued: {issued}\n");
    Ok(())
}

async fn mixed_orders(service: &TicketingService) -> anyhow::Result<()> {
    println!("📋 Scenario 2: Ten orders of 2 × Standard + 1 × VIP");

    let (event, categories) = seed(
        service,
        "Symphony Gala",
        20,
        &[("Standard", 1000, 15), ("VIP", 5000, 5)],
    )
    .await?;
    let (standard, vip) = (categories[0].id, categories[1].id);

    let results = race(service, 10, &[standard, standard, vip]).await?;
    summarize(&results);

    for order in results.iter().filter_map(|r| r.as_ref().ok()) {
        println!("   Order {} total {}", order.id, order.total);
    }

    println!(
        "   Remaining: Standard {}, VIP {}, event {}\n",
        service.category_remaining(standard).await?.unwrap_or_default(),
        service.category_remaining(vip).await?.unwrap_or_default(),
        service.event_remaining(event.id).await?.unwrap_or_default(),
    );
    Ok(())
}

async fn gate_scans(service: &TicketingService) -> anyhow::Result<()> {
    println!("📋 Scenario 3: Scanning one ticket twice");

    let (_, categories) = seed(service, "Open Air", 100, &[("Lawn", 2500, 100)]).await?;
    let order = service.allocate(OwnerId::new(), &[categories[0].id]).await?;
    let ticket = order
        .tickets
        .first()
        .context("order carries no tickets")?;
    let payload = QrPayloadRenderer::payload(ticket);
    println!("   QR payload: {payload}");

    for gate in ["gate-north", "gate-south"] {
        let outcome = service
            .redeem(&payload, ScanContext::new(None, gate))
            .await?;
        println!("   {gate}: {outcome:?}");
    }

    let forged = "0".repeat(64);
    let outcome = service
        .redeem(&forged, ScanContext::new(None, "gate-north"))
        .await?;
    println!("   forged credential: {outcome:?}");

    let attempts = service.scan_attempts(ticket.credential.as_str()).await?;
    println!("   Audit log for ticket {}:", ticket.id);
    for attempt in attempts {
        println!(
            "     {} {} at {}",
            attempt.context.device,
            attempt.outcome.as_str(),
            attempt.scanned_at
        );
    }
    println!();
    Ok(())
}
