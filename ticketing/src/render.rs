//! Post-commit ticket rendering.
//!
//! Renderers turn a committed ticket into something a holder can present at the gate.
//! They run after the allocation transaction has committed and released its locks, so a
//! slow or failing renderer never holds up quota locks, and a failure never takes a
//! ticket back: the ticket is valid whether or not an artifact exists.

use boxoffice_core::{Ticket, TicketId};
use boxoffice_runtime::metrics::RenderMetrics;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Prefix of the payload encoded into a ticket's QR code.
pub const PAYLOAD_PREFIX: &str = "boxoffice:ticket:";

/// Errors from ticket renderers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The renderer could not produce an artifact for this ticket
    #[error("Failed to render ticket {ticket_id}: {reason}")]
    Failed {
        /// Ticket that was not rendered
        ticket_id: TicketId,
        /// Renderer-specific reason
        reason: String,
    },
}

/// A rendered display artifact for one ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedTicket {
    /// Ticket the artifact belongs to
    pub ticket_id: TicketId,
    /// Text encoded into the QR code
    pub payload: String,
}

/// Boxed future returned by [`TicketRenderer::render`].
pub type RenderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RenderedTicket, RenderError>> + Send + 'a>>;

/// Produces a display artifact for a committed ticket.
pub trait TicketRenderer: Send + Sync {
    /// Render one ticket.
    fn render<'a>(&'a self, ticket: &'a Ticket) -> RenderFuture<'a>;
}

/// Builds the scan payload `boxoffice:ticket:<credential>` and logs it.
///
/// Image encoding is left to the client; the payload is everything a scanner needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct QrPayloadRenderer;

impl QrPayloadRenderer {
    /// The payload a scanner reads back.
    #[must_use]
    pub fn payload(ticket: &Ticket) -> String {
        format!("{PAYLOAD_PREFIX}{}", ticket.credential)
    }

    /// Extracts the presented credential from a scanned payload.
    ///
    /// Anything without the prefix is returned as is, so bare credentials typed in by
    /// gate staff still resolve.
    #[must_use]
    pub fn credential_from_payload(scanned: &str) -> &str {
        scanned.strip_prefix(PAYLOAD_PREFIX).unwrap_or(scanned)
    }
}

impl TicketRenderer for QrPayloadRenderer {
    fn render<'a>(&'a self, ticket: &'a Ticket) -> RenderFuture<'a> {
        Box::pin(async move {
            let payload = Self::payload(ticket);
            tracing::debug!(ticket_id = %ticket.id, order_id = %ticket.order_id, "Ticket rendered");
            Ok(RenderedTicket {
                ticket_id: ticket.id,
                payload,
            })
        })
    }
}

/// Renders every ticket of a committed order, logging and counting failures.
///
/// Returns the artifacts that were produced.
pub async fn render_all(renderer: &dyn TicketRenderer, tickets: &[Ticket]) -> Vec<RenderedTicket> {
    let mut rendered = Vec::with_capacity(tickets.len());

    for ticket in tickets {
        match renderer.render(ticket).await {
            Ok(artifact) => rendered.push(artifact),
            Err(e) => {
                RenderMetrics::record_failure();
                tracing::warn!(
                    ticket_id = %ticket.id,
                    error = %e,
                    "Ticket render failed; ticket stays valid"
                );
            }
        }
    }

    rendered
}
