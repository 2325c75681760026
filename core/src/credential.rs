//! Redemption credentials.
//!
//! A credential is the opaque token printed on a ticket (as a QR payload) and presented
//! at the gate. It is 64 lower-case hex characters: a SHA-256 digest over the ticket id,
//! the order id, a nanosecond timestamp and 32 bytes of randomness. Without the random
//! input a third party cannot derive it from the ticket's visible fields.

use crate::types::{OrderId, TicketId};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of an encoded credential in characters.
pub const CREDENTIAL_LEN: usize = 64;

/// A redemption credential (64 lower-case hex characters).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    /// Parses a presented credential.
    ///
    /// Returns `None` if the value is not 64 lower-case hex characters, which means it
    /// cannot have been issued by this system.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let well_formed = value.len() == CREDENTIAL_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(value.to_string()))
    }

    /// Hex-encodes a 32-byte digest into a credential.
    #[must_use]
    pub fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }

    /// Returns the credential as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces redemption credentials for newly issued tickets.
///
/// Implementations must be unpredictable and collision-free within a practical
/// budget. The allocation engine still retries on a detected collision, so a test
/// generator may deliberately repeat values.
pub trait CredentialGenerator: Send + Sync {
    /// Generates a fresh credential for the given ticket.
    fn generate(&self, ticket_id: TicketId, order_id: OrderId) -> Credential;
}

/// Default generator: SHA-256 over ids, timestamp and thread-RNG bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256CredentialGenerator;

impl Sha256CredentialGenerator {
    /// Creates a new generator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CredentialGenerator for Sha256CredentialGenerator {
    fn generate(&self, ticket_id: TicketId, order_id: OrderId) -> Credential {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(ticket_id.as_uuid().as_bytes());
        hasher.update(order_id.as_uuid().as_bytes());
        hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        hasher.update(salt);

        Credential::from_digest(hasher.finalize())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_credential_is_well_formed() {
        let credential = Sha256CredentialGenerator::new().generate(TicketId::new(), OrderId::new());
        assert_eq!(credential.as_str().len(), CREDENTIAL_LEN);
        assert_eq!(Credential::parse(credential.as_str()), Some(credential));
    }

    #[test]
    fn test_same_ids_yield_distinct_credentials() {
        let generator = Sha256CredentialGenerator::new();
        let ticket_id = TicketId::new();
        let order_id = OrderId::new();

        let credentials: HashSet<Credential> = (0..1_000)
            .map(|_| generator.generate(ticket_id, order_id))
            .collect();
        assert_eq!(credentials.len(), 1_000);
    }

    #[test]
    fn test_parse_rejects_malformed_values() {
        assert!(Credential::parse("").is_none());
        assert!(Credential::parse(&"A".repeat(CREDENTIAL_LEN)).is_none());
        assert!(Credential::parse(&"a".repeat(CREDENTIAL_LEN - 1)).is_none());
        assert!(Credential::parse(&"g".repeat(CREDENTIAL_LEN)).is_none());
        assert!(Credential::parse(&"0f".repeat(CREDENTIAL_LEN / 2)).is_some());
    }
}
