//! Contract for the ledger connector that signs for and persists on behalf
//! of the local agent.

use crate::LedgerError;
use async_trait::async_trait;
use iin_types::{AttestedMembership, CounterAttestedMembership, Membership};

/// Ledger-side operations an agent needs. Every method may block on the
/// ledger, so implementations are async.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// The local domain's membership blob, attested by this agent for `nonce`.
    async fn get_attested_membership(
        &self,
        security_domain: &str,
        nonce: &str,
    ) -> Result<AttestedMembership, LedgerError>;

    /// A bundle holding exactly one attestation by this agent over
    /// `set_blob ‖ nonce`.
    async fn counter_attest_membership(
        &self,
        set_blob: &str,
        security_domain: &str,
        nonce: &str,
    ) -> Result<CounterAttestedMembership, LedgerError>;

    /// Create-or-update of the foreign domain's membership, keyed by its id.
    ///
    /// Only ever called with an error-free bundle carrying a full local
    /// quorum. Returns an opaque receipt for logging.
    ///
    /// # Errors
    ///
    /// `LedgerError::Rejected` when the ledger refuses the bundle, and
    /// `LedgerError::Storage` or `LedgerError::Unavailable` when it cannot
    /// be written.
    async fn record_membership_in_ledger(
        &self,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<String, LedgerError>;

    /// Trust anchors of the local domain, used to check peer counter-attestations.
    async fn get_local_membership(&self) -> Result<Membership, LedgerError>;
}
