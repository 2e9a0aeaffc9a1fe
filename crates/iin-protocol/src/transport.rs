//! Contract for agent-to-agent calls.
//!
//! Every call is one-way: the peer acknowledges receipt and delivers its
//! answer later through a separate outbound call of its own. A peer that
//! answers with a non-OK ack is reported as [`TransportError::Rejected`].

use crate::TransportError;
use async_trait::async_trait;
use iin_types::{
    AttestedMembership, CounterAttestedMembership, SecurityDomainMemberIdentity,
    SecurityDomainMemberIdentityRequest,
};

/// Outbound half of the four agent RPCs.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Asks a foreign agent for its attested membership.
    async fn request_identity_configuration(
        &self,
        target: &SecurityDomainMemberIdentity,
        request: &SecurityDomainMemberIdentityRequest,
    ) -> Result<(), TransportError>;

    /// Returns a claim, or an error response, to the foreign initiator.
    async fn send_identity_configuration(
        &self,
        target: &SecurityDomainMemberIdentity,
        attested: &AttestedMembership,
    ) -> Result<(), TransportError>;

    /// Asks a local peer to counter-attest a gathered set.
    async fn request_attestation(
        &self,
        target: &SecurityDomainMemberIdentity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError>;

    async fn send_attestation(
        &self,
        target: &SecurityDomainMemberIdentity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError>;
}
