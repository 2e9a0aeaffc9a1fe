use crate::RunPhase;
use iin_types::SecurityDomainMemberIdentity;

/// Milestones and failures of protocol runs, published on the agent's
/// broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Every foreign agent answered and the attested set validated.
    ForeignGatherCompleted {
        nonce: String,
        security_domain: String,
    },
    /// This agent counter-attested a set on behalf of a local peer.
    CounterAttestationSent {
        nonce: String,
        requester: SecurityDomainMemberIdentity,
    },
    /// The counter-attested membership was written to the local ledger.
    MembershipRecorded {
        nonce: String,
        security_domain: String,
    },
    /// The run ended without a record. `phase` is where it stopped.
    RunFailed {
        nonce: String,
        phase: RunPhase,
        reason: String,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn nonce(&self) -> &str {
        match self {
            Self::ForeignGatherCompleted { nonce, .. }
            | Self::CounterAttestationSent { nonce, .. }
            | Self::MembershipRecorded { nonce, .. }
            | Self::RunFailed { nonce, .. } => nonce,
        }
    }
}
