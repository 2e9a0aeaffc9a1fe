use iin_attest::AttestationError;
use iin_types::{CodecError, SecurityDomainMemberIdentity};
use thiserror::Error;

/// Coarse classification of agent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing request fields.
    Validation,
    /// Signature or certificate chain failure.
    Crypto,
    /// Unknown, duplicate or mismatched nonce; unexpected or surplus response.
    ProtocolState,
    /// Peer unreachable or rejected the call.
    Transport,
    /// The ledger collaborator failed.
    Ledger,
    /// Responders disagree on the membership blob or nonce.
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStoreError {
    #[error("a run with nonce '{0}' is already active")]
    DuplicateNonce(String),

    #[error("no active run with nonce '{0}'")]
    UnknownNonce(String),

    #[error("member '{member}' is not expected to respond in run '{nonce}'")]
    UnexpectedMember { nonce: String, member: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("local membership is not available: {0}")]
    Unavailable(String),

    #[error("counter-attested membership rejected: {0}")]
    Rejected(String),

    #[error("ledger storage failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint configured for {0}")]
    UnknownPeer(SecurityDomainMemberIdentity),

    #[error("request to {peer} failed: {reason}")]
    Unreachable {
        peer: SecurityDomainMemberIdentity,
        reason: String,
    },

    #[error("{peer} rejected the request: {message}")]
    Rejected {
        peer: SecurityDomainMemberIdentity,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    RunStore(#[from] RunStoreError),

    #[error("{0}")]
    ProtocolState(String),

    /// A participant reported a protocol-level error instead of a result.
    #[error("{member} reported: {reason}")]
    Peer { member: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("malformed payload: {0}")]
    Codec(#[from] CodecError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Codec(_) => ErrorKind::Validation,
            Self::Attestation(e) if e.is_mismatch() => ErrorKind::Mismatch,
            Self::Attestation(_) => ErrorKind::Crypto,
            Self::RunStore(_) | Self::ProtocolState(_) | Self::Peer { .. } => {
                ErrorKind::ProtocolState
            }
            Self::Transport(_) => ErrorKind::Transport,
            Self::Ledger(_) => ErrorKind::Ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestation_errors_split_into_crypto_and_mismatch() {
        let crypto = AgentError::from(AttestationError::BadSignature {
            subject: "agent".into(),
        });
        assert_eq!(crypto.kind(), ErrorKind::Crypto);

        let mismatch = AgentError::from(AttestationError::MembershipMismatch {
            member: "Org3MSP".into(),
        });
        assert_eq!(mismatch.kind(), ErrorKind::Mismatch);
    }

    #[test]
    fn run_store_errors_are_protocol_state() {
        let err = AgentError::from(RunStoreError::UnknownNonce("n1".into()));
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }
}
