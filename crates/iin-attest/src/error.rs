//! Error types for certificate handling and attestation validation.

use iin_types::CodecError;
use thiserror::Error;

/// Errors raised while parsing certificates or validating attestations.
///
/// Variants fall into two families: cryptographic failures (bad PEM, bad
/// signature, expired or unanchored certificates) and mismatches between
/// responders (different nonce, membership blob, or security domain). Use
/// [`AttestationError::is_mismatch`] to tell them apart.
#[derive(Debug, Error)]
pub enum AttestationError {
    /// The PEM block or X.509 document could not be parsed.
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    /// A certificate could not be issued.
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    /// The signature is not base64 or has the wrong length.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The public key inside a certificate is unusable.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// The signature does not verify against the signer's certificate.
    #[error("signature does not verify against certificate of {subject}")]
    BadSignature { subject: String },

    /// A certificate is expired or not yet valid.
    #[error("certificate {subject} is outside its validity window")]
    OutsideValidity { subject: String },

    /// A link in the certificate chain does not verify.
    #[error("certificate chain broken at {subject}: {reason}")]
    BrokenChain { subject: String, reason: String },

    /// The membership record has no trust anchor for this member.
    #[error("no trust anchor recorded for member {0}")]
    NoTrustAnchor(String),

    /// The attestation does not name its signer.
    #[error("attestation has no unit identity")]
    MissingIdentity,

    /// An attestation response carried no attestation at all.
    #[error("response from {0} carries no attestation")]
    MissingAttestation(String),

    /// No attestations were supplied for a set.
    #[error("attestation set is empty")]
    EmptySet,

    /// The attestation was produced for a different run.
    #[error("nonce mismatch from {member}: expected {expected}, got {actual}")]
    NonceMismatch {
        member: String,
        expected: String,
        actual: String,
    },

    /// A responder attested a different membership blob than its peers.
    #[error("received different membership from {member}")]
    MembershipMismatch { member: String },

    /// An attester does not belong to the domain whose membership it signed.
    #[error("attester {member} belongs to {actual}, expected {expected}")]
    DomainMismatch {
        member: String,
        expected: String,
        actual: String,
    },

    /// The same member attested twice within one set.
    #[error("duplicate attestation from {0}")]
    DuplicateAttester(String),

    /// A single attestation failed verification.
    #[error("attestation from {member} invalid: {source}")]
    InvalidAttestation {
        member: String,
        #[source]
        source: Box<AttestationError>,
    },

    /// A blob could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl AttestationError {
    /// Whether this failure is a divergence between responders rather than a
    /// cryptographic failure.
    pub fn is_mismatch(&self) -> bool {
        match self {
            Self::NonceMismatch { .. }
            | Self::MembershipMismatch { .. }
            | Self::DomainMismatch { .. }
            | Self::DuplicateAttester(_) => true,
            Self::InvalidAttestation { source, .. } => source.is_mismatch(),
            _ => false,
        }
    }

    /// The member the failure is attributed to, when known.
    pub fn member(&self) -> Option<&str> {
        match self {
            Self::NoTrustAnchor(member)
            | Self::MissingAttestation(member)
            | Self::DuplicateAttester(member) => Some(member),
            Self::NonceMismatch { member, .. }
            | Self::MembershipMismatch { member }
            | Self::DomainMismatch { member, .. }
            | Self::InvalidAttestation { member, .. } => Some(member),
            _ => None,
        }
    }
}
