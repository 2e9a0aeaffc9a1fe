//! Shared wire types, codecs, and constants for the IIN agent workspace.
//!
//! This crate provides the data model exchanged between IIN agents: member
//! identities, signed attestations, attested and counter-attested membership
//! bundles, the persisted membership record, and the `Ack` returned by every
//! RPC. It also carries the security-domain DNS map used to resolve peers.
//!
//! Every other crate in the workspace builds on these types, and this crate
//! depends on no other workspace crate.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod dns;
mod membership;
mod messages;

pub use dns::{AgentEndpoint, SecurityDomainDns};
pub use membership::{Member, MemberType, Membership};
pub use messages::{
    Attestation, AttestedMembership, AttestedMembershipSet, CounterAttestedMembership,
    SecurityDomainMemberIdentityRequest,
};

/// One organization's IIN agent identity within a security domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDomainMemberIdentity {
    /// The security domain (network) the member belongs to.
    pub security_domain: String,
    /// The organization / member id inside that domain.
    pub member_id: String,
}

impl SecurityDomainMemberIdentity {
    pub fn new(security_domain: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            security_domain: security_domain.into(),
            member_id: member_id.into(),
        }
    }
}

impl fmt::Display for SecurityDomainMemberIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.security_domain, self.member_id)
    }
}

/// Status carried by an [`Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Immediate acknowledgement returned by every agent RPC.
///
/// The acknowledgement only reports whether the request was accepted; the
/// outcome of the protocol run it starts is delivered later through a
/// separate outbound RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
    /// The nonce of the protocol run this request belongs to.
    #[serde(default)]
    pub request_id: String,
}

impl Ack {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ok,
            message: String::new(),
            request_id: request_id.into(),
        }
    }

    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Errors produced while encoding or decoding serialized blobs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("blob is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("blob does not contain a valid document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a document as `base64(JSON(value))`.
///
/// This is the opaque blob form in which memberships and attested
/// membership sets travel and get signed.
pub fn encode_blob<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(BASE64.encode(json))
}

/// Inverse of [`encode_blob`].
pub fn decode_blob<T: DeserializeOwned>(blob: &str) -> Result<T, CodecError> {
    let bytes = BASE64.decode(blob.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Builds the exact byte string an attestation signs: `payload ‖ nonce`.
pub fn signed_payload(payload: &str, nonce: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + nonce.len());
    bytes.extend_from_slice(payload.as_bytes());
    bytes.extend_from_slice(nonce.as_bytes());
    bytes
}
