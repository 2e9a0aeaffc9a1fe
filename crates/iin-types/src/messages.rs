//! Messages exchanged between IIN agents.

use crate::{decode_blob, encode_blob, CodecError, SecurityDomainMemberIdentity};
use serde::{Deserialize, Serialize};

/// A signed claim by one member over `payload ‖ nonce`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// The member that produced the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_identity: Option<SecurityDomainMemberIdentity>,
    /// The signer's certificate (PEM).
    #[serde(default)]
    pub certificate: String,
    /// Signature over `payload ‖ nonce` (base64).
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub nonce: String,
    /// Signing time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl Attestation {
    /// An unsigned attestation that only identifies the sender and run.
    ///
    /// Error responses carry one of these so the receiver can route the
    /// failure to the right run and member.
    pub fn unsigned(unit_identity: SecurityDomainMemberIdentity, nonce: impl Into<String>) -> Self {
        Self {
            unit_identity: Some(unit_identity),
            nonce: nonce.into(),
            ..Self::default()
        }
    }

    pub fn member_id(&self) -> Option<&str> {
        self.unit_identity.as_ref().map(|id| id.member_id.as_str())
    }

    pub fn security_domain(&self) -> Option<&str> {
        self.unit_identity
            .as_ref()
            .map(|id| id.security_domain.as_str())
    }
}

/// One foreign agent's signed membership claim, or the reason it could not
/// produce one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestedMembership {
    /// Serialized membership blob (`base64(JSON(Membership))`).
    #[serde(default)]
    pub membership: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttestedMembership {
    pub fn new(membership: impl Into<String>, attestation: Attestation) -> Self {
        Self {
            membership: membership.into(),
            attestation: Some(attestation),
            error: None,
        }
    }

    /// Protocol-level failure reported by `sender` for the run `nonce`.
    pub fn failure(
        reason: impl Into<String>,
        sender: SecurityDomainMemberIdentity,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            membership: String::new(),
            attestation: Some(Attestation::unsigned(sender, nonce)),
            error: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregate of every foreign agent's claim over one membership blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestedMembershipSet {
    pub membership: String,
    #[serde(default)]
    pub attestations: Vec<Attestation>,
}

impl AttestedMembershipSet {
    /// Serializes the set into the blob local peers counter-sign.
    pub fn encode(&self) -> Result<String, CodecError> {
        encode_blob(self)
    }

    pub fn decode(blob: &str) -> Result<Self, CodecError> {
        decode_blob(blob)
    }
}

/// Local peers' counter-signatures over an attested membership set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterAttestedMembership {
    /// Serialized [`AttestedMembershipSet`].
    #[serde(default)]
    pub attested_membership_set: String,
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CounterAttestedMembership {
    pub fn new(attested_membership_set: impl Into<String>, attestation: Attestation) -> Self {
        Self {
            attested_membership_set: attested_membership_set.into(),
            attestations: vec![attestation],
            error: None,
        }
    }

    /// Protocol-level failure reported by `sender` for the run `nonce`.
    pub fn failure(
        reason: impl Into<String>,
        sender: SecurityDomainMemberIdentity,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            attested_membership_set: String::new(),
            attestations: vec![Attestation::unsigned(sender, nonce)],
            error: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The first attestation, which identifies the sender of the bundle.
    pub fn lead_attestation(&self) -> Option<&Attestation> {
        self.attestations.first()
    }

    pub fn decode_set(&self) -> Result<AttestedMembershipSet, CodecError> {
        AttestedMembershipSet::decode(&self.attested_membership_set)
    }
}

/// Request for a member's attested identity configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDomainMemberIdentityRequest {
    /// The member being asked to attest its domain's membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_network: Option<SecurityDomainMemberIdentity>,
    /// The member the response must be delivered to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requesting_network: Option<SecurityDomainMemberIdentity>,
    #[serde(default)]
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_response_keeps_sender_and_nonce() {
        let sender = SecurityDomainMemberIdentity::new("network2", "Org2MSP");
        let am = AttestedMembership::failure("ledger unavailable", sender.clone(), "n1");
        assert!(am.is_error());
        let att = am.attestation.as_ref().unwrap();
        assert_eq!(att.unit_identity.as_ref(), Some(&sender));
        assert_eq!(att.nonce, "n1");
        assert!(att.certificate.is_empty());
    }

    #[test]
    fn error_field_is_omitted_when_absent() {
        let am = AttestedMembership::new("blob", Attestation::default());
        let json = serde_json::to_value(&am).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["membership"], "blob");
    }

    #[test]
    fn counter_attested_membership_decodes_its_set() {
        let set = AttestedMembershipSet {
            membership: "m".to_string(),
            attestations: vec![Attestation::default()],
        };
        let blob = set.encode().unwrap();
        let cam = CounterAttestedMembership::new(blob, Attestation::default());
        assert_eq!(cam.decode_set().unwrap(), set);
    }

    #[test]
    fn request_uses_camel_case_fields() {
        let req: SecurityDomainMemberIdentityRequest = serde_json::from_value(serde_json::json!({
            "sourceNetwork": { "securityDomain": "network2", "memberId": "Org2MSP" },
            "requestingNetwork": { "securityDomain": "network1", "memberId": "Org1MSP" },
            "nonce": "abc"
        }))
        .unwrap();
        assert_eq!(req.source_network.unwrap().member_id, "Org2MSP");
        assert_eq!(req.requesting_network.unwrap().security_domain, "network1");
    }
}
