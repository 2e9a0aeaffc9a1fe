//! Verification of attestations against membership trust anchors.

use crate::{AttestationError, Certificate};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use iin_types::{
    signed_payload, Attestation, AttestedMembership, AttestedMembershipSet, Member, MemberType,
    Membership,
};
use std::collections::HashSet;

/// Stateless validator for attestations and attestation sets.
///
/// Holds no shared state beyond an optional pinned clock, so a single value
/// can be used concurrently by any number of protocol runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttestationValidator {
    pinned_now: Option<DateTime<Utc>>,
}

impl AttestationValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A validator that evaluates certificate validity at a fixed instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            pinned_now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.pinned_now.unwrap_or_else(Utc::now)
    }

    /// Returns whether `attestation` is a valid signature over
    /// `payload ‖ nonce` by a member anchored in `record`.
    pub fn verify(
        &self,
        attestation: &Attestation,
        nonce: &str,
        payload: &str,
        record: &Membership,
    ) -> bool {
        self.check(attestation, nonce, payload, record).is_ok()
    }

    /// Like [`verify`](Self::verify), but reports why verification failed.
    pub fn check(
        &self,
        attestation: &Attestation,
        nonce: &str,
        payload: &str,
        record: &Membership,
    ) -> Result<(), AttestationError> {
        let identity = attestation
            .unit_identity
            .as_ref()
            .ok_or(AttestationError::MissingIdentity)?;

        if attestation.nonce != nonce {
            return Err(AttestationError::NonceMismatch {
                member: identity.member_id.clone(),
                expected: nonce.to_string(),
                actual: attestation.nonce.clone(),
            });
        }

        let certificate = Certificate::from_pem(&attestation.certificate)?;
        let signature = BASE64
            .decode(attestation.signature.trim())
            .map_err(|e| AttestationError::MalformedSignature(e.to_string()))?;
        certificate.verify_signature(&signed_payload(payload, nonce), &signature)?;

        let now = self.now();
        certificate.check_validity(now)?;

        let anchor = record
            .members
            .get(&identity.member_id)
            .ok_or_else(|| AttestationError::NoTrustAnchor(identity.member_id.clone()))?;
        verify_anchor(&certificate, &identity.member_id, anchor, now)
    }

    /// Verifies every attestation over `membership_blob` and returns the
    /// decoded membership record they attest.
    ///
    /// Each attester must belong to the attested security domain and appear
    /// at most once. The first failure short-circuits.
    pub fn validate_set(
        &self,
        attestations: &[Attestation],
        membership_blob: &str,
        nonce: &str,
    ) -> Result<Membership, AttestationError> {
        if attestations.is_empty() {
            return Err(AttestationError::EmptySet);
        }
        let record = Membership::decode(membership_blob)?;

        let mut seen = HashSet::new();
        for attestation in attestations {
            let identity = attestation
                .unit_identity
                .as_ref()
                .ok_or(AttestationError::MissingIdentity)?;
            if identity.security_domain != record.security_domain {
                return Err(AttestationError::DomainMismatch {
                    member: identity.member_id.clone(),
                    expected: record.security_domain.clone(),
                    actual: identity.security_domain.clone(),
                });
            }
            if !seen.insert(identity.member_id.as_str()) {
                return Err(AttestationError::DuplicateAttester(identity.member_id.clone()));
            }
            self.check(attestation, nonce, membership_blob, &record)
                .map_err(|source| AttestationError::InvalidAttestation {
                    member: identity.member_id.clone(),
                    source: Box::new(source),
                })?;
        }
        Ok(record)
    }

    /// Builds an [`AttestedMembershipSet`] from every foreign responder's
    /// claim, requiring byte-identical membership blobs across responders.
    pub fn assemble_set(
        &self,
        responses: &[AttestedMembership],
        nonce: &str,
    ) -> Result<AttestedMembershipSet, AttestationError> {
        let first = responses.first().ok_or(AttestationError::EmptySet)?;

        let mut attestations = Vec::with_capacity(responses.len());
        for response in responses {
            let attestation = response
                .attestation
                .as_ref()
                .ok_or_else(|| AttestationError::MissingAttestation("<unidentified>".to_string()))?;
            if response.membership != first.membership {
                return Err(AttestationError::MembershipMismatch {
                    member: attestation.member_id().unwrap_or("<unidentified>").to_string(),
                });
            }
            attestations.push(attestation.clone());
        }

        self.validate_set(&attestations, &first.membership, nonce)?;
        Ok(AttestedMembershipSet {
            membership: first.membership.clone(),
            attestations,
        })
    }
}

/// Walks from the attester certificate up to the member's recorded anchor.
///
/// A `Ca` anchor must have issued the attester directly. A `Certificate`
/// anchor lists its chain root first; each entry may be a PEM bundle, and the
/// attester may be the last link itself or be issued by it.
fn verify_anchor(
    certificate: &Certificate,
    member_id: &str,
    anchor: &Member,
    now: DateTime<Utc>,
) -> Result<(), AttestationError> {
    match anchor.member_type {
        MemberType::Ca => {
            let ca = Certificate::from_pem(&anchor.value)?;
            certificate.verify_issued_by(&ca, now)
        }
        MemberType::Certificate => {
            let mut chain = Vec::new();
            for pem in &anchor.chain {
                chain.extend(Certificate::chain_from_pem(pem)?);
            }
            let (root, links) = chain
                .split_first()
                .ok_or_else(|| AttestationError::NoTrustAnchor(member_id.to_string()))?;

            if !root.is_self_issued() {
                return Err(AttestationError::BrokenChain {
                    subject: root.subject().to_string(),
                    reason: "chain root is not self-issued".to_string(),
                });
            }
            root.check_validity(now)?;
            root.verify_issued_by(root, now)?;

            let mut signer = root;
            for link in links {
                link.verify_issued_by(signer, now)?;
                signer = link;
            }

            if signer == certificate {
                Ok(())
            } else {
                certificate.verify_issued_by(signer, now)
            }
        }
    }
}
