//! Produces attestations on behalf of one IIN agent.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use iin_types::{signed_payload, Attestation, SecurityDomainMemberIdentity};

/// Signs `payload ‖ nonce` with the agent's key and attaches its certificate.
#[derive(Clone)]
pub struct AttestationSigner {
    identity: SecurityDomainMemberIdentity,
    key: SigningKey,
    certificate_pem: String,
}

impl std::fmt::Debug for AttestationSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationSigner")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl AttestationSigner {
    pub fn new(
        identity: SecurityDomainMemberIdentity,
        key: SigningKey,
        certificate_pem: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            key,
            certificate_pem: certificate_pem.into(),
        }
    }

    pub fn identity(&self) -> &SecurityDomainMemberIdentity {
        &self.identity
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Attests `payload` for the run `nonce`, timestamped now.
    pub fn attest(&self, payload: &str, nonce: &str) -> Attestation {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.attest_at(payload, nonce, now_ms)
    }

    /// Attests with an explicit timestamp in epoch milliseconds.
    pub fn attest_at(&self, payload: &str, nonce: &str, timestamp_ms: u64) -> Attestation {
        let signature = self.key.sign(&signed_payload(payload, nonce));
        Attestation {
            unit_identity: Some(self.identity.clone()),
            certificate: self.certificate_pem.clone(),
            signature: BASE64.encode(signature.to_bytes()),
            nonce: nonce.to_string(),
            timestamp: timestamp_ms,
        }
    }
}
