//! X.509 certificates used as IIN agent and CA credentials.
//!
//! Member trust anchors and attester certificates are ordinary PEM-encoded
//! X.509 documents. Parsing goes through `rustls-pki-types`, chain checks
//! (issuer/subject linkage, the CA basic constraint, validity windows and
//! issuer signatures) through `x509-parser`. Attestations themselves are
//! Ed25519 signatures, so an attester certificate must carry an Ed25519
//! subject key; CA certificates above it may use any algorithm
//! `x509-parser` can verify.
//!
//! [`CertificateParams`] issues Ed25519 certificates with `rcgen` for
//! provisioning agents and for tests.

use crate::AttestationError;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::oid_registry::OID_SIG_ED25519;

/// Default validity for issued certificates.
const DEFAULT_VALIDITY_DAYS: i64 = 365;

fn malformed(err: impl std::fmt::Display) -> AttestationError {
    AttestationError::MalformedCertificate(err.to_string())
}

/// A parsed X.509 certificate.
///
/// The DER encoding is kept alongside the fields the validator needs, so a
/// value can be compared, cloned and re-parsed for signature checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
    subject: String,
    issuer: String,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    /// Epoch seconds.
    not_before: i64,
    /// Epoch seconds.
    not_after: i64,
    is_ca: bool,
}

impl Certificate {
    /// Parses the first `CERTIFICATE` block of `pem`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::MalformedCertificate`] if `pem` holds no
    /// certificate block or the block is not valid X.509.
    pub fn from_pem(pem: &str) -> Result<Self, AttestationError> {
        let der = CertificateDer::from_pem_slice(pem.as_bytes()).map_err(malformed)?;
        Self::from_der(der)
    }

    /// Parses every `CERTIFICATE` block of `pem`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::MalformedCertificate`] if any block fails
    /// to parse or there is none at all.
    pub fn chain_from_pem(pem: &str) -> Result<Vec<Self>, AttestationError> {
        let chain = CertificateDer::pem_slice_iter(pem.as_bytes())
            .map(|der| der.map_err(malformed).and_then(Self::from_der))
            .collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(malformed("no CERTIFICATE block found"));
        }
        Ok(chain)
    }

    /// Parses a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::MalformedCertificate`] if `der` is not a
    /// well-formed X.509 certificate.
    pub fn from_der(der: CertificateDer<'static>) -> Result<Self, AttestationError> {
        let (subject, issuer, subject_raw, issuer_raw, not_before, not_after, is_ca) = {
            let (rest, x509) = x509_parser::parse_x509_certificate(der.as_ref()).map_err(malformed)?;
            if !rest.is_empty() {
                return Err(malformed("trailing bytes after certificate"));
            }
            let is_ca = x509
                .basic_constraints()
                .map_err(malformed)?
                .is_some_and(|ext| ext.value.ca);
            let validity = x509.validity();
            (
                x509.subject().to_string(),
                x509.issuer().to_string(),
                x509.subject().as_raw().to_vec(),
                x509.issuer().as_raw().to_vec(),
                validity.not_before.timestamp(),
                validity.not_after.timestamp(),
                is_ca,
            )
        };
        Ok(Self {
            der,
            subject,
            issuer,
            subject_raw,
            issuer_raw,
            not_before,
            not_after,
            is_ca,
        })
    }

    fn parsed(&self) -> Result<X509Certificate<'_>, AttestationError> {
        x509_parser::parse_x509_certificate(self.der.as_ref())
            .map(|(_, x509)| x509)
            .map_err(malformed)
    }

    /// Subject distinguished name, e.g. `CN=Org1 CA`.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject_raw == self.issuer_raw
    }

    pub fn der(&self) -> &[u8] {
        self.der.as_ref()
    }

    /// SHA-256 over the DER encoding, hex-encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.der.as_ref()))
    }

    /// The subject's Ed25519 public key.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::InvalidKey`] if the certificate carries a
    /// key of another algorithm or an unusable Ed25519 key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, AttestationError> {
        let x509 = self.parsed()?;
        let spki = x509.public_key();
        if spki.algorithm.algorithm != OID_SIG_ED25519 {
            return Err(AttestationError::InvalidKey(format!(
                "certificate {} does not carry an Ed25519 key",
                self.subject
            )));
        }
        let bytes = <[u8; 32]>::try_from(&*spki.subject_public_key.data)
            .map_err(|_| AttestationError::InvalidKey("public key must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| AttestationError::InvalidKey(e.to_string()))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let ts = now.timestamp();
        self.not_before <= ts && ts <= self.not_after
    }

    /// Checks that this certificate's validity window contains `now`.
    pub fn check_validity(&self, now: DateTime<Utc>) -> Result<(), AttestationError> {
        if self.is_valid_at(now) {
            Ok(())
        } else {
            Err(AttestationError::OutsideValidity {
                subject: self.subject.clone(),
            })
        }
    }

    /// Verifies an Ed25519 `signature` over `message` with this
    /// certificate's key.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<(), AttestationError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| AttestationError::MalformedSignature(e.to_string()))?;
        self.verifying_key()?
            .verify(message, &signature)
            .map_err(|_| AttestationError::BadSignature {
                subject: self.subject.clone(),
            })
    }

    /// Checks that `issuer` signed this certificate and was entitled to.
    ///
    /// The issuer's subject must equal this certificate's issuer name, the
    /// issuer must be a CA within its own validity window at `now`, and the
    /// X.509 signature must verify under the issuer's key.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::BrokenChain`] for a name, CA or signature
    /// failure and [`AttestationError::OutsideValidity`] for an issuer used
    /// outside its validity window.
    pub fn verify_issued_by(
        &self,
        issuer: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<(), AttestationError> {
        let broken = |reason: &str| AttestationError::BrokenChain {
            subject: self.subject.clone(),
            reason: reason.to_string(),
        };

        if self.issuer_raw != issuer.subject_raw {
            return Err(broken(&format!(
                "issuer '{}' does not match signer subject '{}'",
                self.issuer, issuer.subject
            )));
        }
        if !issuer.is_ca {
            return Err(broken("signer is not a CA"));
        }
        issuer.check_validity(now)?;

        let child = self.parsed()?;
        let parent = issuer.parsed()?;
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|_| broken("signature does not verify under signer key"))
    }
}

/// Exposes an Ed25519 signing key to `rcgen` without exporting it.
struct DalekKeyPair {
    public: [u8; 32],
    key: SigningKey,
}

impl rcgen::RemoteKeyPair for DalekKeyPair {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Ok(self.key.sign(msg).to_bytes().to_vec())
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

fn issuance(err: impl std::fmt::Display) -> AttestationError {
    AttestationError::Issuance(err.to_string())
}

fn key_pair(key: &SigningKey) -> Result<rcgen::KeyPair, AttestationError> {
    rcgen::KeyPair::from_remote(Box::new(DalekKeyPair {
        public: key.verifying_key().to_bytes(),
        key: key.clone(),
    }))
    .map_err(issuance)
}

fn offset_date_time(at: DateTime<Utc>) -> Result<time::OffsetDateTime, AttestationError> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(issuance)
}

/// A freshly issued certificate, able to sign further certificates.
pub struct IssuedCertificate {
    inner: rcgen::Certificate,
    parsed: Certificate,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("subject", &self.parsed.subject())
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    fn new(inner: rcgen::Certificate) -> Result<Self, AttestationError> {
        let parsed = Certificate::from_der(inner.der().clone())?;
        Ok(Self { inner, parsed })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.parsed
    }

    /// The certificate as a `CERTIFICATE` PEM block.
    pub fn to_pem(&self) -> String {
        self.inner.pem()
    }
}

/// Parameters for issuing an Ed25519 certificate.
#[derive(Debug, Clone)]
pub struct CertificateParams {
    common_name: String,
    is_ca: bool,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateParams {
    /// A leaf certificate for `common_name`, valid from now for a year.
    pub fn new(common_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            common_name: common_name.into(),
            is_ca: false,
            not_before: now - Duration::minutes(1),
            not_after: now + Duration::days(DEFAULT_VALIDITY_DAYS),
        }
    }

    pub fn ca(mut self) -> Self {
        self.is_ca = true;
        self
    }

    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    fn to_rcgen(&self) -> Result<rcgen::CertificateParams, AttestationError> {
        let mut params = rcgen::CertificateParams::default();
        let mut name = rcgen::DistinguishedName::new();
        name.push(rcgen::DnType::CommonName, self.common_name.as_str());
        params.distinguished_name = name;
        params.not_before = offset_date_time(self.not_before)?;
        params.not_after = offset_date_time(self.not_after)?;
        if self.is_ca {
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.key_usages = vec![
                rcgen::KeyUsagePurpose::KeyCertSign,
                rcgen::KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            params.is_ca = rcgen::IsCa::NoCa;
            params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        }
        Ok(params)
    }

    /// Issues a self-signed certificate for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::Issuance`] if `rcgen` rejects the
    /// parameters.
    pub fn self_signed(self, key: &SigningKey) -> Result<IssuedCertificate, AttestationError> {
        let key_pair = key_pair(key)?;
        let certificate = self.to_rcgen()?.self_signed(&key_pair).map_err(issuance)?;
        IssuedCertificate::new(certificate)
    }

    /// Issues a certificate for `subject_key`, signed by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::Issuance`] if `rcgen` rejects the
    /// parameters.
    pub fn signed_by(
        self,
        subject_key: &SigningKey,
        issuer: &IssuedCertificate,
        issuer_key: &SigningKey,
    ) -> Result<IssuedCertificate, AttestationError> {
        let subject = key_pair(subject_key)?;
        let issuer_pair = key_pair(issuer_key)?;
        let certificate = self
            .to_rcgen()?
            .signed_by(&subject, &issuer.inner, &issuer_pair)
            .map_err(issuance)?;
        IssuedCertificate::new(certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn issued_certificate_parses_as_standard_pem() {
        let key = SigningKey::generate(&mut OsRng);
        let issued = CertificateParams::new("Org1 CA").ca().self_signed(&key).unwrap();
        let pem = issued.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let cert = Certificate::from_pem(&pem).unwrap();
        assert_eq!(&cert, issued.certificate());
        assert_eq!(cert.subject(), "CN=Org1 CA");
        assert!(cert.is_ca());
        assert!(cert.is_self_issued());
        assert_eq!(cert.verifying_key().unwrap(), key.verifying_key());
    }

    #[test]
    fn chain_from_pem_reads_every_block() {
        let root_key = SigningKey::generate(&mut OsRng);
        let root = CertificateParams::new("Root CA").ca().self_signed(&root_key).unwrap();
        let inter_key = SigningKey::generate(&mut OsRng);
        let inter = CertificateParams::new("Intermediate CA")
            .ca()
            .signed_by(&inter_key, &root, &root_key)
            .unwrap();

        let bundle = format!("{}{}", root.to_pem(), inter.to_pem());
        let chain = Certificate::chain_from_pem(&bundle).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].issuer(), "CN=Root CA");
    }

    #[test]
    fn from_pem_rejects_non_certificates() {
        let err = Certificate::from_pem("not a certificate").unwrap_err();
        assert!(matches!(err, AttestationError::MalformedCertificate(_)));
        let err = Certificate::chain_from_pem("").unwrap_err();
        assert!(matches!(err, AttestationError::MalformedCertificate(_)));
    }

    #[test]
    fn leaf_verifies_against_its_issuer_only() {
        let ca_key = SigningKey::generate(&mut OsRng);
        let ca = CertificateParams::new("Org1 CA").ca().self_signed(&ca_key).unwrap();
        let other_key = SigningKey::generate(&mut OsRng);
        let other_ca = CertificateParams::new("Org1 CA").ca().self_signed(&other_key).unwrap();

        let leaf_key = SigningKey::generate(&mut OsRng);
        let leaf = CertificateParams::new("agent.org1")
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let now = Utc::now();
        leaf.certificate()
            .verify_issued_by(ca.certificate(), now)
            .unwrap();
        // Same subject name, different key.
        assert!(matches!(
            leaf.certificate().verify_issued_by(other_ca.certificate(), now),
            Err(AttestationError::BrokenChain { .. })
        ));
    }

    #[test]
    fn non_ca_cannot_issue() {
        let key = SigningKey::generate(&mut OsRng);
        let not_ca = CertificateParams::new("plain").self_signed(&key).unwrap();
        let leaf_key = SigningKey::generate(&mut OsRng);
        let leaf = CertificateParams::new("leaf")
            .signed_by(&leaf_key, &not_ca, &key)
            .unwrap();
        let err = leaf
            .certificate()
            .verify_issued_by(not_ca.certificate(), Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("not a CA"));
    }

    #[test]
    fn validity_window_is_inclusive() {
        let key = SigningKey::generate(&mut OsRng);
        let start = Utc::now();
        let end = start + Duration::hours(1);
        let issued = CertificateParams::new("short-lived")
            .validity(start, end)
            .self_signed(&key)
            .unwrap();
        let cert = issued.certificate();
        assert!(cert.is_valid_at(start));
        assert!(cert.is_valid_at(end));
        assert!(!cert.is_valid_at(end + Duration::seconds(1)));
        assert!(!cert.is_valid_at(start - Duration::seconds(1)));
    }
}
