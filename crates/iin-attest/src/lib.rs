//! Certificates, signing, and attestation validation for IIN agents.
//!
//! An attestation is an Ed25519 signature over `payload ‖ nonce` made by an
//! agent whose X.509 certificate chains to the trust anchor its security
//! domain records for it. This crate issues and parses those certificates, produces
//! attestations ([`AttestationSigner`]), and verifies them
//! ([`AttestationValidator`]), both one at a time and as a set whose members
//! must all agree on the same membership blob.
//!
//! Everything here is a pure function of its inputs; nothing is cached or
//! shared between calls.

mod certificate;
mod error;
mod signer;
mod validator;

pub use certificate::{Certificate, CertificateParams, IssuedCertificate};
pub use error::AttestationError;
pub use signer::AttestationSigner;
pub use validator::AttestationValidator;
