//! Outbound agent RPCs as JSON over HTTP.

use async_trait::async_trait;
use iin_protocol::{AgentTransport, TransportError};
use iin_types::{
    Ack, AttestedMembership, CounterAttestedMembership, SecurityDomainDns,
    SecurityDomainMemberIdentity, SecurityDomainMemberIdentityRequest,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Path prefix every agent serves its RPCs under.
pub const RPC_PREFIX: &str = "/iin/v1";

#[derive(Debug, Error)]
pub enum TransportSetupError {
    #[error("failed to read CA certificate {path}: {source}")]
    CaRead {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid CA certificate {path}: {source}")]
    CaParse {
        path: String,
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Resolves peers through the security-domain DNS and POSTs to
/// `{endpoint}/iin/v1/{Rpc}`.
#[derive(Debug, Clone)]
pub struct HttpAgentTransport {
    client: reqwest::Client,
    dns: SecurityDomainDns,
}

impl HttpAgentTransport {
    /// Builds a client with `timeout` per request. CA certificates named by
    /// any DNS entry are added as extra trust roots.
    pub fn new(dns: SecurityDomainDns, timeout: Duration) -> Result<Self, TransportSetupError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("iin-agent/", env!("CARGO_PKG_VERSION")));

        for domain in dns.domains() {
            for member in dns.members(domain) {
                let identity = SecurityDomainMemberIdentity::new(domain, member);
                let Some(path) = dns
                    .endpoint(&identity)
                    .and_then(|e| e.tls_ca_cert_path.as_deref())
                else {
                    continue;
                };
                let pem = std::fs::read(path).map_err(|source| TransportSetupError::CaRead {
                    path: path.to_string(),
                    source,
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|source| {
                    TransportSetupError::CaParse {
                        path: path.to_string(),
                        source,
                    }
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(Self::with_client(builder.build()?, dns))
    }

    /// Uses a preconfigured client as is.
    pub fn with_client(client: reqwest::Client, dns: SecurityDomainDns) -> Self {
        Self { client, dns }
    }

    fn url(&self, target: &SecurityDomainMemberIdentity, rpc: &str) -> Result<String, TransportError> {
        let endpoint = self
            .dns
            .endpoint(target)
            .ok_or_else(|| TransportError::UnknownPeer(target.clone()))?;
        Ok(format!("{}{RPC_PREFIX}/{rpc}", endpoint.base_url()))
    }

    async fn call<B: Serialize + Sync>(
        &self,
        target: &SecurityDomainMemberIdentity,
        rpc: &str,
        body: &B,
    ) -> Result<(), TransportError> {
        let url = self.url(target, rpc)?;
        let unreachable = |reason: String| TransportError::Unreachable {
            peer: target.clone(),
            reason,
        };

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let status = resp.status();
        let ack: Ack = resp
            .json()
            .await
            .map_err(|e| unreachable(format!("unreadable {rpc} response ({status}): {e}")))?;

        if !ack.is_ok() {
            return Err(TransportError::Rejected {
                peer: target.clone(),
                message: ack.message,
            });
        }
        tracing::trace!(peer = %target, rpc, request_id = %ack.request_id, "rpc acknowledged");
        Ok(())
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn request_identity_configuration(
        &self,
        target: &SecurityDomainMemberIdentity,
        request: &SecurityDomainMemberIdentityRequest,
    ) -> Result<(), TransportError> {
        self.call(target, "RequestIdentityConfiguration", request).await
    }

    async fn send_identity_configuration(
        &self,
        target: &SecurityDomainMemberIdentity,
        attested: &AttestedMembership,
    ) -> Result<(), TransportError> {
        self.call(target, "SendIdentityConfiguration", attested).await
    }

    async fn request_attestation(
        &self,
        target: &SecurityDomainMemberIdentity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError> {
        self.call(target, "RequestAttestation", counter_attested).await
    }

    async fn send_attestation(
        &self,
        target: &SecurityDomainMemberIdentity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError> {
        self.call(target, "SendAttestation", counter_attested).await
    }
}
