//! Security-domain DNS: where every known IIN agent can be reached.

use crate::SecurityDomainMemberIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Network location of one IIN agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    /// `host:port` or a full URL.
    pub endpoint: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_ca_cert_path: Option<String>,
}

impl AgentEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls: false,
            tls_ca_cert_path: None,
        }
    }

    /// Base URL for RPC calls; adds a scheme when the endpoint has none.
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if self.tls {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        }
    }
}

/// `securityDomain -> memberId -> endpoint`.
///
/// Backed by ordered maps so fan-out and aggregation visit members in a
/// deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityDomainDns(BTreeMap<String, BTreeMap<String, AgentEndpoint>>);

impl SecurityDomainDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: &SecurityDomainMemberIdentity, endpoint: AgentEndpoint) {
        self.0
            .entry(identity.security_domain.clone())
            .or_default()
            .insert(identity.member_id.clone(), endpoint);
    }

    pub fn contains_domain(&self, security_domain: &str) -> bool {
        self.0.contains_key(security_domain)
    }

    /// Member ids configured for `security_domain`, in order.
    pub fn members(&self, security_domain: &str) -> Vec<String> {
        self.0
            .get(security_domain)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn endpoint(&self, identity: &SecurityDomainMemberIdentity) -> Option<&AgentEndpoint> {
        self.0
            .get(&identity.security_domain)
            .and_then(|members| members.get(&identity.member_id))
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
