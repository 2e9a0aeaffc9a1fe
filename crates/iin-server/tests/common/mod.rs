#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use iin_attest::{AttestationSigner, CertificateParams, IssuedCertificate};
use iin_db::{create_pool, DbPool, DbRuntimeSettings};
use iin_protocol::{AgentConfig, IinAgent, RunEvent};
use iin_server::{app, ledger::SqliteLedgerGateway, transport::HttpAgentTransport, AppState};
use iin_types::{AgentEndpoint, Member, Membership, SecurityDomainDns, SecurityDomainMemberIdentity};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub type Identity = SecurityDomainMemberIdentity;

pub fn id(domain: &str, member: &str) -> Identity {
    Identity::new(domain, member)
}

/// Key material for one agent, anchored by its own CA.
pub struct Credentials {
    pub ca: IssuedCertificate,
    pub key: SigningKey,
    pub certificate: IssuedCertificate,
}

impl Credentials {
    pub fn issue(member: &str) -> Self {
        let ca_key = SigningKey::generate(&mut OsRng);
        let ca = CertificateParams::new(format!("{member} CA"))
            .ca()
            .self_signed(&ca_key)
            .unwrap();
        let key = SigningKey::generate(&mut OsRng);
        let certificate = CertificateParams::new(format!("iin-agent.{member}"))
            .signed_by(&key, &ca, &ca_key)
            .unwrap();
        Self {
            ca,
            key,
            certificate,
        }
    }

    pub fn signer(&self, identity: Identity) -> AttestationSigner {
        AttestationSigner::new(identity, self.key.clone(), self.certificate.to_pem())
    }
}

/// A migrated, file-backed pool under `dir`.
pub fn file_pool(dir: &TempDir, name: &str) -> DbPool {
    let path = dir.path().join(format!("{name}.db"));
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    iin_db::run_migrations(&pool.get().unwrap()).unwrap();
    pool
}

/// HTTP client that never goes through a system proxy.
pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub struct TestAgent {
    pub agent: IinAgent,
    pub pool: DbPool,
    pub base_url: String,
}

/// Agents served over real HTTP on loopback ports, sharing one DNS map.
pub struct Cluster {
    pub agents: HashMap<Identity, TestAgent>,
    _dir: TempDir,
}

impl Cluster {
    pub async fn start(domains: &[(&str, &[&str])]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut dns = SecurityDomainDns::new();
        let mut memberships = HashMap::new();
        let mut pending = Vec::new();

        for (domain, members) in domains {
            let mut membership = Membership::new(*domain);
            for member in *members {
                let creds = Credentials::issue(member);
                membership = membership.with_member(*member, Member::ca(creds.ca.to_pem()));
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let identity = id(domain, member);
                dns.insert(&identity, AgentEndpoint::new(addr.to_string()));
                pending.push((identity, creds, listener));
            }
            memberships.insert(domain.to_string(), membership);
        }

        let mut agents = HashMap::new();
        for (identity, creds, listener) in pending {
            let pool = file_pool(&dir, &format!("{}-{}", identity.security_domain, identity.member_id));
            iin_db::store_local_membership(
                &pool.get().unwrap(),
                &memberships[&identity.security_domain],
            )
            .unwrap();

            let ledger = SqliteLedgerGateway::new(pool.clone(), creds.signer(identity.clone()));
            let transport = HttpAgentTransport::with_client(direct_client(), dns.clone());
            let agent = IinAgent::new(
                AgentConfig::new(identity.clone(), dns.clone()),
                Arc::new(ledger),
                Arc::new(transport),
            );

            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let router = app(AppState {
                pool: pool.clone(),
                agent: agent.clone(),
            });
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });

            agents.insert(
                identity,
                TestAgent {
                    agent,
                    pool,
                    base_url,
                },
            );
        }

        Self { agents, _dir: dir }
    }

    pub fn get(&self, domain: &str, member: &str) -> &TestAgent {
        &self.agents[&id(domain, member)]
    }

    /// Waits until no agent holds an active run.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.agents.values().any(|a| a.agent.active_runs() > 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runs did not settle");
    }
}

/// Next event matching `pred`, skipping others.
pub async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<RunEvent>,
    pred: impl Fn(&RunEvent) -> bool,
) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
