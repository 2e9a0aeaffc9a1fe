//! In-process agent network: a loopback transport that calls the target
//! agent directly, and a ledger backed by an in-memory signer.

#![allow(dead_code)]

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use iin_attest::{AttestationSigner, CertificateParams};
use iin_protocol::{
    AgentConfig, AgentError, AgentTransport, IinAgent, LedgerError, LedgerGateway, RunEvent,
    TransportError,
};
use iin_types::{
    Ack, AgentEndpoint, AttestedMembership, CounterAttestedMembership, Member, Membership,
    SecurityDomainDns, SecurityDomainMemberIdentity as Identity,
    SecurityDomainMemberIdentityRequest,
};
use rand::rngs::OsRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub from: Identity,
    pub rpc: &'static str,
    pub to: Identity,
}

#[derive(Default)]
pub struct Registry {
    agents: RwLock<HashMap<Identity, IinAgent>>,
    silent: Mutex<HashSet<Identity>>,
    calls: Mutex<Vec<Call>>,
    attestation_requests: Mutex<Vec<(Identity, CounterAttestedMembership)>>,
}

impl Registry {
    /// Calls to `target` are acknowledged but never delivered.
    pub fn silence(&self, target: &Identity) {
        self.silent.lock().unwrap().insert(target.clone());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Counter-attestation requests sent to `target`, delivered or not.
    pub fn attestation_requests(&self, target: &Identity) -> Vec<CounterAttestedMembership> {
        self.attestation_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == target)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn count(&self, from: &Identity, rpc: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| &c.from == from && c.rpc == rpc)
            .count()
    }
}

pub struct LoopbackTransport {
    from: Identity,
    registry: Arc<Registry>,
}

impl LoopbackTransport {
    fn deliver(
        &self,
        rpc: &'static str,
        target: &Identity,
        call: impl FnOnce(&IinAgent) -> Result<Ack, AgentError>,
    ) -> Result<(), TransportError> {
        self.registry.calls.lock().unwrap().push(Call {
            from: self.from.clone(),
            rpc,
            to: target.clone(),
        });
        if self.registry.silent.lock().unwrap().contains(target) {
            return Ok(());
        }
        let agent = self
            .registry
            .agents
            .read()
            .unwrap()
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(target.clone()))?;
        call(&agent).map(|_| ()).map_err(|e| TransportError::Rejected {
            peer: target.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl AgentTransport for LoopbackTransport {
    async fn request_identity_configuration(
        &self,
        target: &Identity,
        request: &SecurityDomainMemberIdentityRequest,
    ) -> Result<(), TransportError> {
        self.deliver("RequestIdentityConfiguration", target, |a| {
            a.request_identity_configuration(request)
        })
    }

    async fn send_identity_configuration(
        &self,
        target: &Identity,
        attested: &AttestedMembership,
    ) -> Result<(), TransportError> {
        self.deliver("SendIdentityConfiguration", target, |a| {
            a.send_identity_configuration(attested)
        })
    }

    async fn request_attestation(
        &self,
        target: &Identity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError> {
        self.registry
            .attestation_requests
            .lock()
            .unwrap()
            .push((target.clone(), counter_attested.clone()));
        self.deliver("RequestAttestation", target, |a| {
            a.request_attestation(counter_attested)
        })
    }

    async fn send_attestation(
        &self,
        target: &Identity,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), TransportError> {
        self.deliver("SendAttestation", target, |a| a.send_attestation(counter_attested))
    }
}

pub struct MockLedger {
    signer: AttestationSigner,
    local: Membership,
    claimed: Mutex<Option<Membership>>,
    unavailable: AtomicBool,
    record_delay: Mutex<Duration>,
    recorded: Mutex<Vec<CounterAttestedMembership>>,
}

impl MockLedger {
    /// Holds every `record_membership_in_ledger` call for `delay`.
    pub fn delay_recording(&self, delay: Duration) {
        *self.record_delay.lock().unwrap() = delay;
    }

    /// Attest `membership` instead of the real local one.
    pub fn claim(&self, membership: Membership) {
        *self.claimed.lock().unwrap() = Some(membership);
    }

    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<CounterAttestedMembership> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerGateway for MockLedger {
    async fn get_attested_membership(
        &self,
        _security_domain: &str,
        nonce: &str,
    ) -> Result<AttestedMembership, LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger unavailable".into()));
        }
        let membership = self
            .claimed
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.local.clone());
        let blob = membership.encode()?;
        Ok(AttestedMembership::new(blob.clone(), self.signer.attest(&blob, nonce)))
    }

    async fn counter_attest_membership(
        &self,
        set_blob: &str,
        _security_domain: &str,
        nonce: &str,
    ) -> Result<CounterAttestedMembership, LedgerError> {
        Ok(CounterAttestedMembership::new(
            set_blob,
            self.signer.attest(set_blob, nonce),
        ))
    }

    async fn record_membership_in_ledger(
        &self,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<String, LedgerError> {
        let delay = *self.record_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut recorded = self.recorded.lock().unwrap();
        recorded.push(counter_attested.clone());
        Ok(format!("record-{}", recorded.len()))
    }

    async fn get_local_membership(&self) -> Result<Membership, LedgerError> {
        Ok(self.local.clone())
    }
}

pub struct Node {
    pub agent: IinAgent,
    pub ledger: Arc<MockLedger>,
}

pub struct Network {
    pub registry: Arc<Registry>,
    nodes: HashMap<Identity, Node>,
}

pub fn id(domain: &str, member: &str) -> Identity {
    Identity::new(domain, member)
}

impl Network {
    /// Builds one agent per member, each with its own CA, all sharing one DNS.
    pub fn build(domains: &[(&str, &[&str])], tune: impl Fn(AgentConfig) -> AgentConfig) -> Self {
        let mut dns = SecurityDomainDns::new();
        let mut agent_keys = Vec::new();
        let mut memberships: HashMap<String, Membership> = HashMap::new();

        for (domain, members) in domains {
            let mut membership = Membership::new(*domain);
            for member in *members {
                let ca_key = SigningKey::generate(&mut OsRng);
                let ca = CertificateParams::new(format!("{member} CA"))
                    .ca()
                    .self_signed(&ca_key)
                    .unwrap();
                let key = SigningKey::generate(&mut OsRng);
                let cert = CertificateParams::new(format!("iin-agent.{member}"))
                    .signed_by(&key, &ca, &ca_key)
                    .unwrap();
                membership = membership.with_member(*member, Member::ca(ca.to_pem()));
                let identity = id(domain, member);
                dns.insert(
                    &identity,
                    AgentEndpoint::new(format!("loopback/{domain}/{member}")),
                );
                agent_keys.push((identity, key, cert.to_pem()));
            }
            memberships.insert(domain.to_string(), membership);
        }

        let registry = Arc::new(Registry::default());
        let mut nodes = HashMap::new();
        for (identity, key, cert) in agent_keys {
            let ledger = Arc::new(MockLedger {
                signer: AttestationSigner::new(identity.clone(), key, cert),
                local: memberships[&identity.security_domain].clone(),
                claimed: Mutex::new(None),
                unavailable: AtomicBool::new(false),
                record_delay: Mutex::new(Duration::ZERO),
                recorded: Mutex::new(Vec::new()),
            });
            let transport = Arc::new(LoopbackTransport {
                from: identity.clone(),
                registry: Arc::clone(&registry),
            });
            let agent = IinAgent::new(
                tune(AgentConfig::new(identity.clone(), dns.clone())),
                ledger.clone(),
                transport,
            );
            registry
                .agents
                .write()
                .unwrap()
                .insert(identity.clone(), agent.clone());
            nodes.insert(identity, Node { agent, ledger });
        }

        Self { registry, nodes }
    }

    pub fn node(&self, domain: &str, member: &str) -> &Node {
        &self.nodes[&id(domain, member)]
    }

    pub fn agent(&self, domain: &str, member: &str) -> &IinAgent {
        &self.node(domain, member).agent
    }

    pub fn ledger(&self, domain: &str, member: &str) -> &MockLedger {
        &self.node(domain, member).ledger
    }

    /// Waits until no agent holds any run.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.nodes.values().any(|n| n.agent.active_runs() > 0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("runs did not settle");
    }
}

/// Receives events until one matches `pred`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<RunEvent>,
    pred: impl Fn(&RunEvent) -> bool,
) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for run event")
}
