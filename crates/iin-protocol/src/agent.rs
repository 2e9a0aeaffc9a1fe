//! The IIN agent service: the five RPC operations over shared run state.

use crate::{
    AgentError, AgentTransport, Barrier, ForeignGatherCoordinator, LedgerGateway,
    LocalCounterAttestationCoordinator, MembershipCache, ProtocolRunStore, Requester, RunEvent,
    RunPhase,
};
use iin_attest::AttestationValidator;
use iin_types::{
    Ack, Attestation, AttestedMembership, CounterAttestedMembership, SecurityDomainDns,
    SecurityDomainMemberIdentity, SecurityDomainMemberIdentityRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Static settings of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Who this agent is. Its domain must appear in `dns`.
    pub identity: SecurityDomainMemberIdentity,
    /// Peers of every known security domain, this agent's own included.
    pub dns: SecurityDomainDns,
    /// Maximum age of a cached foreign membership claim.
    pub refresh_time: Duration,
    /// Age after which an unfinished run is swept.
    pub run_timeout: Duration,
}

impl AgentConfig {
    pub const DEFAULT_REFRESH_TIME: Duration = Duration::from_secs(300);
    pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(identity: SecurityDomainMemberIdentity, dns: SecurityDomainDns) -> Self {
        Self {
            identity,
            dns,
            refresh_time: Self::DEFAULT_REFRESH_TIME,
            run_timeout: Self::DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_refresh_time(mut self, refresh_time: Duration) -> Self {
        self.refresh_time = refresh_time;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }
}

/// State shared by the agent and both coordinators.
pub(crate) struct AgentContext {
    pub(crate) config: AgentConfig,
    pub(crate) ledger: Arc<dyn LedgerGateway>,
    pub(crate) transport: Arc<dyn AgentTransport>,
    pub(crate) validator: AttestationValidator,
    pub(crate) foreign_runs: ProtocolRunStore<AttestedMembership, Requester>,
    /// Local runs keep this agent's own counter-attestation as context.
    pub(crate) local_runs: ProtocolRunStore<CounterAttestedMembership, CounterAttestedMembership>,
    pub(crate) cache: MembershipCache,
    events: broadcast::Sender<RunEvent>,
}

impl AgentContext {
    pub(crate) fn identity(&self) -> &SecurityDomainMemberIdentity {
        &self.config.identity
    }

    /// Members of the local domain other than this agent.
    pub(crate) fn local_peers(&self) -> Vec<String> {
        let me = &self.config.identity;
        self.config
            .dns
            .members(&me.security_domain)
            .into_iter()
            .filter(|member| *member != me.member_id)
            .collect()
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn fail(&self, nonce: &str, phase: RunPhase, error: &AgentError) {
        tracing::error!(
            nonce,
            %phase,
            kind = ?error.kind(),
            error = %error,
            "protocol run failed"
        );
        self.emit(RunEvent::RunFailed {
            nonce: nonce.to_string(),
            phase,
            reason: error.to_string(),
        });
    }
}

/// Runs `task` in the background, logging its error if it fails.
pub(crate) fn spawn_logged<F>(task: &'static str, nonce: String, fut: F)
where
    F: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(error) = fut.await {
            tracing::error!(task, nonce = %nonce, kind = ?error.kind(), error = %error, "background task failed");
        }
    });
}

fn require(condition: bool, message: impl FnOnce() -> String) -> Result<(), AgentError> {
    if condition {
        Ok(())
    } else {
        Err(AgentError::Validation(message()))
    }
}

fn sender_of(attestation: Option<&Attestation>) -> Result<(&SecurityDomainMemberIdentity, &str), AgentError> {
    let attestation =
        attestation.ok_or_else(|| AgentError::Validation("missing attestation".to_string()))?;
    let identity = attestation
        .unit_identity
        .as_ref()
        .ok_or_else(|| AgentError::Validation("attestation has no unit identity".to_string()))?;
    require(!attestation.nonce.is_empty(), || {
        "attestation has no nonce".to_string()
    })?;
    Ok((identity, attestation.nonce.as_str()))
}

/// One IIN agent.
///
/// Each RPC validates its request synchronously and returns an [`Ack`]
/// carrying the run nonce; gathering, validation, aggregation and
/// persistence continue in background tasks whose outcomes reach peers
/// through separate outbound calls.
#[derive(Clone)]
pub struct IinAgent {
    ctx: Arc<AgentContext>,
}

impl IinAgent {
    /// Builds an agent with empty run stores and an empty cache. Nothing
    /// runs until an RPC arrives.
    pub fn new(
        config: AgentConfig,
        ledger: Arc<dyn LedgerGateway>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ctx: Arc::new(AgentContext {
                config,
                ledger,
                transport,
                validator: AttestationValidator::new(),
                foreign_runs: ProtocolRunStore::new(),
                local_runs: ProtocolRunStore::new(),
                cache: MembershipCache::new(),
                events,
            }),
        }
    }

    pub fn identity(&self) -> &SecurityDomainMemberIdentity {
        self.ctx.identity()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.ctx.events.subscribe()
    }

    pub fn cache(&self) -> &MembershipCache {
        &self.ctx.cache
    }

    /// Runs currently held in either run store.
    pub fn active_runs(&self) -> usize {
        self.ctx.foreign_runs.len() + self.ctx.local_runs.len()
    }

    /// Every configured security domain other than this agent's own.
    pub fn foreign_domains(&self) -> Vec<String> {
        let own = &self.identity().security_domain;
        self.ctx
            .config
            .dns
            .domains()
            .filter(|domain| *domain != own.as_str())
            .map(str::to_string)
            .collect()
    }

    fn foreign(&self) -> ForeignGatherCoordinator {
        ForeignGatherCoordinator::new(Arc::clone(&self.ctx))
    }

    fn local(&self) -> LocalCounterAttestationCoordinator {
        LocalCounterAttestationCoordinator::new(Arc::clone(&self.ctx))
    }

    /// Starts a foreign gather for `target.security_domain` under a fresh nonce.
    ///
    /// # Errors
    ///
    /// `AgentError::Validation` if the domain is empty, is this agent's own,
    /// or has no configured agents. `AgentError::RunStore` if the nonce is
    /// already in use.
    pub fn sync_external_state(
        &self,
        target: &SecurityDomainMemberIdentity,
    ) -> Result<Ack, AgentError> {
        let domain = target.security_domain.as_str();
        require(!domain.is_empty(), || "securityDomain is required".to_string())?;
        require(domain != self.identity().security_domain, || {
            format!("'{domain}' is this agent's own security domain")
        })?;
        require(self.ctx.config.dns.contains_domain(domain), || {
            format!("no agents configured for security domain '{domain}'")
        })?;

        let nonce = Uuid::new_v4().to_string();
        self.foreign()
            .request_foreign_membership(domain, &nonce, Requester::Initiator)?;
        Ok(Ack::ok(nonce))
    }

    /// Answers a foreign initiator with this agent's attested membership.
    pub fn request_identity_configuration(
        &self,
        request: &SecurityDomainMemberIdentityRequest,
    ) -> Result<Ack, AgentError> {
        require(!request.nonce.is_empty(), || "nonce is required".to_string())?;
        let source = request
            .source_network
            .as_ref()
            .ok_or_else(|| AgentError::Validation("sourceNetwork is required".to_string()))?;
        require(source == self.identity(), || {
            format!("request is addressed to {source}, this agent is {}", self.identity())
        })?;
        let requesting = request
            .requesting_network
            .clone()
            .ok_or_else(|| AgentError::Validation("requestingNetwork is required".to_string()))?;

        let ctx = Arc::clone(&self.ctx);
        let foreign = self.foreign();
        let nonce = request.nonce.clone();
        spawn_logged("respond_to_foreign_request", nonce.clone(), async move {
            let attested = foreign.respond_to_foreign_request(&nonce).await;
            ctx.transport
                .send_identity_configuration(&requesting, &attested)
                .await?;
            Ok(())
        });
        Ok(Ack::ok(request.nonce.clone()))
    }

    /// Delivers one foreign agent's claim into its gather run.
    ///
    /// # Errors
    ///
    /// Fails when the claim names no sender or nonce, or when no run is
    /// gathering under that nonce.
    pub fn send_identity_configuration(
        &self,
        attested: &AttestedMembership,
    ) -> Result<Ack, AgentError> {
        let (sender, nonce) = sender_of(attested.attestation.as_ref())?;
        let response = match &attested.error {
            Some(reason) => Err(reason.clone()),
            None => Ok(attested.clone()),
        };

        let foreign = self.foreign();
        let barrier = foreign.record_foreign_response(nonce, &sender.member_id, response)?;
        if let Barrier::Complete { .. } = barrier {
            let nonce = nonce.to_string();
            tokio::spawn(async move { foreign.complete(&nonce).await });
        }
        Ok(Ack::ok(nonce))
    }

    /// Asks this agent to counter-attest a set gathered by a local peer.
    pub fn request_attestation(
        &self,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<Ack, AgentError> {
        let (sender, nonce) = sender_of(counter_attested.lead_attestation())?;
        let me = self.identity();
        require(sender.security_domain == me.security_domain, || {
            format!("{sender} is not a member of security domain '{}'", me.security_domain)
        })?;
        require(sender != me, || "cannot request attestation from self".to_string())?;
        require(
            !counter_attested.is_error() && !counter_attested.attested_membership_set.is_empty(),
            || "attestedMembershipSet is required".to_string(),
        )?;

        let local = self.local();
        let request = counter_attested.clone();
        let nonce = nonce.to_string();
        spawn_logged("respond_to_local_request", nonce.clone(), async move {
            local.respond_to_local_request(request).await
        });
        Ok(Ack::ok(nonce))
    }

    /// Delivers one local peer's counter-attestation into its run.
    pub fn send_attestation(
        &self,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<Ack, AgentError> {
        let (sender, nonce) = sender_of(counter_attested.lead_attestation())?;
        let me = self.identity();
        require(sender.security_domain == me.security_domain, || {
            format!(
                "counter-attestation from {sender} does not belong to security domain '{}'",
                me.security_domain
            )
        })?;
        let response = match &counter_attested.error {
            Some(reason) => Err(reason.clone()),
            None => Ok(counter_attested.clone()),
        };

        let local = self.local();
        let barrier = local.record_local_response(nonce, &sender.member_id, response)?;
        if let Barrier::Complete { .. } = barrier {
            let nonce = nonce.to_string();
            tokio::spawn(async move { local.complete(&nonce).await });
        }
        Ok(Ack::ok(nonce))
    }

    /// Fails and removes every run that is still gathering responses after
    /// the configured run timeout. Runs already validating, aggregating or
    /// persisting are left to finish.
    ///
    /// A swept refresh run started for a local peer answers that peer with an
    /// error counter-attestation. Returns the number of runs swept.
    pub async fn sweep_stranded_runs(&self) -> usize {
        let timeout = self.ctx.config.run_timeout;
        let mut swept = 0;

        for run in self.ctx.foreign_runs.expire(timeout) {
            swept += 1;
            let error = AgentError::ProtocolState(format!(
                "run timed out waiting for {} of {} foreign responses",
                run.expected.len() - run.received(),
                run.expected.len()
            ));
            self.ctx.fail(&run.nonce, run.phase, &error);
            if let Requester::LocalPeer { requester, .. } = &run.context {
                self.local()
                    .refuse(requester, &run.nonce, &error.to_string())
                    .await;
            }
        }

        for run in self.ctx.local_runs.expire(timeout) {
            swept += 1;
            let error = AgentError::ProtocolState(format!(
                "run timed out waiting for {} of {} local counter-attestations",
                run.expected.len() - run.received(),
                run.expected.len()
            ));
            self.ctx.fail(&run.nonce, run.phase, &error);
        }

        if swept > 0 {
            tracing::warn!(swept, "swept stranded protocol runs");
        }
        swept
    }
}
