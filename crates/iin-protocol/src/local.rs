//! Counter-attestation of a validated foreign set by the local domain's peers.

use crate::agent::AgentContext;
use crate::cache::CacheVerdict;
use crate::store::{ProtocolRun, Response};
use crate::{AgentError, Barrier, ForeignGatherCoordinator, Requester, RunEvent, RunPhase};
use futures_util::future::join_all;
use iin_attest::AttestationError;
use iin_types::{
    AttestedMembershipSet, CounterAttestedMembership, Membership, SecurityDomainMemberIdentity,
};
use std::sync::Arc;

type LocalRun = ProtocolRun<CounterAttestedMembership, CounterAttestedMembership>;

/// What a responder should do with a counter-attestation request.
enum Evaluation {
    /// The cache vouches for the set; counter-attest now.
    Fresh,
    /// Refresh the named foreign domain first.
    Refresh(String),
}

#[derive(Clone)]
pub struct LocalCounterAttestationCoordinator {
    ctx: Arc<AgentContext>,
}

impl LocalCounterAttestationCoordinator {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Counter-attests `set` and collects the same from every local peer.
    ///
    /// With no peers configured the self-counter-attested bundle is recorded
    /// directly.
    pub async fn request_local_counter_attestation(
        &self,
        set: AttestedMembershipSet,
        nonce: &str,
    ) -> Result<(), AgentError> {
        let ctx = &self.ctx;
        let foreign_domain = Membership::decode(&set.membership)?.security_domain;
        let blob = set.encode()?;
        let own = ctx
            .ledger
            .counter_attest_membership(&blob, &ctx.identity().security_domain, nonce)
            .await?;

        let peers = ctx.local_peers();
        if peers.is_empty() {
            tracing::info!(nonce, "no local peers, recording self counter-attested membership");
            return self.persist(nonce, &foreign_domain, &own).await;
        }

        let handle = ctx
            .local_runs
            .begin(nonce, &foreign_domain, peers.iter().cloned(), own.clone())?;
        tracing::info!(
            nonce,
            security_domain = %foreign_domain,
            expected = handle.expected,
            "requesting local counter-attestations"
        );

        let local_domain = ctx.identity().security_domain.clone();
        let calls = peers.into_iter().map(|member| {
            let target = SecurityDomainMemberIdentity::new(local_domain.clone(), member);
            let own = &own;
            async move {
                if let Err(e) = self.ctx.transport.request_attestation(&target, own).await {
                    tracing::warn!(nonce, peer = %target, error = %e, "counter-attestation request failed");
                    self.on_local_response(nonce, &target.member_id, Err(e.to_string()))
                        .await;
                }
            }
        });
        join_all(calls).await;
        Ok(())
    }

    pub fn record_local_response(
        &self,
        nonce: &str,
        member: &str,
        response: Response<CounterAttestedMembership>,
    ) -> Result<Barrier, AgentError> {
        let barrier = self.ctx.local_runs.record_response(nonce, member, response)?;
        match barrier {
            Barrier::Waiting { received, expected } => {
                tracing::debug!(nonce, member, received, expected, "waiting for local counter-attestations");
            }
            Barrier::Surplus { received, expected } => {
                tracing::warn!(nonce, member, received, expected, "discarding surplus counter-attestation");
            }
            Barrier::Complete { expected, .. } => {
                tracing::debug!(nonce, member, expected, "all local counter-attestations received");
            }
        }
        Ok(barrier)
    }

    pub async fn on_local_response(
        &self,
        nonce: &str,
        member: &str,
        response: Response<CounterAttestedMembership>,
    ) {
        match self.record_local_response(nonce, member, response) {
            Ok(Barrier::Complete { .. }) => self.complete(nonce).await,
            Ok(_) => {}
            Err(e) => tracing::warn!(nonce, member, error = %e, "counter-attestation not recorded"),
        }
    }

    /// Merges a complete local run and records it. The run is removed in
    /// every outcome.
    pub async fn complete(&self, nonce: &str) {
        let run = match self.ctx.local_runs.snapshot(nonce) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(nonce, error = %e, "local run vanished before aggregation");
                return;
            }
        };

        let _ = self.ctx.local_runs.set_phase(nonce, RunPhase::Aggregating);
        let outcome = match self.merge(&run).await {
            Ok(merged) => {
                let _ = self.ctx.local_runs.set_phase(nonce, RunPhase::Persisting);
                self.persist(nonce, &run.security_domain, &merged).await
            }
            Err(e) => Err(e),
        };

        let phase = self
            .ctx
            .local_runs
            .end(nonce)
            .map_or(RunPhase::Aggregating, |run| run.phase);
        if let Err(e) = outcome {
            self.ctx.fail(nonce, phase, &e);
        }
    }

    /// Appends each peer's single counter-attestation to this agent's own,
    /// after checking it covers the same set and verifies, for the run's
    /// nonce, against the local trust anchors.
    async fn merge(&self, run: &LocalRun) -> Result<CounterAttestedMembership, AgentError> {
        let own = &run.context;
        let local_membership = self.ctx.ledger.get_local_membership().await?;
        let mut merged = own.clone();

        for member in &run.expected {
            let bundle = match run.results.get(member) {
                Some(Ok(bundle)) => bundle,
                Some(Err(reason)) => {
                    return Err(AgentError::Peer {
                        member: member.clone(),
                        reason: reason.clone(),
                    })
                }
                None => {
                    return Err(AgentError::ProtocolState(format!(
                        "no counter-attestation recorded for '{member}'"
                    )))
                }
            };

            let [attestation] = bundle.attestations.as_slice() else {
                return Err(AgentError::ProtocolState(format!(
                    "'{member}' sent {} counter-attestations, expected exactly one",
                    bundle.attestations.len()
                )));
            };
            if bundle.attested_membership_set != own.attested_membership_set {
                return Err(AttestationError::MembershipMismatch {
                    member: member.clone(),
                }
                .into());
            }
            self.ctx
                .validator
                .check(
                    attestation,
                    &run.nonce,
                    &own.attested_membership_set,
                    &local_membership,
                )
                .map_err(|source| AttestationError::InvalidAttestation {
                    member: member.clone(),
                    source: Box::new(source),
                })?;

            merged.attestations.push(attestation.clone());
        }
        Ok(merged)
    }

    async fn persist(
        &self,
        nonce: &str,
        foreign_domain: &str,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<(), AgentError> {
        let receipt = self
            .ctx
            .ledger
            .record_membership_in_ledger(counter_attested)
            .await?;
        tracing::info!(
            nonce,
            security_domain = foreign_domain,
            attesters = counter_attested.attestations.len(),
            receipt = %receipt,
            "recorded foreign membership"
        );
        self.ctx.emit(RunEvent::MembershipRecorded {
            nonce: nonce.to_string(),
            security_domain: foreign_domain.to_string(),
        });
        Ok(())
    }

    /// Answers a local peer's counter-attestation request.
    ///
    /// A fresh cache entry over the same membership is enough to counter-sign
    /// immediately; a stale or missing one starts a single foreign refresh
    /// run under the request's nonce, answered when it completes.
    pub async fn respond_to_local_request(
        &self,
        request: CounterAttestedMembership,
    ) -> Result<(), AgentError> {
        let lead = request
            .lead_attestation()
            .ok_or_else(|| AgentError::Validation("missing attestation".to_string()))?;
        let requester = lead
            .unit_identity
            .clone()
            .ok_or_else(|| AgentError::Validation("attestation has no unit identity".to_string()))?;
        let nonce = lead.nonce.clone();

        let evaluation = match self.evaluate(&request, &nonce) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                self.ctx.fail(&nonce, RunPhase::Validating, &e);
                self.refuse(&requester, &nonce, &e.to_string()).await;
                return Ok(());
            }
        };

        match evaluation {
            Evaluation::Fresh => {
                tracing::debug!(nonce = %nonce, requester = %requester, "cached membership is fresh");
                self.counter_attest_for(&requester, &request, &nonce).await
            }
            Evaluation::Refresh(foreign_domain) => {
                tracing::info!(
                    nonce = %nonce,
                    security_domain = %foreign_domain,
                    "cached membership is stale, refreshing"
                );
                let refresh = ForeignGatherCoordinator::new(Arc::clone(&self.ctx))
                    .request_foreign_membership(
                        &foreign_domain,
                        &nonce,
                        Requester::LocalPeer {
                            requester: requester.clone(),
                            request,
                        },
                    );
                if let Err(e) = refresh {
                    self.ctx.fail(&nonce, RunPhase::Gathering, &e);
                    self.refuse(&requester, &nonce, &e.to_string()).await;
                }
                Ok(())
            }
        }
    }

    fn evaluate(
        &self,
        request: &CounterAttestedMembership,
        nonce: &str,
    ) -> Result<Evaluation, AgentError> {
        let set = request.decode_set()?;
        let membership =
            self.ctx
                .validator
                .validate_set(&set.attestations, &set.membership, nonce)?;

        match self.ctx.cache.check_set(&set, self.ctx.config.refresh_time) {
            CacheVerdict::Fresh => Ok(Evaluation::Fresh),
            CacheVerdict::Stale => Ok(Evaluation::Refresh(membership.security_domain)),
            CacheVerdict::Mismatch { member } => {
                Err(AttestationError::MembershipMismatch { member }.into())
            }
        }
    }

    /// Completes a request that waited on a foreign refresh.
    pub(crate) async fn answer_after_refresh(
        &self,
        requester: &SecurityDomainMemberIdentity,
        request: &CounterAttestedMembership,
        refreshed: &AttestedMembershipSet,
        nonce: &str,
    ) -> Result<(), AgentError> {
        let requested = request.decode_set()?;
        if requested.membership != refreshed.membership {
            let member = refreshed
                .attestations
                .first()
                .and_then(|a| a.member_id())
                .unwrap_or_default()
                .to_string();
            let error = AgentError::from(AttestationError::MembershipMismatch { member });
            self.ctx.fail(nonce, RunPhase::Aggregating, &error);
            self.refuse(requester, nonce, &error.to_string()).await;
            return Ok(());
        }
        self.counter_attest_for(requester, request, nonce).await
    }

    async fn counter_attest_for(
        &self,
        requester: &SecurityDomainMemberIdentity,
        request: &CounterAttestedMembership,
        nonce: &str,
    ) -> Result<(), AgentError> {
        let me = self.ctx.identity();
        let reply = match self
            .ctx
            .ledger
            .counter_attest_membership(&request.attested_membership_set, &me.security_domain, nonce)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(nonce, error = %e, "cannot counter-attest membership");
                CounterAttestedMembership::failure(e.to_string(), me.clone(), nonce)
            }
        };

        self.ctx.transport.send_attestation(requester, &reply).await?;
        if !reply.is_error() {
            tracing::info!(nonce, requester = %requester, "sent counter-attestation");
            self.ctx.emit(RunEvent::CounterAttestationSent {
                nonce: nonce.to_string(),
                requester: requester.clone(),
            });
        }
        Ok(())
    }

    /// Sends an error counter-attestation to `requester`.
    pub(crate) async fn refuse(
        &self,
        requester: &SecurityDomainMemberIdentity,
        nonce: &str,
        reason: &str,
    ) {
        let reply = CounterAttestedMembership::failure(reason, self.ctx.identity().clone(), nonce);
        if let Err(e) = self.ctx.transport.send_attestation(requester, &reply).await {
            tracing::warn!(nonce, requester = %requester, error = %e, "could not deliver refusal");
        }
    }
}
