//! Gathering and validating a foreign domain's membership claims.

use crate::agent::AgentContext;
use crate::store::{ProtocolRun, Response, RunHandle};
use crate::{
    AgentError, Barrier, LocalCounterAttestationCoordinator, Requester, RunEvent, RunPhase,
};
use futures_util::future::join_all;
use iin_attest::AttestationError;
use iin_types::{
    AttestedMembership, AttestedMembershipSet, Membership, SecurityDomainMemberIdentity,
    SecurityDomainMemberIdentityRequest,
};
use std::sync::Arc;

type ForeignRun = ProtocolRun<AttestedMembership, Requester>;

/// Fans identity configuration requests out to every agent of a foreign
/// domain and validates the claims once all of them have answered.
#[derive(Clone)]
pub struct ForeignGatherCoordinator {
    ctx: Arc<AgentContext>,
}

impl ForeignGatherCoordinator {
    pub(crate) fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Opens a gather run for `foreign_domain` and sends the requests in the
    /// background. Returns as soon as the run is registered.
    pub fn request_foreign_membership(
        &self,
        foreign_domain: &str,
        nonce: &str,
        requester: Requester,
    ) -> Result<RunHandle, AgentError> {
        let members = self.ctx.config.dns.members(foreign_domain);
        if members.is_empty() {
            return Err(AgentError::Validation(format!(
                "no agents configured for security domain '{foreign_domain}'"
            )));
        }

        let handle =
            self.ctx
                .foreign_runs
                .begin(nonce, foreign_domain, members.iter().cloned(), requester)?;
        tracing::info!(
            nonce,
            security_domain = foreign_domain,
            expected = handle.expected,
            "requesting foreign membership"
        );

        let this = self.clone();
        let domain = foreign_domain.to_string();
        let nonce = nonce.to_string();
        tokio::spawn(async move { this.fan_out(domain, members, nonce).await });
        Ok(handle)
    }

    async fn fan_out(&self, domain: String, members: Vec<String>, nonce: String) {
        let requesting = self.ctx.identity().clone();
        let calls = members.into_iter().map(|member| {
            let target = SecurityDomainMemberIdentity::new(domain.clone(), member);
            let request = SecurityDomainMemberIdentityRequest {
                source_network: Some(target.clone()),
                requesting_network: Some(requesting.clone()),
                nonce: nonce.clone(),
            };
            let nonce = nonce.as_str();
            async move {
                if let Err(e) = self
                    .ctx
                    .transport
                    .request_identity_configuration(&target, &request)
                    .await
                {
                    tracing::warn!(nonce, peer = %target, error = %e, "identity configuration request failed");
                    self.on_foreign_response(nonce, &target.member_id, Err(e.to_string()))
                        .await;
                }
            }
        });
        join_all(calls).await;
    }

    /// Records one member's claim without aggregating.
    pub fn record_foreign_response(
        &self,
        nonce: &str,
        member: &str,
        response: Response<AttestedMembership>,
    ) -> Result<Barrier, AgentError> {
        let barrier = self.ctx.foreign_runs.record_response(nonce, member, response)?;
        match barrier {
            Barrier::Waiting { received, expected } => {
                tracing::debug!(nonce, member, received, expected, "waiting for foreign responses");
            }
            Barrier::Surplus { received, expected } => {
                tracing::warn!(nonce, member, received, expected, "discarding surplus foreign response");
            }
            Barrier::Complete { expected, .. } => {
                tracing::debug!(nonce, member, expected, "all foreign responses received");
            }
        }
        Ok(barrier)
    }

    /// Records a claim and aggregates if it was the last one.
    pub async fn on_foreign_response(
        &self,
        nonce: &str,
        member: &str,
        response: Response<AttestedMembership>,
    ) {
        match self.record_foreign_response(nonce, member, response) {
            Ok(Barrier::Complete { .. }) => self.complete(nonce).await,
            Ok(_) => {}
            Err(e) => tracing::warn!(nonce, member, error = %e, "foreign response not recorded"),
        }
    }

    /// Validates a run whose barrier has tripped and hands the result to
    /// whoever is waiting on it. The run is removed in every outcome.
    pub async fn complete(&self, nonce: &str) {
        let run = match self.ctx.foreign_runs.snapshot(nonce) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(nonce, error = %e, "foreign run vanished before aggregation");
                return;
            }
        };

        match self.validate(&run) {
            Ok((set, claims)) => {
                for claim in &claims {
                    self.ctx.cache.store(claim);
                }
                let _ = self.ctx.foreign_runs.set_phase(nonce, RunPhase::Aggregating);
                tracing::info!(
                    nonce,
                    security_domain = %run.security_domain,
                    attesters = set.attestations.len(),
                    "foreign membership validated"
                );
                self.ctx.emit(RunEvent::ForeignGatherCompleted {
                    nonce: nonce.to_string(),
                    security_domain: run.security_domain.clone(),
                });

                let local = LocalCounterAttestationCoordinator::new(Arc::clone(&self.ctx));
                let routed = match &run.context {
                    Requester::Initiator => {
                        local.request_local_counter_attestation(set, nonce).await
                    }
                    Requester::LocalPeer { requester, request } => {
                        local.answer_after_refresh(requester, request, &set, nonce).await
                    }
                };
                self.ctx.foreign_runs.end(nonce);
                if let Err(e) = routed {
                    self.ctx.fail(nonce, RunPhase::Aggregating, &e);
                }
            }
            Err(e) => {
                self.ctx.foreign_runs.end(nonce);
                self.ctx.fail(nonce, RunPhase::Validating, &e);
                if let Requester::LocalPeer { requester, .. } = &run.context {
                    LocalCounterAttestationCoordinator::new(Arc::clone(&self.ctx))
                        .refuse(requester, nonce, &e.to_string())
                        .await;
                }
            }
        }
    }

    /// Every expected member must have answered without error, over the same
    /// membership blob of the requested domain, with a valid attestation.
    fn validate(
        &self,
        run: &ForeignRun,
    ) -> Result<(AttestedMembershipSet, Vec<AttestedMembership>), AgentError> {
        let mut claims = Vec::with_capacity(run.expected.len());
        for member in &run.expected {
            match run.results.get(member) {
                Some(Ok(claim)) => claims.push(claim.clone()),
                Some(Err(reason)) => {
                    return Err(AgentError::Peer {
                        member: member.clone(),
                        reason: reason.clone(),
                    })
                }
                None => {
                    return Err(AgentError::ProtocolState(format!(
                        "no response recorded for '{member}'"
                    )))
                }
            }
        }

        let set = self.ctx.validator.assemble_set(&claims, &run.nonce)?;
        let membership = Membership::decode(&set.membership)?;
        if membership.security_domain != run.security_domain {
            let member = set
                .attestations
                .first()
                .and_then(|a| a.member_id())
                .unwrap_or_default()
                .to_string();
            return Err(AttestationError::DomainMismatch {
                member,
                expected: run.security_domain.clone(),
                actual: membership.security_domain,
            }
            .into());
        }
        Ok((set, claims))
    }

    /// This agent's own membership, attested for `nonce`.
    ///
    /// Ledger failures become an error claim rather than a failed call.
    pub async fn respond_to_foreign_request(&self, nonce: &str) -> AttestedMembership {
        let me = self.ctx.identity();
        match self
            .ctx
            .ledger
            .get_attested_membership(&me.security_domain, nonce)
            .await
        {
            Ok(attested) => attested,
            Err(e) => {
                tracing::error!(nonce, error = %e, "cannot attest local membership");
                AttestedMembership::failure(e.to_string(), me.clone(), nonce)
            }
        }
    }
}
