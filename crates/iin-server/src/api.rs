//! HTTP handlers for the agent RPCs and the membership read endpoints.

use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use iin_protocol::{AgentError, ErrorKind, RunStoreError};
use iin_types::{
    Ack, AttestedMembership, CounterAttestedMembership, Membership, SecurityDomainMemberIdentity,
    SecurityDomainMemberIdentityRequest,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes. The body is always an
/// `Ack` with status `ERROR`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {message}")]
    BadRequest { request_id: String, message: String },
    #[error("not found: {message}")]
    NotFound { request_id: String, message: String },
    #[error("conflict: {message}")]
    Conflict { request_id: String, message: String },
    #[error("internal server error: {message}")]
    InternalServerError { request_id: String, message: String },
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError::InternalServerError {
            request_id: String::new(),
            message: message.into(),
        }
    }

    /// Classifies a synchronous rejection from the agent.
    fn from_agent(request_id: &str, err: AgentError) -> Self {
        let request_id = request_id.to_string();
        let message = err.to_string();
        match (&err, err.kind()) {
            (AgentError::RunStore(RunStoreError::UnknownNonce(_)), _) => {
                ApiError::NotFound { request_id, message }
            }
            (_, ErrorKind::Validation | ErrorKind::Crypto | ErrorKind::Mismatch) => {
                ApiError::BadRequest { request_id, message }
            }
            (_, ErrorKind::ProtocolState) => ApiError::Conflict { request_id, message },
            (_, ErrorKind::Transport | ErrorKind::Ledger) => {
                ApiError::InternalServerError { request_id, message }
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest {
            request_id: String::new(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, request_id, message) = match self {
            ApiError::BadRequest { request_id, message } => {
                (StatusCode::BAD_REQUEST, request_id, message)
            }
            ApiError::NotFound { request_id, message } => {
                (StatusCode::NOT_FOUND, request_id, message)
            }
            ApiError::Conflict { request_id, message } => {
                (StatusCode::CONFLICT, request_id, message)
            }
            ApiError::InternalServerError { request_id, message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, request_id, message)
            }
        };

        (status, Json(Ack::error(request_id, message))).into_response()
    }
}

fn acknowledge(
    rpc: &'static str,
    request_id: &str,
    result: Result<Ack, AgentError>,
) -> Result<Json<Ack>, ApiError> {
    match result {
        Ok(ack) => Ok(Json(ack)),
        Err(e) => {
            tracing::warn!(rpc, request_id, error = %e, "rejected rpc");
            Err(ApiError::from_agent(request_id, e))
        }
    }
}

fn lead_nonce(counter_attested: &CounterAttestedMembership) -> &str {
    counter_attested
        .lead_attestation()
        .map_or("", |a| a.nonce.as_str())
}

/// Handler for `POST /iin/v1/SyncExternalState`.
pub async fn sync_external_state_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<SecurityDomainMemberIdentity>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(target) = payload?;
    acknowledge(
        "SyncExternalState",
        "",
        state.agent.sync_external_state(&target),
    )
}

/// Handler for `POST /iin/v1/RequestIdentityConfiguration`.
pub async fn request_identity_configuration_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<SecurityDomainMemberIdentityRequest>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(request) = payload?;
    acknowledge(
        "RequestIdentityConfiguration",
        &request.nonce,
        state.agent.request_identity_configuration(&request),
    )
}

/// Handler for `POST /iin/v1/SendIdentityConfiguration`.
pub async fn send_identity_configuration_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<AttestedMembership>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(attested) = payload?;
    let nonce = attested
        .attestation
        .as_ref()
        .map_or("", |a| a.nonce.as_str());
    acknowledge(
        "SendIdentityConfiguration",
        nonce,
        state.agent.send_identity_configuration(&attested),
    )
}

/// Handler for `POST /iin/v1/RequestAttestation`.
pub async fn request_attestation_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<CounterAttestedMembership>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(counter_attested) = payload?;
    acknowledge(
        "RequestAttestation",
        lead_nonce(&counter_attested),
        state.agent.request_attestation(&counter_attested),
    )
}

/// Handler for `POST /iin/v1/SendAttestation`.
pub async fn send_attestation_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<CounterAttestedMembership>, JsonRejection>,
) -> Result<Json<Ack>, ApiError> {
    let Json(counter_attested) = payload?;
    acknowledge(
        "SendAttestation",
        lead_nonce(&counter_attested),
        state.agent.send_attestation(&counter_attested),
    )
}

/// A recorded foreign membership as served over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignMembershipResponse {
    pub security_domain: String,
    pub membership: Membership,
    /// The bundle the record was made from.
    pub counter_attested: CounterAttestedMembership,
    pub nonce: String,
    pub version: i64,
    pub updated_at: String,
}

impl From<iin_db::StoredForeignMembership> for ForeignMembershipResponse {
    fn from(stored: iin_db::StoredForeignMembership) -> Self {
        Self {
            security_domain: stored.membership.security_domain.clone(),
            membership: stored.membership,
            counter_attested: stored.counter_attested,
            nonce: stored.nonce,
            version: stored.version,
            updated_at: stored.updated_at,
        }
    }
}

/// One version in a domain's membership history.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub nonce: String,
    pub version: i64,
    pub membership: Membership,
    pub recorded_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipHistoryResponse {
    pub security_domain: String,
    /// Oldest first.
    pub entries: Vec<HistoryEntryResponse>,
}

async fn with_db<T, F>(state: Arc<AppState>, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| ApiError::internal(format!("db connection failed: {e}")))?;
        op(&*conn)
    })
    .await
    .map_err(|e| ApiError::internal(format!("task join error: {e}")))?
}

/// Handler for `GET /iin/v1/memberships`.
pub async fn list_memberships_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ForeignMembershipResponse>>, ApiError> {
    let stored = with_db(state, |conn| {
        iin_db::list_foreign_memberships(conn).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await?;
    Ok(Json(stored.into_iter().map(Into::into).collect()))
}

/// Handler for `GET /iin/v1/memberships/{securityDomain}`.
pub async fn get_membership_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(security_domain): Path<String>,
) -> Result<Json<ForeignMembershipResponse>, ApiError> {
    let domain = security_domain.clone();
    let stored = with_db(state, move |conn| {
        iin_db::get_foreign_membership(conn, &domain).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await?;
    stored.map(|s| Json(s.into())).ok_or_else(|| ApiError::NotFound {
        request_id: String::new(),
        message: format!("no membership recorded for security domain '{security_domain}'"),
    })
}

/// Handler for `GET /iin/v1/memberships/{securityDomain}/history`.
pub async fn membership_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(security_domain): Path<String>,
) -> Result<Json<MembershipHistoryResponse>, ApiError> {
    let domain = security_domain.clone();
    let entries = with_db(state, move |conn| {
        iin_db::membership_history(conn, &domain).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await?;
    Ok(Json(MembershipHistoryResponse {
        security_domain,
        entries: entries
            .into_iter()
            .map(|e| HistoryEntryResponse {
                nonce: e.nonce,
                version: e.version,
                membership: e.membership,
                recorded_at: e.recorded_at,
            })
            .collect(),
    }))
}
