//! SQLite-backed ledger for a standalone agent.

use async_trait::async_trait;
use iin_attest::AttestationSigner;
use iin_db::DbPool;
use iin_protocol::{LedgerError, LedgerGateway};
use iin_types::{AttestedMembership, CounterAttestedMembership, Membership};

/// Keeps the local domain's membership and recorded foreign memberships in
/// SQLite, and signs on behalf of this agent.
#[derive(Clone)]
pub struct SqliteLedgerGateway {
    pool: DbPool,
    signer: AttestationSigner,
}

impl SqliteLedgerGateway {
    /// The pool must already be migrated.
    pub fn new(pool: DbPool, signer: AttestationSigner) -> Self {
        Self { pool, signer }
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| LedgerError::Storage(format!("db connection failed: {e}")))?;
            op(&mut *conn)
        })
        .await
        .map_err(|e| LedgerError::Storage(format!("ledger task failed: {e}")))?
    }

    async fn load_local_membership(&self) -> Result<Membership, LedgerError> {
        self.with_conn(|conn| {
            iin_db::get_local_membership(conn)
                .map_err(|e| LedgerError::Storage(e.to_string()))?
                .ok_or_else(|| LedgerError::Unavailable("no local membership stored".to_string()))
        })
        .await
    }
}

/// Nonce shared by every attestation of the bundle and of the set it covers.
fn common_nonce(
    counter_attested: &CounterAttestedMembership,
    set: &iin_types::AttestedMembershipSet,
) -> Result<String, LedgerError> {
    let mut nonces = counter_attested
        .attestations
        .iter()
        .chain(&set.attestations)
        .map(|a| a.nonce.as_str());
    let first = nonces
        .next()
        .ok_or_else(|| LedgerError::Rejected("bundle carries no attestations".to_string()))?;
    if first.is_empty() {
        return Err(LedgerError::Rejected("attestation nonce is empty".to_string()));
    }
    if let Some(other) = nonces.find(|n| *n != first) {
        return Err(LedgerError::Rejected(format!(
            "attestations disagree on nonce: '{first}' vs '{other}'"
        )));
    }
    Ok(first.to_string())
}

#[async_trait]
impl LedgerGateway for SqliteLedgerGateway {
    async fn get_attested_membership(
        &self,
        security_domain: &str,
        nonce: &str,
    ) -> Result<AttestedMembership, LedgerError> {
        let membership = self.load_local_membership().await?;
        if membership.security_domain != security_domain {
            return Err(LedgerError::Unavailable(format!(
                "ledger holds security domain '{}', not '{security_domain}'",
                membership.security_domain
            )));
        }
        let blob = membership.encode()?;
        let attestation = self.signer.attest(&blob, nonce);
        Ok(AttestedMembership::new(blob, attestation))
    }

    async fn counter_attest_membership(
        &self,
        set_blob: &str,
        _security_domain: &str,
        nonce: &str,
    ) -> Result<CounterAttestedMembership, LedgerError> {
        if set_blob.is_empty() {
            return Err(LedgerError::Rejected("attested membership set is empty".to_string()));
        }
        Ok(CounterAttestedMembership::new(
            set_blob,
            self.signer.attest(set_blob, nonce),
        ))
    }

    async fn record_membership_in_ledger(
        &self,
        counter_attested: &CounterAttestedMembership,
    ) -> Result<String, LedgerError> {
        if let Some(reason) = &counter_attested.error {
            return Err(LedgerError::Rejected(reason.clone()));
        }
        let set = counter_attested.decode_set()?;
        let nonce = common_nonce(counter_attested, &set)?;
        let membership = Membership::decode(&set.membership)?;

        let bundle = counter_attested.clone();
        let recorded = self
            .with_conn(move |conn| {
                iin_db::record_foreign_membership(conn, &membership, &bundle, &nonce)
                    .map_err(|e| LedgerError::Storage(e.to_string()))
            })
            .await?;

        tracing::debug!(
            security_domain = %recorded.security_domain,
            version = recorded.version,
            created = recorded.created,
            "foreign membership stored"
        );
        Ok(format!("{}@v{}", recorded.security_domain, recorded.version))
    }

    async fn get_local_membership(&self) -> Result<Membership, LedgerError> {
        self.load_local_membership().await
    }
}
