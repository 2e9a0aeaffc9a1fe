//! Last validated membership claim per foreign agent.

use chrono::Utc;
use iin_types::{AttestedMembership, AttestedMembershipSet, SecurityDomainMemberIdentity};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// How a requested attested set compares with what the cache holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheVerdict {
    /// Every attester has a fresh entry over the same membership blob.
    Fresh,
    /// At least one attester's entry is missing or older than the refresh time.
    Stale,
    /// A fresh entry holds a different membership blob.
    Mismatch { member: String },
}

#[derive(Debug, Default)]
pub struct MembershipCache {
    entries: RwLock<HashMap<SecurityDomainMemberIdentity, AttestedMembership>>,
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Whether a claim attested at `timestamp_ms` is still within `refresh_time`.
pub fn is_fresh(timestamp_ms: u64, refresh_time: Duration, now_ms: u64) -> bool {
    let age_ms = u128::from(now_ms.saturating_sub(timestamp_ms));
    age_ms <= refresh_time.as_millis()
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a validated claim under its attester's identity. Claims without
    /// an identified attestation are ignored.
    pub fn store(&self, attested: &AttestedMembership) {
        let Some(identity) = attested
            .attestation
            .as_ref()
            .and_then(|a| a.unit_identity.clone())
        else {
            return;
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity, attested.clone());
    }

    pub fn get(&self, identity: &SecurityDomainMemberIdentity) -> Option<AttestedMembership> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    /// Compares every attester of `set` against the cache.
    pub fn check_set(&self, set: &AttestedMembershipSet, refresh_time: Duration) -> CacheVerdict {
        let now = now_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let mut mismatch = None;
        for attestation in &set.attestations {
            let Some(identity) = attestation.unit_identity.as_ref() else {
                return CacheVerdict::Stale;
            };
            let Some(cached) = entries.get(identity) else {
                return CacheVerdict::Stale;
            };
            let timestamp = cached.attestation.as_ref().map_or(0, |a| a.timestamp);
            if !is_fresh(timestamp, refresh_time, now) {
                return CacheVerdict::Stale;
            }
            if cached.membership != set.membership && mismatch.is_none() {
                mismatch = Some(identity.member_id.clone());
            }
        }

        match mismatch {
            Some(member) => CacheVerdict::Mismatch { member },
            None => CacheVerdict::Fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
