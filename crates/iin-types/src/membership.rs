//! The persisted membership record of a security domain.

use crate::{decode_blob, encode_blob, CodecError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a member's trust anchor is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// `value` holds the member's CA certificate.
    Ca,
    /// `chain` holds `[root, ..., leaf]` certificates.
    Certificate,
}

/// One member's trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "type")]
    pub member_type: MemberType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

impl Member {
    pub fn ca(ca_pem: impl Into<String>) -> Self {
        Self {
            member_type: MemberType::Ca,
            value: ca_pem.into(),
            chain: Vec::new(),
        }
    }

    pub fn chain(chain: Vec<String>) -> Self {
        Self {
            member_type: MemberType::Certificate,
            value: String::new(),
            chain,
        }
    }
}

/// Trust anchors for every member of a security domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub security_domain: String,
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
}

impl Membership {
    pub fn new(security_domain: impl Into<String>) -> Self {
        Self {
            security_domain: security_domain.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn with_member(mut self, member_id: impl Into<String>, member: Member) -> Self {
        self.members.insert(member_id.into(), member);
        self
    }

    /// Serializes the record into the opaque blob agents sign.
    pub fn encode(&self) -> Result<String, CodecError> {
        encode_blob(self)
    }

    pub fn decode(blob: &str) -> Result<Self, CodecError> {
        decode_blob(blob)
    }
}
