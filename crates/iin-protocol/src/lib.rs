//! The IIN agent membership counter-attestation protocol.
//!
//! An initiating agent gathers a signed membership claim from every agent of
//! a foreign security domain ([`ForeignGatherCoordinator`]), validates them
//! as one set, then collects a counter-signature over that set from every
//! other agent of its own domain ([`LocalCounterAttestationCoordinator`])
//! before handing the jointly attested bundle to the ledger. Responders run
//! the mirrored halves of both coordinators.
//!
//! Per-run state lives in a nonce-keyed [`ProtocolRunStore`]. Ledger access
//! and agent-to-agent calls are collaborator traits ([`LedgerGateway`],
//! [`AgentTransport`]) so the protocol can run over any binding.

mod agent;
mod cache;
mod error;
mod events;
mod foreign;
mod ledger;
mod local;
mod store;
mod transport;

pub use agent::{AgentConfig, IinAgent};
pub use cache::{is_fresh, CacheVerdict, MembershipCache};
pub use error::{AgentError, ErrorKind, LedgerError, RunStoreError, TransportError};
pub use events::RunEvent;
pub use foreign::ForeignGatherCoordinator;
pub use ledger::LedgerGateway;
pub use local::LocalCounterAttestationCoordinator;
pub use store::{Barrier, ProtocolRun, ProtocolRunStore, Requester, Response, RunHandle, RunPhase};
pub use transport::AgentTransport;
