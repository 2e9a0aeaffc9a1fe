//! Nonce-keyed transient state of in-flight protocol runs.
//!
//! The outer map is locked only long enough to find or insert a run; every
//! mutation of a run happens under that run's own lock, so runs with
//! different nonces never wait on each other.

use crate::RunStoreError;
use iin_types::{CounterAttestedMembership, SecurityDomainMemberIdentity};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Gathering,
    Validating,
    Aggregating,
    Persisting,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gathering => "GATHERING",
            Self::Validating => "VALIDATING",
            Self::Aggregating => "AGGREGATING",
            Self::Persisting => "PERSISTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Who is waiting on the outcome of a foreign gather.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    /// This agent started the sync and will run local counter-attestation
    /// itself.
    Initiator,
    /// A local peer asked this agent to counter-attest and the cached
    /// foreign membership had to be refreshed first.
    LocalPeer {
        requester: SecurityDomainMemberIdentity,
        request: CounterAttestedMembership,
    },
}

/// A participant's result, or the protocol-level error it reported.
pub type Response<R> = Result<R, String>;

/// State of one run.
#[derive(Debug, Clone)]
pub struct ProtocolRun<R, C> {
    pub nonce: String,
    /// The foreign security domain the run concerns.
    pub security_domain: String,
    pub phase: RunPhase,
    pub expected: BTreeSet<String>,
    pub results: BTreeMap<String, Response<R>>,
    pub context: C,
    pub started_at: Instant,
}

impl<R, C> ProtocolRun<R, C> {
    pub fn received(&self) -> usize {
        self.results.len()
    }
}

/// Returned by [`ProtocolRunStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub nonce: String,
    pub expected: usize,
}

/// Outcome of recording one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// More responses are outstanding.
    Waiting { received: usize, expected: usize },
    /// This response was the last one. Exactly one caller per run sees this.
    Complete { received: usize, expected: usize },
    /// Duplicate from an already-recorded member, or late after the barrier
    /// tripped. The response was discarded.
    Surplus { received: usize, expected: usize },
}

type Shared<R, C> = Arc<Mutex<ProtocolRun<R, C>>>;

pub struct ProtocolRunStore<R, C> {
    runs: Mutex<HashMap<String, Shared<R, C>>>,
}

impl<R, C> Default for ProtocolRunStore<R, C> {
    fn default() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Clone, C: Clone> ProtocolRunStore<R, C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, nonce: &str) -> Result<Shared<R, C>, RunStoreError> {
        lock(&self.runs)
            .get(nonce)
            .cloned()
            .ok_or_else(|| RunStoreError::UnknownNonce(nonce.to_string()))
    }

    /// Opens a run expecting one response from each of `expected`.
    pub fn begin(
        &self,
        nonce: &str,
        security_domain: &str,
        expected: impl IntoIterator<Item = String>,
        context: C,
    ) -> Result<RunHandle, RunStoreError> {
        let expected: BTreeSet<String> = expected.into_iter().collect();
        let handle = RunHandle {
            nonce: nonce.to_string(),
            expected: expected.len(),
        };

        let mut runs = lock(&self.runs);
        if runs.contains_key(nonce) {
            return Err(RunStoreError::DuplicateNonce(nonce.to_string()));
        }
        runs.insert(
            nonce.to_string(),
            Arc::new(Mutex::new(ProtocolRun {
                nonce: nonce.to_string(),
                security_domain: security_domain.to_string(),
                phase: RunPhase::Gathering,
                expected,
                results: BTreeMap::new(),
                context,
                started_at: Instant::now(),
            })),
        );
        Ok(handle)
    }

    /// Records `member`'s response and reports where the barrier stands.
    ///
    /// The count check happens under the same lock as the insert, so exactly
    /// one caller observes [`Barrier::Complete`]. The first response per
    /// member wins.
    pub fn record_response(
        &self,
        nonce: &str,
        member: &str,
        response: Response<R>,
    ) -> Result<Barrier, RunStoreError> {
        let shared = self.get(nonce)?;
        Self::record(&shared, nonce, member, response)
    }

    fn record(
        shared: &Shared<R, C>,
        nonce: &str,
        member: &str,
        response: Response<R>,
    ) -> Result<Barrier, RunStoreError> {
        let mut run = lock(shared);

        if !run.expected.contains(member) {
            return Err(RunStoreError::UnexpectedMember {
                nonce: nonce.to_string(),
                member: member.to_string(),
            });
        }

        let expected = run.expected.len();
        if run.phase != RunPhase::Gathering || run.results.contains_key(member) {
            return Ok(Barrier::Surplus {
                received: run.received(),
                expected,
            });
        }

        run.results.insert(member.to_string(), response);
        let received = run.received();
        if received == expected {
            run.phase = RunPhase::Validating;
            Ok(Barrier::Complete { received, expected })
        } else {
            Ok(Barrier::Waiting { received, expected })
        }
    }

    /// A copy of the run's current state.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::UnknownNonce`] if no run is open under
    /// `nonce`.
    pub fn snapshot(&self, nonce: &str) -> Result<ProtocolRun<R, C>, RunStoreError> {
        let shared = self.get(nonce)?;
        let run = lock(&shared).clone();
        Ok(run)
    }

    /// Moves the run to `phase`. The store does not police transitions; the
    /// coordinators advance their own runs.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::UnknownNonce`] if the run is gone.
    pub fn set_phase(&self, nonce: &str, phase: RunPhase) -> Result<(), RunStoreError> {
        let shared = self.get(nonce)?;
        lock(&shared).phase = phase;
        Ok(())
    }

    /// Removes the run, returning its final state.
    pub fn end(&self, nonce: &str) -> Option<ProtocolRun<R, C>> {
        let shared = lock(&self.runs).remove(nonce)?;
        let run = lock(&shared).clone();
        Some(run)
    }

    /// Removes every run still gathering responses that started at least
    /// `timeout` ago, returning each as it stood when swept.
    ///
    /// A run whose barrier has tripped belongs to the task completing it and
    /// is never expired. The check and the transition to
    /// [`RunPhase::Failed`] happen under the run's own lock, so a response
    /// racing the sweep either trips the barrier first (and the run is kept)
    /// or lands on a failed run as [`Barrier::Surplus`].
    pub fn expire(&self, timeout: Duration) -> Vec<ProtocolRun<R, C>> {
        let mut runs = lock(&self.runs);
        let mut expired = Vec::new();
        runs.retain(|_, shared| {
            let mut run = lock(shared);
            if run.phase != RunPhase::Gathering || run.started_at.elapsed() < timeout {
                return true;
            }
            expired.push(run.clone());
            run.phase = RunPhase::Failed;
            false
        });
        expired
    }

    /// Whether a run is open under `nonce`.
    pub fn contains(&self, nonce: &str) -> bool {
        lock(&self.runs).contains_key(nonce)
    }

    /// Number of open runs.
    pub fn len(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
