//! Client request lifecycle.
//!
//! ```text
//! submit ──CLIENT-REQUEST──► primary (broadcast if the primary is not a member)
//!    │
//!    ├─ retry timer: re-forward, retry_count += 1
//!    │      └─ retry_count == retry_limit → completed "FAILED: retry limit exceeded"
//!    ├─ ack timer: no ACK yet → broadcast to every replica
//!    │
//!    └─ complete / complete_digest → completed, timers cancelled
//! ```
//!
//! Completion is accepted at least once: completing an unknown or already
//! completed request is logged and ignored.
//!
//! A request leaves the pending table when it completes or exhausts its
//! retries. Only the last [`RETAINED_OUTCOMES`] final records are kept for
//! [`ClientRequestManager::record`] lookups.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tessera_crypto::sha256_str;
use tessera_types::{Digest, ReplicaId, RequestId};

use crate::context::ReplicaContext;
use crate::election::PrimaryElection;
use crate::membership::MembershipManager;
use crate::message::{Message, MessageKind};
use crate::timeout::TimeoutScheduler;
use crate::{Error, Result};

/// Response of a request whose retries ran out.
pub const RETRY_EXHAUSTED_RESPONSE: &str = "FAILED: retry limit exceeded";

/// Final records kept after their requests leave the pending table.
pub const RETAINED_OUTCOMES: usize = 128;

/// Snapshot of one client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestRecord {
    pub id: RequestId,
    pub payload: String,
    pub digest: Digest,
    pub retry_count: u32,
    pub completed: bool,
    pub response: Option<String>,
    /// Replicas that acknowledged receiving the request.
    pub acked_by: BTreeSet<ReplicaId>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub retry_interval: Duration,
    pub retry_limit: u32,
    pub ack_timeout: Duration,
}

#[derive(Debug, Default)]
struct ClientState {
    pending: BTreeMap<RequestId, ClientRequestRecord>,
    /// Most recent final records, oldest first.
    outcomes: VecDeque<ClientRequestRecord>,
}

impl ClientState {
    fn pending_for(&self, digest: &Digest) -> Vec<RequestId> {
        self.pending
            .values()
            .filter(|record| record.digest == *digest)
            .map(|record| record.id)
            .collect()
    }

    /// Removes a pending request and returns its final record.
    fn finish(&mut self, id: RequestId, response: String) -> Option<ClientRequestRecord> {
        let mut record = self.pending.remove(&id)?;
        record.completed = true;
        record.response = Some(response);
        if self.outcomes.len() == RETAINED_OUTCOMES {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(record.clone());
        Some(record)
    }
}

enum Retry {
    Forward(ClientRequestRecord),
    Exhausted,
    Gone,
}

#[derive(Debug)]
pub struct ClientRequestManager {
    ctx: ReplicaContext,
    election: Arc<PrimaryElection>,
    membership: Arc<MembershipManager>,
    timeouts: TimeoutScheduler,
    options: ClientOptions,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
    this: Weak<Self>,
}

fn retry_timer(id: RequestId) -> String {
    format!("client-retry-{}", id.as_u64())
}

fn ack_timer(id: RequestId) -> String {
    format!("client-ack-{}", id.as_u64())
}

impl ClientRequestManager {
    pub fn new(
        ctx: ReplicaContext,
        election: Arc<PrimaryElection>,
        membership: Arc<MembershipManager>,
        timeouts: TimeoutScheduler,
        options: ClientOptions,
    ) -> Result<Arc<Self>> {
        if options.retry_interval.is_zero() || options.ack_timeout.is_zero() {
            return Err(Error::invalid("client timeouts must be positive"));
        }
        if options.retry_limit == 0 {
            return Err(Error::invalid("retry limit must be at least 1"));
        }
        Ok(Arc::new_cyclic(|this| Self {
            ctx,
            election,
            membership,
            timeouts,
            options,
            next_id: AtomicU64::new(RequestId::FIRST.as_u64()),
            state: Mutex::new(ClientState::default()),
            this: this.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a request, forwards it to the primary and arms its timers.
    pub fn submit(&self, payload: impl Into<String>) -> Result<RequestId> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(Error::invalid("client payload must not be empty"));
        }
        let digest = sha256_str(&payload);
        let message = self.request_message(digest, &payload)?;

        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().pending.insert(
            id,
            ClientRequestRecord {
                id,
                payload,
                digest,
                retry_count: 0,
                completed: false,
                response: None,
                acked_by: BTreeSet::new(),
            },
        );
        self.ctx.metrics().increment_client_requests();
        tracing::debug!(replica = %self.ctx.id(), request = %id, digest = %digest, "client request submitted");

        self.forward(message);
        self.arm_retry(id)?;
        self.arm_ack(id)?;
        Ok(id)
    }

    fn request_message(&self, digest: Digest, payload: &str) -> Result<Message> {
        Message::new(MessageKind::ClientRequest, self.ctx.id(), digest).with_content(payload)
    }

    /// Sends to the primary, or to everyone if the primary is not a member.
    fn forward(&self, message: Message) {
        let primary = self.election.primary();
        if self.membership.contains(primary) {
            self.ctx.send_direct(primary, message);
        } else {
            tracing::debug!(primary = %primary, "primary not a member, broadcasting request");
            self.ctx.broadcast(message);
        }
    }

    fn arm_retry(&self, id: RequestId) -> Result<()> {
        let this = self.this.clone();
        self.timeouts.start(retry_timer(id), self.options.retry_interval, move || {
            if let Some(manager) = this.upgrade() {
                manager.on_retry_timeout(id);
            }
        })
    }

    fn arm_ack(&self, id: RequestId) -> Result<()> {
        let this = self.this.clone();
        self.timeouts.start(ack_timer(id), self.options.ack_timeout, move || {
            if let Some(manager) = this.upgrade() {
                manager.on_ack_timeout(id);
            }
        })
    }

    /// Retry timer action: re-forward, and fail the request once the retry
    /// limit is reached.
    pub fn on_retry_timeout(&self, id: RequestId) {
        let outcome = {
            let mut state = self.lock();
            match state.pending.get_mut(&id) {
                None => Retry::Gone,
                Some(record) if record.retry_count >= self.options.retry_limit => Retry::Exhausted,
                Some(record) => {
                    record.retry_count += 1;
                    Retry::Forward(record.clone())
                }
            }
        };

        match outcome {
            Retry::Gone => {}
            Retry::Exhausted => self.exhaust(id),
            Retry::Forward(record) => {
                self.ctx.metrics().increment_client_retries();
                tracing::debug!(
                    request = %id,
                    retry = record.retry_count,
                    limit = self.options.retry_limit,
                    "retrying client request"
                );
                match self.request_message(record.digest, &record.payload) {
                    Ok(message) => self.forward(message),
                    Err(e) => tracing::error!(request = %id, error = %e, "cannot rebuild request"),
                }

                if record.retry_count >= self.options.retry_limit {
                    self.exhaust(id);
                } else if let Err(e) = self.arm_retry(id) {
                    tracing::error!(request = %id, error = %e, "cannot re-arm retry timer");
                }
            }
        }
    }

    fn exhaust(&self, id: RequestId) {
        let Some(record) = self.lock().finish(id, RETRY_EXHAUSTED_RESPONSE.to_string()) else {
            return;
        };
        self.timeouts.cancel(&retry_timer(id));
        self.timeouts.cancel(&ack_timer(id));
        self.ctx.metrics().increment_client_failures();
        tracing::warn!(request = %id, retries = record.retry_count, "client request failed, retry limit exceeded");
    }

    /// Ack timer action: nobody acknowledged, so try every replica.
    pub fn on_ack_timeout(&self, id: RequestId) {
        let record = {
            let state = self.lock();
            match state.pending.get(&id) {
                Some(record) if record.acked_by.is_empty() => record.clone(),
                _ => return,
            }
        };
        tracing::warn!(request = %id, "no acknowledgement, broadcasting request");
        match self.request_message(record.digest, &record.payload) {
            Ok(message) => self.ctx.broadcast(message),
            Err(e) => tracing::error!(request = %id, error = %e, "cannot rebuild request"),
        }
    }

    /// Marks a request completed. Returns false (and logs) for an unknown or
    /// already completed id.
    pub fn complete(&self, id: RequestId, response: impl Into<String>) -> bool {
        let Some(record) = self.lock().finish(id, response.into()) else {
            tracing::debug!(request = %id, "completion for unknown or completed request ignored");
            return false;
        };
        self.timeouts.cancel(&retry_timer(id));
        self.timeouts.cancel(&ack_timer(id));
        tracing::debug!(request = %id, retries = record.retry_count, "client request completed");
        true
    }

    /// Completes every pending request with `digest`. Returns how many.
    pub fn complete_digest(&self, digest: &Digest, response: &str) -> usize {
        let ids = self.lock().pending_for(digest);
        ids.into_iter()
            .filter(|id| self.complete(*id, response))
            .count()
    }

    /// Records that `from` acknowledged the request with `digest`.
    pub fn on_ack(&self, from: ReplicaId, digest: &Digest) {
        let acked: Vec<RequestId> = {
            let mut state = self.lock();
            state
                .pending
                .values_mut()
                .filter(|record| record.digest == *digest)
                .map(|record| {
                    record.acked_by.insert(from);
                    record.id
                })
                .collect()
        };
        for id in &acked {
            self.timeouts.cancel(&ack_timer(*id));
        }
        if acked.is_empty() {
            tracing::trace!(from = %from, digest = %digest, "ack for no pending request");
        }
    }

    /// The pending record for `id`, or its final record if it finished
    /// recently.
    pub fn record(&self, id: RequestId) -> Option<ClientRequestRecord> {
        let state = self.lock();
        state
            .pending
            .get(&id)
            .or_else(|| state.outcomes.iter().rev().find(|record| record.id == id))
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn retained_outcomes(&self) -> usize {
        self.lock().outcomes.len()
    }

    pub fn is_retry_armed(&self, id: RequestId) -> bool {
        self.timeouts.is_active(&retry_timer(id))
    }
}
