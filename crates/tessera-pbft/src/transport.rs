//! Transport seam and a deterministic in-process network.
//!
//! The core never opens sockets. It hands encoded frames to a [`Transport`]
//! and receives inbound frames through [`crate::Replica::route_bytes`].
//! Delivery may be delayed, dropped or duplicated; nothing here assumes
//! ordering.
//!
//! [`MemoryNetwork`] queues every frame instead of delivering it inline, so a
//! replica never re-enters its own handlers while sending. Tests drain the
//! queue with [`MemoryNetwork::run_until_idle`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tessera_types::ReplicaId;

use crate::Result;

/// Outbound side of the network, as seen by one replica.
pub trait Transport: Send + Sync {
    /// Best-effort delivery to every other replica.
    fn broadcast(&self, frame: &[u8]);

    /// Best-effort delivery to one replica.
    fn send_direct(&self, to: ReplicaId, frame: &[u8]);

    /// Establishes a connection to a peer address.
    fn connect(&self, address: &str) -> Result<()>;
}

/// Receives frames delivered by a [`MemoryNetwork`].
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &[u8]);
}

#[derive(Debug)]
struct Envelope {
    from: ReplicaId,
    to: ReplicaId,
    frame: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    queue: VecDeque<Envelope>,
    handlers: HashMap<ReplicaId, Weak<dyn FrameHandler>>,
    members: Vec<ReplicaId>,
    partitioned: HashSet<ReplicaId>,
    delivered: u64,
    dropped: u64,
}

/// An in-process network connecting [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the outbound endpoint for `id`.
    pub fn transport(&self, id: ReplicaId) -> Arc<MemoryTransport> {
        {
            let mut state = self.lock();
            if !state.members.contains(&id) {
                state.members.push(id);
                state.members.sort();
            }
        }
        Arc::new(MemoryTransport {
            id,
            network: self.clone(),
        })
    }

    /// Registers the receiver for frames addressed to `id`.
    ///
    /// Held weakly; a dropped replica simply stops receiving.
    pub fn attach(&self, id: ReplicaId, handler: Weak<dyn FrameHandler>) {
        self.lock().handlers.insert(id, handler);
    }

    /// Cuts `id` off: frames from or to it are dropped.
    pub fn partition(&self, id: ReplicaId) {
        tracing::debug!(replica = %id, "partitioned");
        self.lock().partitioned.insert(id);
    }

    pub fn heal(&self, id: ReplicaId) {
        tracing::debug!(replica = %id, "healed");
        self.lock().partitioned.remove(&id);
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn enqueue(&self, from: ReplicaId, to: ReplicaId, frame: &[u8]) {
        self.lock().queue.push_back(Envelope {
            from,
            to,
            frame: frame.to_vec(),
        });
    }

    fn enqueue_broadcast(&self, from: ReplicaId, frame: &[u8]) {
        let mut state = self.lock();
        let targets: Vec<ReplicaId> = state
            .members
            .iter()
            .copied()
            .filter(|id| *id != from)
            .collect();
        for to in targets {
            state.queue.push_back(Envelope {
                from,
                to,
                frame: frame.to_vec(),
            });
        }
    }

    /// Delivers one queued frame. Returns false when the queue is empty.
    pub fn step(&self) -> bool {
        let (envelope, handler) = {
            let mut state = self.lock();
            let Some(envelope) = state.queue.pop_front() else {
                return false;
            };
            if state.partitioned.contains(&envelope.from) || state.partitioned.contains(&envelope.to) {
                state.dropped += 1;
                return true;
            }
            let handler = state.handlers.get(&envelope.to).and_then(Weak::upgrade);
            if handler.is_some() {
                state.delivered += 1;
            } else {
                state.dropped += 1;
            }
            (envelope, handler)
        };

        // Delivered without the network lock: handlers enqueue replies
        if let Some(handler) = handler {
            handler.on_frame(&envelope.frame);
        }
        true
    }

    /// Delivers frames until none remain or `limit` deliveries happened.
    /// Returns the number of frames processed.
    pub fn run_until_idle_bounded(&self, limit: usize) -> usize {
        let mut steps = 0;
        while steps < limit && self.step() {
            steps += 1;
        }
        steps
    }

    /// Delivers frames until the queue is empty.
    pub fn run_until_idle(&self) -> usize {
        self.run_until_idle_bounded(usize::MAX)
    }
}

/// One replica's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    id: ReplicaId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn id(&self) -> ReplicaId {
        self.id
    }
}

impl Transport for MemoryTransport {
    fn broadcast(&self, frame: &[u8]) {
        self.network.enqueue_broadcast(self.id, frame);
    }

    fn send_direct(&self, to: ReplicaId, frame: &[u8]) {
        self.network.enqueue(self.id, to, frame);
    }

    fn connect(&self, address: &str) -> Result<()> {
        // Every endpoint is reachable in-process
        tracing::trace!(replica = %self.id, address, "connect");
        Ok(())
    }
}
