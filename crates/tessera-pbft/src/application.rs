//! Application seam: the state machine a committed request is executed against.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tessera_types::Digest;

/// Business logic executed once a request commits.
///
/// Invoked at most once per digest under normal operation, but must be
/// safely re-invokable with the same digest.
pub trait Application: Send + Sync {
    fn execute(&self, digest: &Digest, payload: &str) -> String;
}

/// An [`Application`] that records every invocation and echoes the payload.
#[derive(Debug, Default)]
pub struct RecordingApplication {
    invocations: Mutex<HashMap<Digest, usize>>,
    order: Mutex<Vec<String>>,
}

impl RecordingApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `digest` was executed.
    pub fn invocations(&self, digest: &Digest) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    /// Payloads in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_invocations(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

impl Application for RecordingApplication {
    fn execute(&self, digest: &Digest, payload: &str) -> String {
        *self
            .invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*digest)
            .or_insert(0) += 1;
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_string());
        format!("OK: {payload}")
    }
}
