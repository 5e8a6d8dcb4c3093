//! Per-virtual-user execution context.

use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng as _;
use serde_json::Value;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Connection;

/// Mutable state of one virtual user, created empty at scenario start,
/// mutated by every step, and torn down (connections closed) at scenario end
/// regardless of outcome. Never shared between scenario instances.
pub struct VuContext {
    pub uid: u64,
    /// Captured and derived variables.
    pub vars: BTreeMap<String, Value>,
    /// One live connection per namespace, exclusive to this context.
    pub sockets: BTreeMap<String, Arc<dyn Connection>>,
    pub success_count: u64,
    pub pending_requests: u64,
    received_messages: Arc<AtomicU64>,
    /// Per-user random stream, derived from the run seed.
    pub rng: ChaCha20Rng,
}

impl VuContext {
    pub fn new(uid: u64, run_seed: u64) -> Self {
        let mut material = [0u8; 16];
        material[..8].copy_from_slice(&run_seed.to_le_bytes());
        material[8..].copy_from_slice(&uid.to_le_bytes());
        let digest = blake3::hash(&material);
        let mut seed32 = [0u8; 32];
        seed32.copy_from_slice(&digest.as_bytes()[..32]);
        Self {
            uid,
            vars: BTreeMap::new(),
            sockets: BTreeMap::new(),
            success_count: 0,
            pending_requests: 0,
            received_messages: Arc::new(AtomicU64::new(0)),
            rng: ChaCha20Rng::from_seed(seed32),
        }
    }

    pub fn received_message_count(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    /// Handle for the catch-all inbound counter, shared with connections.
    pub fn message_counter(&self) -> Arc<AtomicU64> {
        self.received_messages.clone()
    }
}

impl std::fmt::Debug for VuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuContext")
            .field("uid", &self.uid)
            .field("vars", &self.vars)
            .field("namespaces", &self.sockets.keys().collect::<Vec<_>>())
            .field("success_count", &self.success_count)
            .field("pending_requests", &self.pending_requests)
            .field("received_messages", &self.received_message_count())
            .finish()
    }
}
