use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use relay_core::{Expr, ExprError, Message};
use tokio::time::Instant;

use super::ledger::Ledger;
use super::operator::Verdict;

type Digest = [u8; 32];

/// Drops messages whose key was already seen within the window.
///
/// The window holds at most `capacity` keys (oldest evicted first) and,
/// when a TTL is set, forgets keys older than the TTL. A null key is never
/// treated as a duplicate. A key remembered during a send that later fails
/// is forgotten again through the ledger.
pub(crate) struct Dedup {
    key: Expr,
    capacity: usize,
    ttl: Option<Duration>,
    seen: Arc<Mutex<SeenKeys>>,
}

#[derive(Default)]
struct SeenKeys {
    order: VecDeque<(Digest, Instant)>,
    keys: AHashMap<Digest, u64>,
    next_id: u64,
}

impl SeenKeys {
    /// Records `digest`. Returns the record id, or `None` if it was already present.
    fn observe(&mut self, digest: Digest, now: Instant, capacity: usize, ttl: Option<Duration>) -> Option<u64> {
        if let Some(ttl) = ttl {
            while let Some(&(old, at)) = self.order.front() {
                if now.duration_since(at) < ttl {
                    break;
                }
                self.order.pop_front();
                self.keys.remove(&old);
            }
        }
        if self.keys.contains_key(&digest) {
            return None;
        }
        self.next_id += 1;
        self.keys.insert(digest, self.next_id);
        self.order.push_back((digest, now));
        while self.order.len() > capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        Some(self.next_id)
    }

    /// Drops the record `id` of `digest`, unless it was already evicted or replaced.
    fn forget(&mut self, digest: &Digest, id: u64) {
        if self.keys.get(digest) == Some(&id) {
            self.keys.remove(digest);
            self.order.retain(|(d, _)| d != digest);
        }
    }
}

impl Dedup {
    pub(crate) fn new(key: Expr, capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            key,
            capacity,
            ttl,
            seen: Arc::new(Mutex::new(SeenKeys::default())),
        }
    }

    pub(crate) fn evaluate(&self, message: Message, ledger: &mut Ledger) -> Result<Verdict, ExprError> {
        let key = self.key.eval(&message)?;
        if key.is_null() {
            return Ok(Verdict::Forward(message));
        }
        let digest = *blake3::hash(&key.canonical_bytes()).as_bytes();
        let recorded = self
            .seen
            .lock()
            .observe(digest, Instant::now(), self.capacity, self.ttl);
        let Some(id) = recorded else {
            return Ok(Verdict::Drop);
        };
        let seen = Arc::clone(&self.seen);
        ledger.record(move || seen.lock().forget(&digest, id));
        Ok(Verdict::Forward(message))
    }
}
