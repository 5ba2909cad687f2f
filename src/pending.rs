//! In-flight correlated requests.
//!
//! Entries are keyed by `(session, kind, request id)` so execution and export
//! ids never collide. Every entry is completed exactly once: by `resolve`, by
//! `expire` when its deadline fires, or by `cancel_all_for` when its session
//! goes away. Whichever comes first removes the entry; the others find nothing.

use std::{collections::HashMap, fmt, time::Duration};

use serde_json::Value;
use tokio::{sync::oneshot, task::AbortHandle, time::Instant};

use crate::error::BridgeError;

pub type Outcome = Result<Value, BridgeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Execute,
    Export,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute => f.write_str("execute"),
            Self::Export => f.write_str("export"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub session_id: String,
    pub kind: RequestKind,
    pub request_id: String,
}

impl PendingKey {
    pub fn new(session_id: &str, kind: RequestKind, request_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            request_id: request_id.to_string(),
        }
    }
}

struct PendingEntry {
    /// Distinguishes this entry from a later one reusing the same key.
    seq: u64,
    responder: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
    submitted_at: Instant,
}

impl PendingEntry {
    fn complete(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The waiter may have given up already.
        let _ = self.responder.send(outcome);
    }
}

#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<PendingKey, PendingEntry>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new entry and returns its sequence number plus the waiter.
    pub fn insert(&mut self, key: PendingKey) -> Result<(u64, PendingResponse), BridgeError> {
        if self.entries.contains_key(&key) {
            return Err(BridgeError::DuplicateRequest {
                request_id: key.request_id,
            });
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            key.clone(),
            PendingEntry {
                seq,
                responder: tx,
                timer: None,
                submitted_at: Instant::now(),
            },
        );

        Ok((seq, PendingResponse { key, rx }))
    }

    /// Attaches the deadline task so resolution can cancel it.
    pub fn attach_timer(&mut self, key: &PendingKey, seq: u64, timer: AbortHandle) {
        match self.entries.get_mut(key) {
            Some(entry) if entry.seq == seq => entry.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Completes the entry for `key` if it is still pending.
    ///
    /// Returns `false` for unknown, already resolved or expired keys.
    pub fn resolve(&mut self, key: &PendingKey, outcome: Outcome) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Fails the entry with `RequestTimeout`, but only if it is the same
    /// entry the deadline was started for.
    pub fn expire(&mut self, key: &PendingKey, seq: u64, timeout: Duration) -> bool {
        if self.entries.get(key).map(|entry| entry.seq) != Some(seq) {
            return false;
        }

        let Some(mut entry) = self.entries.remove(key) else {
            return false;
        };
        // The timer task is the caller here; aborting it would cancel ourselves.
        entry.timer = None;
        entry.complete(Err(BridgeError::RequestTimeout {
            request_id: key.request_id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }));
        true
    }

    /// Removes an entry without completing it; the waiter sees the drop.
    pub fn discard(&mut self, key: &PendingKey) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Fails every entry owned by `session_id` with `reason`.
    pub fn cancel_all_for(&mut self, session_id: &str, reason: &BridgeError) -> usize {
        let keys = self
            .entries
            .keys()
            .filter(|key| key.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();

        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                entry.complete(Err(reason.clone()));
            }
        }

        keys.len()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn count_for(&self, session_id: &str) -> usize {
        self.entries
            .keys()
            .filter(|key| key.session_id == session_id)
            .count()
    }

    pub fn age(&self, key: &PendingKey) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|entry| entry.submitted_at.elapsed())
    }
}

/// Caller-side handle for one pending request.
#[derive(Debug)]
pub struct PendingResponse {
    key: PendingKey,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.key.request_id
    }

    /// Suspends until the request is resolved, expires, or its session drops.
    pub async fn wait(self) -> Outcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::connection_lost("request was abandoned")),
        }
    }
}
