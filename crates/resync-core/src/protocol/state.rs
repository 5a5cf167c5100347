//! Bookkeeping shared by the protocol handlers.
//!
//! - `PendingRequests`: outstanding `getResourceRequest`s by callback id
//! - `RemoteProjects`: which projects each peer announced
//! - `SyncStats`: counters for monitoring

use crate::resource::{normalize_path, now_millis};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Default lifetime of an unanswered request (60 seconds).
pub const DEFAULT_REQUEST_TTL_MS: i64 = 60_000;

/// A fetch we issued and have not seen answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub project: String,
    pub path: String,
    /// When the request was issued (ms since epoch)
    pub issued_at: i64,
}

/// Outstanding requests keyed by callback id.
///
/// A response is only applied if it consumes one of these entries, so
/// duplicated or foreign responses are ignored.
pub struct PendingRequests {
    requests: Mutex<HashMap<String, PendingRequest>>,
    ttl_ms: i64,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_REQUEST_TTL_MS)
    }
}

impl PendingRequests {
    pub fn with_ttl(ttl_ms: i64) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            ttl_ms,
        }
    }

    /// Record a new request and return its callback id.
    ///
    /// Expired entries are pruned on the way.
    pub fn issue(&self, project: &str, path: &str) -> String {
        self.issue_at(project, path, now_millis())
    }

    fn issue_at(&self, project: &str, path: &str, now: i64) -> String {
        let callback_id = uuid::Uuid::new_v4().to_string();
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl_ms;
        requests.retain(|_, r| now - r.issued_at <= ttl);
        requests.insert(
            callback_id.clone(),
            PendingRequest {
                project: project.to_string(),
                path: canonical(path),
                issued_at: now,
            },
        );
        callback_id
    }

    /// Consume the request `callback_id` if it was issued for `project`/`path`.
    ///
    /// Paths are compared in normalized form, so `./docs//a.txt` matches `docs/a.txt`.
    pub fn complete(&self, callback_id: &str, project: &str, path: &str) -> bool {
        let path = canonical(path);
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        match requests.get(callback_id) {
            Some(r) if r.project == project && r.path == path => {
                requests.remove(callback_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalized form of `path`; invalid paths are kept verbatim and never match a valid one.
fn canonical(path: &str) -> String {
    normalize_path(path).unwrap_or_else(|_| path.to_string())
}

/// Projects each connected peer announced via `projectConnected`.
#[derive(Default)]
pub struct RemoteProjects {
    by_peer: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl RemoteProjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self, peer: &str, project: &str) {
        self.by_peer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(peer.to_string())
            .or_default()
            .insert(project.to_string());
    }

    pub fn disconnected(&self, peer: &str, project: &str) {
        let mut by_peer = self.by_peer.write().unwrap_or_else(|e| e.into_inner());
        if let Some(projects) = by_peer.get_mut(peer) {
            projects.remove(project);
            if projects.is_empty() {
                by_peer.remove(peer);
            }
        }
    }

    /// Drop everything known about a peer (its connection closed).
    pub fn forget_peer(&self, peer: &str) {
        self.by_peer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
    }

    pub fn projects_of(&self, peer: &str) -> Vec<String> {
        self.by_peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Peers that announced `project`, sorted.
    pub fn peers_with(&self, project: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .by_peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, projects)| projects.contains(project))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

/// Protocol counters.
#[derive(Default)]
pub struct SyncStats {
    requests_sent: AtomicU64,
    responses_sent: AtomicU64,
    resources_stored: AtomicU64,
    resources_deleted: AtomicU64,
    acks_received: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatsSnapshot {
    pub requests_sent: u64,
    pub responses_sent: u64,
    pub resources_stored: u64,
    pub resources_deleted: u64,
    pub acks_received: u64,
}

impl SyncStats {
    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resource_stored(&self) {
        self.resources_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resource_deleted(&self) {
        self.resources_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            resources_stored: self.resources_stored.load(Ordering::Relaxed),
            resources_deleted: self.resources_deleted.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
        }
    }
}
