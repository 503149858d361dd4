//! User directory: UID → signing and device-encryption keys.
//!
//! Each server runs two instances: a `local` authoritative directory for the
//! domains it owns, and an `external` cache fed by federation links. A lookup
//! is answered locally when the UID's domain is one of the configured local
//! domains; otherwise the server ensures a federation link to the UID's
//! domain, forwards the request over it, and waits (bounded) for the matching
//! response, falling back to the cache.

use crate::metrics::counters;
use crate::router;
use crate::server::ServerState;
use siren_common::uid::Uid;
use siren_common::wire::Payload;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// How long an external lookup waits for the federation response before
/// answering from the cache.
pub const FEDERATION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A user's long-lived identity signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSigningKey {
    /// Raw Ed25519 public key bytes.
    pub public_key: Vec<u8>,
}

/// A user's device-scoped encryption keys.
#[derive(Debug, Clone)]
pub struct DeviceEncryptionKey {
    /// One entry per registered device.
    pub public_keys: Vec<Vec<u8>>,
    /// When this record was last written.
    pub last_seen: SystemTime,
}

/// A resolved directory record, as delivered to lookup waiters.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRecord {
    /// User signing key bytes, empty when unknown.
    pub user_signing_key: Vec<u8>,
    /// Device encryption keys, empty when unknown.
    pub device_encryption_keys: Vec<Vec<u8>>,
}

/// One directory instance: either the local authoritative store or the
/// external cache.
pub struct Directory {
    usk: RwLock<HashMap<String, UserSigningKey>>,
    dek: RwLock<HashMap<String, DeviceEncryptionKey>>,
    // Waiters for in-flight federation lookups, keyed by UID.
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<DirectoryRecord>>>>,
}

impl Directory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            usk: RwLock::new(HashMap::new()),
            dek: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a user's keys.
    pub fn register_user(&self, uid: &str, user_signing_key: Vec<u8>, device_keys: Vec<Vec<u8>>) {
        self.usk.write().expect("directory lock poisoned").insert(
            uid.to_owned(),
            UserSigningKey {
                public_key: user_signing_key,
            },
        );
        self.dek.write().expect("directory lock poisoned").insert(
            uid.to_owned(),
            DeviceEncryptionKey {
                public_keys: device_keys,
                last_seen: SystemTime::now(),
            },
        );
    }

    /// Builds a `DirectoryResponse` from whatever this instance holds for
    /// `uid`. Missing fields default to empty; this never fails.
    #[must_use]
    pub fn response_for(&self, uid: &str) -> Payload {
        let user_signing_key = self
            .usk
            .read()
            .expect("directory lock poisoned")
            .get(uid)
            .map(|k| k.public_key.clone())
            .unwrap_or_default();
        let device_encryption_keys = self
            .dek
            .read()
            .expect("directory lock poisoned")
            .get(uid)
            .map(|k| k.public_keys.clone())
            .unwrap_or_default();
        Payload::directory_response(uid, user_signing_key, device_encryption_keys)
    }

    /// Registers a waiter for the next record delivered for `uid`.
    pub fn register_waiter(&self, uid: &str) -> oneshot::Receiver<DirectoryRecord> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("directory lock poisoned")
            .entry(uid.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Drops waiters whose receivers have gone away (lookup timed out).
    pub fn prune_waiters(&self, uid: &str) {
        let mut pending = self.pending.lock().expect("directory lock poisoned");
        if let Some(waiters) = pending.get_mut(uid) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(uid);
            }
        }
    }

    /// Delivers a record received over a federation link: caches the
    /// non-empty fields and wakes every waiter registered for `uid`.
    pub fn complete(&self, uid: &str, user_signing_key: Vec<u8>, device_keys: Vec<Vec<u8>>) {
        if !user_signing_key.is_empty() {
            self.usk.write().expect("directory lock poisoned").insert(
                uid.to_owned(),
                UserSigningKey {
                    public_key: user_signing_key.clone(),
                },
            );
        }
        if !device_keys.is_empty() {
            self.dek.write().expect("directory lock poisoned").insert(
                uid.to_owned(),
                DeviceEncryptionKey {
                    public_keys: device_keys.clone(),
                    last_seen: SystemTime::now(),
                },
            );
        }
        let waiters = self
            .pending
            .lock()
            .expect("directory lock poisoned")
            .remove(uid)
            .unwrap_or_default();
        let record = DirectoryRecord {
            user_signing_key,
            device_encryption_keys: device_keys,
        };
        for waiter in waiters {
            let _ = waiter.send(record.clone());
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers a directory request, dispatching to the local directory or the
/// external path by the UID's domain.
///
/// The lookup runs in its own task and delivers its answer over a one-shot
/// channel; the calling connection reader blocks on it before enqueueing the
/// response to the peer.
pub async fn lookup(state: &Arc<ServerState>, uid: &Uid) -> Payload {
    let (tx, rx) = oneshot::channel();
    let task_state = state.clone();
    let task_uid = uid.clone();
    tokio::spawn(async move {
        let response = if task_state.is_local_domain(task_uid.domain()) {
            counters::directory_lookups_total("local");
            task_state.local_directory.response_for(&task_uid.to_string())
        } else {
            counters::directory_lookups_total("external");
            lookup_external(&task_state, &task_uid).await
        };
        let _ = tx.send(response);
    });
    match rx.await {
        Ok(response) => response,
        // The lookup task cannot outlive its send, but an empty answer is
        // always a valid fallback.
        Err(_) => Payload::directory_response(uid.to_string(), Vec::new(), Vec::new()),
    }
}

/// External path: ensure a federation link to the UID's domain, forward the
/// request, and wait (bounded) for the correlated response.
async fn lookup_external(state: &Arc<ServerState>, uid: &Uid) -> Payload {
    let uid_str = uid.to_string();
    if let Some(handle) = router::initiate_outgoing(state, uid.domain()).await {
        // The request must not hit the link before it authenticates, or the
        // pre-auth queue policy would drop it.
        if timeout(FEDERATION_LOOKUP_TIMEOUT, handle.shared.wait_authenticated())
            .await
            .is_err()
        {
            debug!(uid = %uid_str, "federation link did not authenticate in time");
            return state.external_directory.response_for(&uid_str);
        }
        let waiter = state.external_directory.register_waiter(&uid_str);
        let request = Payload::directory_request(uid_str.clone());
        if handle.encrypted_tx.send(request).await.is_ok() {
            match timeout(FEDERATION_LOOKUP_TIMEOUT, waiter).await {
                Ok(Ok(record)) => {
                    return Payload::directory_response(
                        uid_str,
                        record.user_signing_key,
                        record.device_encryption_keys,
                    );
                }
                Ok(Err(_)) | Err(_) => {
                    debug!(uid = %uid_str, "federation lookup yielded no response");
                }
            }
        }
        state.external_directory.prune_waiters(&uid_str);
    }
    state.external_directory.response_for(&uid_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directory_answers_with_empty_fields() {
        let directory = Directory::new();
        let response = directory.response_for("ghost@test.com");
        assert_eq!(
            response,
            Payload::directory_response("ghost@test.com", Vec::new(), Vec::new())
        );
    }

    #[test]
    fn registered_user_is_returned() {
        let directory = Directory::new();
        directory.register_user("test@test.com", vec![1; 32], vec![vec![2; 32], vec![3; 32]]);

        let response = directory.response_for("test@test.com");
        assert_eq!(
            response,
            Payload::directory_response(
                "test@test.com",
                vec![1; 32],
                vec![vec![2; 32], vec![3; 32]]
            )
        );
    }

    #[tokio::test]
    async fn complete_wakes_registered_waiters() {
        let directory = Directory::new();
        let waiter_a = directory.register_waiter("user@remote.example");
        let waiter_b = directory.register_waiter("user@remote.example");

        directory.complete("user@remote.example", vec![9; 32], vec![vec![8; 32]]);

        let record_a = waiter_a.await.unwrap();
        let record_b = waiter_b.await.unwrap();
        assert_eq!(record_a.user_signing_key, vec![9; 32]);
        assert_eq!(record_b.device_encryption_keys, vec![vec![8; 32]]);
    }

    #[tokio::test]
    async fn complete_populates_cache() {
        let directory = Directory::new();
        directory.complete("user@remote.example", vec![9; 32], vec![vec![8; 32]]);

        let response = directory.response_for("user@remote.example");
        assert_eq!(
            response,
            Payload::directory_response("user@remote.example", vec![9; 32], vec![vec![8; 32]])
        );
    }

    #[tokio::test]
    async fn empty_completion_does_not_clobber_cache() {
        let directory = Directory::new();
        directory.register_user("user@remote.example", vec![9; 32], vec![vec![8; 32]]);
        directory.complete("user@remote.example", Vec::new(), Vec::new());

        let response = directory.response_for("user@remote.example");
        assert_eq!(
            response,
            Payload::directory_response("user@remote.example", vec![9; 32], vec![vec![8; 32]])
        );
    }

    #[tokio::test]
    async fn prune_drops_closed_waiters() {
        let directory = Directory::new();
        let waiter = directory.register_waiter("user@remote.example");
        drop(waiter);
        directory.prune_waiters("user@remote.example");
        assert!(directory
            .pending
            .lock()
            .unwrap()
            .get("user@remote.example")
            .is_none());
    }
}
