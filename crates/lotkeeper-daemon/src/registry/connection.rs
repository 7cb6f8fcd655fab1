//! Gateway connection state and the facility-keyed registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lotkeeper_proto::codec::{self, FrameError};

use crate::storage::RequestKind;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A check sent to the gateway that has not been answered yet.
///
/// Holds the timeout task so whoever wins the race (reply or timer)
/// can abort the loser. Removal from the pending map is the single
/// point of resolution: whichever side gets the entry acts, the other
/// finds nothing and does nothing.
pub struct InFlight {
    /// Verification request this check belongs to.
    pub request_id: i64,
    pub kind: RequestKind,
    /// Timeout task; aborted when the reply arrives first.
    pub timer: JoinHandle<()>,
}

/// One authenticated gateway connection.
pub struct FacilityConnection {
    pub facility_id: i64,
    pub device_id: i64,
    writer: Mutex<BoxWriter>,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, InFlight>>,
}

impl FacilityConnection {
    pub fn new(facility_id: i64, device_id: i64, writer: BoxWriter) -> Self {
        Self {
            facility_id,
            device_id,
            writer: Mutex::new(writer),
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Next request sequence number. Monotonic per connection; gateways
    /// echo it back as `eventSeq`.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Write one framed message to the gateway.
    pub async fn send<M: Serialize>(&self, message: &M) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, message).await
    }

    /// Track an outstanding check under its sequence number.
    pub async fn insert_pending(&self, seq: u64, entry: InFlight) {
        self.pending.lock().await.insert(seq, entry);
    }

    /// Atomically claim a pending check. Exactly one caller gets `Some`
    /// for a given sequence number.
    pub async fn take_pending(&self, seq: u64) -> Option<InFlight> {
        self.pending.lock().await.remove(&seq)
    }

    /// Abort every outstanding timeout timer. Used when this connection
    /// is superseded by a re-authentication; its checks are orphaned and
    /// must not fire fallbacks against the replacement.
    pub async fn cancel_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }

    /// Close the write half. Errors are ignored; the socket may already
    /// be gone.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Thread-safe registry of authenticated gateway connections, keyed by
/// facility. At most one connection per facility.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<i64, Arc<FacilityConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection for a facility.
    ///
    /// A later authentication supersedes an earlier one: the old
    /// connection's timers are cancelled and its socket closed, then it
    /// is replaced in the map.
    pub async fn register(&self, conn: Arc<FacilityConnection>) {
        let old = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.facility_id, Arc::clone(&conn))
        };
        if let Some(old) = old {
            warn!(
                facility_id = old.facility_id,
                device_id = old.device_id,
                "Gateway connection superseded by re-authentication"
            );
            old.cancel_all_pending().await;
            old.shutdown().await;
        }
        info!(
            facility_id = conn.facility_id,
            device_id = conn.device_id,
            "Gateway connection registered"
        );
    }

    /// Remove a connection, but only if it is still the current one for
    /// its facility. A superseded connection's death must not evict its
    /// replacement.
    ///
    /// Timers on the removed connection keep running: their requests
    /// still deserve a timeout fallback.
    pub async fn unregister(&self, conn: &Arc<FacilityConnection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&conn.facility_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(&conn.facility_id);
                info!(facility_id = conn.facility_id, "Gateway connection unregistered");
                true
            }
            _ => false,
        }
    }

    /// Get the connection for a facility.
    pub async fn get(&self, facility_id: i64) -> Option<Arc<FacilityConnection>> {
        self.connections.read().await.get(&facility_id).cloned()
    }

    pub async fn is_connected(&self, facility_id: i64) -> bool {
        self.connections.read().await.contains_key(&facility_id)
    }

    /// All facilities with a live gateway connection.
    pub async fn connected_facilities(&self) -> Vec<i64> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lotkeeper_proto::Heartbeat;

    fn test_connection(facility_id: i64) -> (Arc<FacilityConnection>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(4096);
        let conn = Arc::new(FacilityConnection::new(facility_id, 900, Box::new(local)));
        (conn, remote)
    }

    fn idle_timer() -> JoinHandle<()> {
        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        })
    }

    #[tokio::test]
    async fn seq_is_monotonic() {
        let (conn, _remote) = test_connection(1);
        let first = conn.next_seq();
        let second = conn.next_seq();
        assert!(second > first);
    }

    #[tokio::test]
    async fn send_writes_a_frame() {
        let (conn, mut remote) = test_connection(1);
        conn.send(&Heartbeat::new()).await.unwrap();

        let payload = codec::read_frame(&mut remote).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["cmd"], 4);
    }

    #[tokio::test]
    async fn take_pending_resolves_exactly_once() {
        let (conn, _remote) = test_connection(1);
        conn.insert_pending(
            7,
            InFlight {
                request_id: 42,
                kind: RequestKind::Entry,
                timer: idle_timer(),
            },
        )
        .await;

        let entry = conn.take_pending(7).await.unwrap();
        assert_eq!(entry.request_id, 42);
        entry.timer.abort();

        assert!(conn.take_pending(7).await.is_none());
    }

    #[tokio::test]
    async fn cancel_all_pending_aborts_timers() {
        let (conn, _remote) = test_connection(1);
        for seq in 0..3 {
            conn.insert_pending(
                seq,
                InFlight {
                    request_id: seq as i64,
                    kind: RequestKind::Exit,
                    timer: idle_timer(),
                },
            )
            .await;
        }
        assert_eq!(conn.pending_count().await, 3);
        conn.cancel_all_pending().await;
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn reauth_supersedes_old_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _old_remote) = test_connection(1);
        let (new, _new_remote) = test_connection(1);

        registry.register(Arc::clone(&old)).await;
        old.insert_pending(
            1,
            InFlight {
                request_id: 10,
                kind: RequestKind::Entry,
                timer: idle_timer(),
            },
        )
        .await;

        registry.register(Arc::clone(&new)).await;
        assert_eq!(registry.connection_count().await, 1);
        // Superseded connection lost its timers.
        assert_eq!(old.pending_count().await, 0);

        // The old connection's death must not evict the replacement.
        assert!(!registry.unregister(&old).await);
        assert!(registry.is_connected(1).await);

        assert!(registry.unregister(&new).await);
        assert!(!registry.is_connected(1).await);
    }

    #[tokio::test]
    async fn connected_facilities_list() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = test_connection(1);
        let (b, _rb) = test_connection(2);
        registry.register(a).await;
        registry.register(b).await;

        let mut facilities = registry.connected_facilities().await;
        facilities.sort_unstable();
        assert_eq!(facilities, vec![1, 2]);
    }
}
