use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Live connections, keyed by connection id.
///
/// Two live connections can share a peer address (the first one may not have noticed its socket
/// closed yet), so the address is kept in the entry rather than used as the key. The map is only
/// touched under its own lock and the lock is never held across I/O. The live counter is kept
/// next to it as an atomic so admission control can read it without locking.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<Uuid, Entry>>,
    live: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub addr: SocketAddr,
    pub connected_at: Instant,
    force_close: CancellationToken,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Number of registered connections.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_full(&self, max_connections: usize) -> bool {
        self.live() >= max_connections
    }

    /// Registers a connection. It stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, addr: SocketAddr, id: Uuid) -> Registration {
        let force_close = CancellationToken::new();
        let entry = Entry {
            addr,
            connected_at: Instant::now(),
            force_close: force_close.clone(),
        };

        self.lock().insert(id, entry);
        self.live.fetch_add(1, Ordering::SeqCst);

        Registration {
            registry: Arc::clone(self),
            addr,
            id,
            force_close,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Entry> {
        self.lock().get(id).cloned()
    }

    /// Peer addresses of every registered connection, one per connection.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.lock().values().map(|entry| entry.addr).collect()
    }

    /// Signals every registered connection to close at once. Returns how many were signalled.
    pub fn force_close_all(&self) -> usize {
        let connections = self.lock();
        for (id, entry) in connections.iter() {
            warn!(
                connection_id = %id,
                connected_for = ?entry.connected_at.elapsed(),
                "Forcing connection from {} closed",
                entry.addr
            );
            entry.force_close.cancel();
        }
        connections.len()
    }

    fn unregister(&self, id: &Uuid) {
        if self.lock().remove(id).is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that a connection is registered. Dropping it removes the connection, exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<Registry>,
    addr: SocketAddr,
    id: Uuid,
    force_close: CancellationToken,
}

impl Registration {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the server gives up waiting for this connection to finish on its own.
    pub fn force_close(&self) -> &CancellationToken {
        &self.force_close
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
