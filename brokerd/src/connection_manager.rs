// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded registry of live connections.
//!
//! Connections are indexed twice: by the client-side descriptor for I/O
//! readiness and by the opaque 64 bit id clients use in administrative
//! calls. Both indices are mutated under the same mutex and never
//! diverge. Subscribers are notified synchronously, still under the
//! registry lock, when a connection appears or disappears; the resource
//! manager uses the removal event to reap all TPM state the connection
//! owned.

use log::{debug, warn};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;

/// Default bound on concurrent connections.
pub const MAX_CONNECTIONS_DEFAULT: u32 = 27;

/// Hard ceiling on the configurable bound.
pub const MAX_CONNECTIONS_MAX: u32 = 100;

type Subscriber = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

struct Inner {
    by_fd: HashMap<RawFd, Arc<Connection>>,
    by_id: HashMap<u64, Arc<Connection>>,
    on_new: Vec<Subscriber>,
    on_removed: Vec<Subscriber>,
}

pub struct ConnectionManager {
    max_connections: u32,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(max_connections: u32) -> ConnectionManager {
        ConnectionManager {
            max_connections,
            inner: Mutex::new(Inner {
                by_fd: HashMap::new(),
                by_id: HashMap::new(),
                on_new: Vec::new(),
                on_removed: Vec::new(),
            }),
        }
    }

    /// Subscribe to insertions. The callback runs synchronously under
    /// the registry lock and must not call back into the registry.
    pub fn subscribe_new(&self, subscriber: Subscriber) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.on_new.push(subscriber);
    }

    /// Subscribe to removals, same contract as [`subscribe_new`].
    ///
    /// [`subscribe_new`]: ConnectionManager::subscribe_new
    pub fn subscribe_removed(&self, subscriber: Subscriber) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.on_removed.push(subscriber);
    }

    /// Register `connection`. Fails when the registry is at its bound.
    pub fn insert(&self, connection: Arc<Connection>) -> bool {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner.by_fd.len() >= self.max_connections as usize {
            warn!(
                "connection registry: max_connections of {} exceeded",
                self.max_connections
            );
            return false;
        }
        inner.by_fd.insert(connection.fd(), connection.clone());
        inner.by_id.insert(connection.id(), connection.clone());
        debug!("connection {:#018x}: registered", connection.id());
        for subscriber in &inner.on_new {
            subscriber(&connection);
        }
        true
    }

    /// Deregister `connection` and notify subscribers. Reports whether
    /// the connection was present; removal is idempotent so the worker
    /// and finalization can race on it safely.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if inner.by_id.remove(&connection.id()).is_none() {
            return false;
        }
        inner.by_fd.remove(&connection.fd());
        debug!("connection {:#018x}: removed", connection.id());
        for subscriber in &inner.on_removed {
            subscriber(connection);
        }
        true
    }

    /// Deregister everything, notifying subscribers per connection.
    pub fn remove_all(&self) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let connections: Vec<Arc<Connection>> = inner.by_id.values().cloned().collect();
        inner.by_fd.clear();
        inner.by_id.clear();
        for connection in &connections {
            for subscriber in &inner.on_removed {
                subscriber(connection);
            }
        }
    }

    #[must_use]
    pub fn lookup_fd(&self, fd: RawFd) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_fd.get(&fd).cloned()
    }

    #[must_use]
    pub fn lookup_id(&self, id: u64) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.get(&id).cloned()
    }

    #[must_use]
    pub fn contains_id(&self, id: u64) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.contains_key(&id)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_fd.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() >= self.max_connections as usize
    }

    /// Snapshot of the live connections, in no particular order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.values().cloned().collect()
    }
}
