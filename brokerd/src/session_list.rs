// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared list of live authorization sessions.
//!
//! Sessions are not virtualized; the TPM hands their handles straight
//! to clients. The broker still tracks every session so it can save and
//! reload them across command boundaries and flush them when their
//! connection dies. The list is kept in most-recently-loaded order:
//! head entries were touched last, eviction takes from the tail.

use log::warn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default bound on tracked sessions.
pub const MAX_ENTRIES_DEFAULT: u32 = 27;

/// Hard ceiling on the configurable bound.
pub const MAX_ENTRIES_MAX: u32 = 100;

/// One tracked session. An empty `context` means the session is loaded
/// in the TPM; a non-empty one is the blob from its last `ContextSave`.
#[derive(Debug)]
pub struct SessionEntry {
    pub connection_id: u64,
    pub phandle: u32,
    pub context: Vec<u8>,
}

impl SessionEntry {
    #[must_use]
    pub fn new(connection_id: u64, phandle: u32) -> SessionEntry {
        SessionEntry {
            connection_id,
            phandle,
            context: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.context.is_empty()
    }
}

/// Shared reference to a session entry.
pub type SessionRef = Arc<Mutex<SessionEntry>>;

pub struct SessionList {
    max_entries: u32,
    entries: Mutex<VecDeque<SessionRef>>,
}

impl SessionList {
    #[must_use]
    pub fn new(max_entries: u32) -> SessionList {
        SessionList {
            max_entries,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Prepend a fresh session. Fails when the list is at its bound.
    pub fn insert(&self, entry: SessionEntry) -> bool {
        let mut entries = self.entries.lock().expect("session list mutex poisoned");
        if entries.len() >= self.max_entries as usize {
            warn!("session list: max_entries of {} exceeded", self.max_entries);
            return false;
        }
        entries.push_front(Arc::new(Mutex::new(entry)));
        true
    }

    /// First entry whose physical handle is `handle`.
    #[must_use]
    pub fn lookup_handle(&self, handle: u32) -> Option<SessionRef> {
        let entries = self.entries.lock().expect("session list mutex poisoned");
        entries
            .iter()
            .find(|e| e.lock().expect("session entry mutex poisoned").phandle == handle)
            .cloned()
    }

    /// First entry owned by `connection_id`.
    #[must_use]
    pub fn lookup_connection(&self, connection_id: u64) -> Option<SessionRef> {
        let entries = self.entries.lock().expect("session list mutex poisoned");
        entries
            .iter()
            .find(|e| {
                e.lock().expect("session entry mutex poisoned").connection_id == connection_id
            })
            .cloned()
    }

    /// Remove the entry for `handle`, reporting whether one existed.
    pub fn remove_handle(&self, handle: u32) -> bool {
        let mut entries = self.entries.lock().expect("session list mutex poisoned");
        let before = entries.len();
        entries.retain(|e| e.lock().expect("session entry mutex poisoned").phandle != handle);
        entries.len() != before
    }

    /// Remove and return every session owned by `connection_id`.
    pub fn take_connection(&self, connection_id: u64) -> Vec<SessionRef> {
        let mut entries = self.entries.lock().expect("session list mutex poisoned");
        let mut taken = Vec::new();
        entries.retain(|e| {
            let owned =
                e.lock().expect("session entry mutex poisoned").connection_id == connection_id;
            if owned {
                taken.push(e.clone());
            }
            !owned
        });
        taken
    }

    /// Move `entry` to the head, marking it most recently loaded.
    pub fn move_to_head(&self, entry: &SessionRef) {
        let mut entries = self.entries.lock().expect("session list mutex poisoned");
        if let Some(position) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            let e = entries.remove(position).expect("position just found");
            entries.push_front(e);
        }
    }

    /// Number of tracked sessions currently loaded in the TPM.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        let entries = self.entries.lock().expect("session list mutex poisoned");
        entries
            .iter()
            .filter(|e| e.lock().expect("session entry mutex poisoned").is_loaded())
            .count()
    }

    /// Snapshot in list order, head (most recently loaded) first.
    #[must_use]
    pub fn entries(&self) -> Vec<SessionRef> {
        let entries = self.entries.lock().expect("session list mutex poisoned");
        entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.lock().expect("session list mutex poisoned").len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() >= self.max_entries as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_orders_head_first() {
        let list = SessionList::new(10);
        assert!(list.insert(SessionEntry::new(1, 0x0200_0001)));
        assert!(list.insert(SessionEntry::new(1, 0x0200_0002)));
        let snapshot = list.entries();
        assert_eq!(snapshot[0].lock().unwrap().phandle, 0x0200_0002);
        assert_eq!(snapshot[1].lock().unwrap().phandle, 0x0200_0001);
    }

    #[test]
    fn insert_rejects_when_full() {
        let list = SessionList::new(1);
        assert!(list.insert(SessionEntry::new(1, 0x0200_0001)));
        assert!(list.is_full());
        assert!(!list.insert(SessionEntry::new(1, 0x0200_0002)));
        assert_eq!(list.size(), 1);
    }

    #[test]
    fn lookup_and_remove_by_handle() {
        let list = SessionList::new(10);
        list.insert(SessionEntry::new(7, 0x0200_0001));
        assert!(list.lookup_handle(0x0200_0001).is_some());
        assert!(list.lookup_handle(0x0200_0002).is_none());
        assert!(list.remove_handle(0x0200_0001));
        assert!(!list.remove_handle(0x0200_0001));
    }

    #[test]
    fn take_connection_takes_only_that_connection() {
        let list = SessionList::new(10);
        list.insert(SessionEntry::new(1, 0x0200_0001));
        list.insert(SessionEntry::new(2, 0x0200_0002));
        list.insert(SessionEntry::new(1, 0x0200_0003));

        let taken = list.take_connection(1);
        assert_eq!(taken.len(), 2);
        assert_eq!(list.size(), 1);
        assert_eq!(list.entries()[0].lock().unwrap().connection_id, 2);
    }

    #[test]
    fn move_to_head_reorders() {
        let list = SessionList::new(10);
        list.insert(SessionEntry::new(1, 0x0200_0001));
        list.insert(SessionEntry::new(1, 0x0200_0002));
        let tail = list.lookup_handle(0x0200_0001).unwrap();
        list.move_to_head(&tail);
        assert_eq!(list.entries()[0].lock().unwrap().phandle, 0x0200_0001);
    }

    #[test]
    fn loaded_count_ignores_saved_entries() {
        let list = SessionList::new(10);
        list.insert(SessionEntry::new(1, 0x0200_0001));
        list.insert(SessionEntry::new(1, 0x0200_0002));
        assert_eq!(list.loaded_count(), 2);
        list.lookup_handle(0x0200_0001)
            .unwrap()
            .lock()
            .unwrap()
            .context = vec![1, 2, 3];
        assert_eq!(list.loaded_count(), 1);
    }
}
