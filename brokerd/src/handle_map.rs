// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-connection virtual handle map.
//!
//! Each connection gets one map per virtualized handle type. The map
//! mints virtual handles from a 24 bit counter under the type byte and
//! pairs them with the physical handle the TPM allocated plus, when the
//! object has been evicted, the saved context blob. The map is a pure
//! data structure; it knows nothing about the TPM.

use log::warn;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tpm2_proto::{HandleType, HR_RANGE_MASK, HR_SHIFT};

/// Default bound on entries per map.
pub const MAX_ENTRIES_DEFAULT: u32 = 27;

/// Hard ceiling on the configurable bound.
pub const MAX_ENTRIES_MAX: u32 = 100;

/// Monotonic recency stamps shared by every map in the process, so the
/// eviction scan can order entries across connections.
static USE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next recency stamp.
pub fn next_use_stamp() -> u64 {
    USE_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One virtualized object.
///
/// An empty `context` means the object is currently loaded in the TPM
/// under `phandle`; a non-empty `context` is the blob `ContextSave`
/// returned when the object was evicted.
#[derive(Debug)]
pub struct HandleMapEntry {
    pub phandle: u32,
    pub vhandle: u32,
    pub context: Vec<u8>,
    pub last_used: u64,
}

impl HandleMapEntry {
    #[must_use]
    pub fn new(phandle: u32, vhandle: u32) -> HandleMapEntry {
        HandleMapEntry {
            phandle,
            vhandle,
            context: Vec::new(),
            last_used: next_use_stamp(),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.context.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_used = next_use_stamp();
    }
}

/// Shared reference to a map entry. Cloning the `Arc` is the lookup
/// guard that keeps the entry alive for the caller's scope.
pub type EntryRef = Arc<Mutex<HandleMapEntry>>;

struct Inner {
    handle_count: u32,
    entries: BTreeMap<u32, EntryRef>,
}

pub struct HandleMap {
    handle_type: HandleType,
    max_entries: u32,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for HandleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleMap")
            .field("handle_type", &self.handle_type)
            .field("size", &self.size())
            .finish()
    }
}

impl HandleMap {
    /// A map for handles of `handle_type`, bounded at `max_entries`.
    ///
    /// The virtual handle counter starts at 0xff, an arbitrary way to
    /// tell broker-minted handles apart from the ones the TPM allocates.
    #[must_use]
    pub fn new(handle_type: HandleType, max_entries: u32) -> HandleMap {
        HandleMap {
            handle_type,
            max_entries,
            inner: Mutex::new(Inner {
                handle_count: 0xff,
                entries: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn handle_type(&self) -> HandleType {
        self.handle_type
    }

    /// Combine the handle type and the counter into a fresh virtual
    /// handle, advancing the counter. Returns 0 once the 24 bit counter
    /// has rolled over into the type byte.
    pub fn next_vhandle(&self) -> u32 {
        let mut inner = self.inner.lock().expect("handle map mutex poisoned");
        if inner.handle_count & HR_RANGE_MASK != 0 {
            return 0;
        }
        let handle = (u32::from(self.handle_type as u8) << HR_SHIFT) | inner.handle_count;
        inner.handle_count += 1;
        handle
    }

    /// Insert `entry` under `vhandle`. Fails when the map is at its
    /// bound or `vhandle` is 0. A duplicate insertion replaces the
    /// prior entry.
    pub fn insert(&self, vhandle: u32, entry: EntryRef) -> bool {
        if vhandle == 0 {
            return false;
        }
        let mut inner = self.inner.lock().expect("handle map mutex poisoned");
        if inner.entries.len() >= self.max_entries as usize {
            warn!(
                "handle map: max_entries of {} exceeded",
                self.max_entries
            );
            return false;
        }
        inner.entries.insert(vhandle, entry);
        true
    }

    /// Entry for `vhandle`; the clone keeps it alive for the caller.
    #[must_use]
    pub fn vlookup(&self, vhandle: u32) -> Option<EntryRef> {
        let inner = self.inner.lock().expect("handle map mutex poisoned");
        inner.entries.get(&vhandle).cloned()
    }

    /// Remove the entry for `vhandle`, reporting whether one existed.
    pub fn remove(&self, vhandle: u32) -> bool {
        let mut inner = self.inner.lock().expect("handle map mutex poisoned");
        inner.entries.remove(&vhandle).is_some()
    }

    /// Drop every entry, used when the owning connection is reaped.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("handle map mutex poisoned");
        inner.entries.clear();
    }

    #[must_use]
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().expect("handle map mutex poisoned");
        inner.entries.len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() >= self.max_entries as usize
    }

    /// Snapshot of the entries, in virtual handle order.
    #[must_use]
    pub fn entries(&self) -> Vec<EntryRef> {
        let inner = self.inner.lock().expect("handle map mutex poisoned");
        inner.entries.values().cloned().collect()
    }
}
