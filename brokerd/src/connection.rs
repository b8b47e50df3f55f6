// SPDX-License-Identifier: GPL-3.0-or-later

//! One client connection.
//!
//! A connection pairs an opaque 64 bit id with the byte stream to the
//! client and owns the transient handle map holding everything the
//! client has loaded. Sessions live in the shared session list keyed by
//! the connection id, so dropping the connection does not leave dangling
//! references.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;
use tpm2_proto::HandleType;

use crate::handle_map::HandleMap;

#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: UnixStream,
    transient_map: HandleMap,
    locality: AtomicU8,
    cancel: AtomicBool,
    doomed: AtomicBool,
    created: Instant,
}

impl Connection {
    /// A connection over `stream` with a fresh transient handle map
    /// bounded at `max_transient_objects`.
    #[must_use]
    pub fn new(id: u64, stream: UnixStream, max_transient_objects: u32) -> Connection {
        Connection {
            id,
            stream,
            transient_map: HandleMap::new(HandleType::Transient, max_transient_objects),
            locality: AtomicU8::new(0),
            cancel: AtomicBool::new(false),
            doomed: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[must_use]
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    #[must_use]
    pub fn transient_map(&self) -> &HandleMap {
        &self.transient_map
    }

    #[must_use]
    pub fn locality(&self) -> u8 {
        self.locality.load(Ordering::Relaxed)
    }

    pub fn set_locality(&self, locality: u8) {
        self.locality.store(locality, Ordering::Relaxed);
    }

    /// Flag the next pending command for cancellation.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Consume a pending cancellation request.
    pub fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    /// Mark the connection for teardown after the in-flight response.
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }
}
