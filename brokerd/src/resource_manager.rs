// SPDX-License-Identifier: GPL-3.0-or-later

//! The policy brain of the broker.
//!
//! Every client command passes through [`ResourceManager::service_command`]
//! before and after its trip to the TPM: virtual handles are swapped for
//! physical ones (loading saved contexts and evicting others to make
//! room), auth sessions are reloaded, and newly allocated handles are
//! captured into the per-connection maps with the response rewritten to
//! the virtual handle. Everything a connection owns is flushed when it
//! disappears.
//!
//! Lock order: connection registry, then session list, then a handle
//! map, then the TPM gate. Nothing here takes two locks of one level at
//! a time.

use log::{debug, warn};
use std::sync::Arc;
use tpm2_proto::{rc_handle_number, Command, HandleType, ResponseCode};

use crate::access_broker::AccessBroker;
use crate::command::Tpm2Command;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::handle_map::{EntryRef, HandleMapEntry};
use crate::response::Tpm2Response;
use crate::session_list::{SessionEntry, SessionList, SessionRef};

const RC_COMMAND_SIZE: u32 = ResponseCode::CommandSize as u32;
const RC_COMMAND_CODE: u32 = ResponseCode::CommandCode as u32;
const RC_AUTHSIZE: u32 = ResponseCode::AuthSize as u32;
const RC_OBJECT_MEMORY: u32 = ResponseCode::ObjectMemory as u32;
const RC_SESSION_MEMORY: u32 = ResponseCode::SessionMemory as u32;
const RC_OBJECT_HANDLES: u32 = ResponseCode::ObjectHandles as u32;
const RC_CANCELED: u32 = ResponseCode::Canceled as u32;
const RC_SUCCESS: u32 = ResponseCode::Success as u32;

pub struct ResourceManager {
    broker: Arc<AccessBroker>,
    session_list: Arc<SessionList>,
    connections: Arc<ConnectionManager>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(
        broker: Arc<AccessBroker>,
        session_list: Arc<SessionList>,
        connections: Arc<ConnectionManager>,
    ) -> ResourceManager {
        ResourceManager {
            broker,
            session_list,
            connections,
        }
    }

    /// Service one client command: rewrite, dispatch, interpret. Always
    /// produces a response; per-command failures become synthetic
    /// responses, never a crash.
    pub fn service_command(&self, mut command: Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();

        if connection.take_cancel() {
            debug!("connection {:#018x}: command canceled", connection.id());
            return Tpm2Response::from_rc(connection, RC_CANCELED);
        }

        let code = command.code();
        if code == Command::ContextSave as u32 || code == Command::ContextLoad as u32 {
            // Contexts are the broker's own business; letting a client at
            // them would break the virtualization.
            warn!(
                "connection {:#018x}: refused context management command {code:#010x}",
                connection.id()
            );
            return Tpm2Response::from_rc(connection, RC_COMMAND_CODE);
        }
        if code == Command::FlushContext as u32 {
            return self.service_flush_context(command);
        }

        // Virtual to physical substitution in the handle area.
        for i in 0..command.handle_count() {
            let Some(handle) = command.handle(i) else {
                return Tpm2Response::from_rc(connection, RC_COMMAND_SIZE);
            };
            if HandleType::of(handle) != Some(HandleType::Transient) {
                continue;
            }
            let Some(entry) = connection.transient_map().vlookup(handle) else {
                debug!(
                    "connection {:#018x}: unknown virtual handle {handle:#010x}",
                    connection.id()
                );
                return Tpm2Response::from_rc(connection, rc_handle_number(i + 1));
            };
            if let Err(rc) = self.ensure_object_loaded(&entry) {
                return Tpm2Response::from_rc(connection, rc);
            }
            let phandle = entry.lock().expect("map entry mutex poisoned").phandle;
            command.set_handle(i, phandle);
        }

        // Sessions referenced from the auth area are not rewritten, but
        // they must be loaded before the TPM sees the command.
        if command.has_auths() {
            match command.auth_session_handles() {
                Ok(handles) => {
                    for handle in handles {
                        if !HandleType::of(handle).is_some_and(HandleType::is_session) {
                            continue;
                        }
                        if let Some(session) = self.session_list.lookup_handle(handle) {
                            if let Err(rc) = self.ensure_session_loaded(&session) {
                                return Tpm2Response::from_rc(connection, rc);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "connection {:#018x}: malformed auth area: {err}",
                        connection.id()
                    );
                    return Tpm2Response::from_rc(connection, RC_AUTHSIZE);
                }
            }
        }

        // Commands that allocate need a free slot and quota up front.
        if command.attributes().has_response_handle() {
            if code == Command::StartAuthSession as u32 {
                if self.session_list.is_full() {
                    return Tpm2Response::from_rc(connection, RC_SESSION_MEMORY);
                }
                if let Err(rc) = self.make_session_room() {
                    return Tpm2Response::from_rc(connection, rc);
                }
            } else {
                if connection.transient_map().is_full() {
                    return Tpm2Response::from_rc(connection, RC_OBJECT_MEMORY);
                }
                if let Err(rc) = self.make_transient_room() {
                    return Tpm2Response::from_rc(connection, rc);
                }
            }
        }

        let response = self.broker.send_command(&command);
        self.virtualize_response(&connection, response)
    }

    /// Capture a newly allocated handle out of `response`, rewriting a
    /// transient handle to a fresh virtual one.
    fn virtualize_response(
        &self,
        connection: &Arc<Connection>,
        mut response: Tpm2Response,
    ) -> Tpm2Response {
        if !response.is_success() || !response.has_handle() {
            return response;
        }
        let Some(phandle) = response.handle() else {
            return response;
        };
        match HandleType::of(phandle) {
            Some(HandleType::Transient) => {
                let vhandle = connection.transient_map().next_vhandle();
                if vhandle == 0 {
                    // 24 bits of handles burned through; nothing sane is
                    // left to hand this client.
                    warn!(
                        "connection {:#018x}: virtual handle space exhausted",
                        connection.id()
                    );
                    self.broker.context_flush(phandle);
                    connection.doom();
                    return Tpm2Response::from_rc(connection.clone(), RC_OBJECT_HANDLES);
                }
                let entry = HandleMapEntry::new(phandle, vhandle);
                if !connection
                    .transient_map()
                    .insert(vhandle, Arc::new(std::sync::Mutex::new(entry)))
                {
                    self.broker.context_flush(phandle);
                    return Tpm2Response::from_rc(connection.clone(), RC_OBJECT_MEMORY);
                }
                debug!(
                    "connection {:#018x}: new object {phandle:#010x} as {vhandle:#010x}",
                    connection.id()
                );
                response.set_handle(vhandle);
            }
            Some(kind) if kind.is_session() => {
                if !self
                    .session_list
                    .insert(SessionEntry::new(connection.id(), phandle))
                {
                    self.broker.context_flush(phandle);
                    return Tpm2Response::from_rc(connection.clone(), RC_SESSION_MEMORY);
                }
                debug!(
                    "connection {:#018x}: new session {phandle:#010x}",
                    connection.id()
                );
            }
            _ => {}
        }
        response
    }

    /// `TPM2_FlushContext` carries its handle in the parameter area and
    /// declares none in its attributes, so it gets its own path. The map
    /// or session entry is dropped whatever the TPM says: it either
    /// flushed the handle or never knew about it.
    fn service_flush_context(&self, mut command: Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();
        let Some(handle) = command.flush_handle() else {
            return Tpm2Response::from_rc(connection, RC_COMMAND_SIZE);
        };
        match HandleType::of(handle) {
            Some(HandleType::Transient) => {
                let Some(entry) = connection.transient_map().vlookup(handle) else {
                    return Tpm2Response::from_rc(connection, rc_handle_number(1));
                };
                let (loaded, phandle) = {
                    let e = entry.lock().expect("map entry mutex poisoned");
                    (e.is_loaded(), e.phandle)
                };
                let response = if loaded {
                    command.set_flush_handle(phandle);
                    self.broker.send_command(&command)
                } else {
                    // Only a saved context exists; dropping it is the
                    // whole flush.
                    Tpm2Response::from_rc(connection.clone(), RC_SUCCESS)
                };
                connection.transient_map().remove(handle);
                response
            }
            Some(kind) if kind.is_session() => {
                let response = self.broker.send_command(&command);
                self.session_list.remove_handle(handle);
                response
            }
            _ => self.broker.send_command(&command),
        }
    }

    /// Make sure the object behind `entry` is loaded, evicting as
    /// needed. On success the entry holds a current physical handle and
    /// a fresh recency stamp.
    fn ensure_object_loaded(&self, entry: &EntryRef) -> Result<(), u32> {
        let context = {
            let mut e = entry.lock().expect("map entry mutex poisoned");
            if e.is_loaded() {
                e.touch();
                return Ok(());
            }
            e.context.clone()
        };
        self.make_transient_room()?;
        let phandle = self.broker.context_load(&context)?;
        let mut e = entry.lock().expect("map entry mutex poisoned");
        e.phandle = phandle;
        e.context.clear();
        e.touch();
        Ok(())
    }

    /// Make sure the session behind `entry` is loaded and move it to
    /// the head of the load order.
    fn ensure_session_loaded(&self, entry: &SessionRef) -> Result<(), u32> {
        let context = {
            let e = entry.lock().expect("session entry mutex poisoned");
            if e.is_loaded() {
                None
            } else {
                Some(e.context.clone())
            }
        };
        if let Some(context) = context {
            self.make_session_room()?;
            let handle = self.broker.context_load(&context)?;
            let mut e = entry.lock().expect("session entry mutex poisoned");
            e.phandle = handle;
            e.context.clear();
        }
        self.session_list.move_to_head(entry);
        Ok(())
    }

    /// Evict loaded transient objects until the TPM has a free slot.
    fn make_transient_room(&self) -> Result<(), u32> {
        let limit = self.broker.transient_limit();
        loop {
            let count = self.broker.get_trans_object_count()?;
            if count < limit {
                return Ok(());
            }
            let Some(victim) = self.pick_transient_victim() else {
                // The TPM is full of objects the broker does not own.
                return Err(RC_OBJECT_MEMORY);
            };
            let phandle = victim.lock().expect("map entry mutex poisoned").phandle;
            let context = self.broker.save_flush(phandle)?;
            victim.lock().expect("map entry mutex poisoned").context = context;
            debug!("evicted transient object {phandle:#010x}");
        }
    }

    /// The least recently used loaded entry across every connection,
    /// ties broken by the smallest connection id.
    fn pick_transient_victim(&self) -> Option<EntryRef> {
        let mut best: Option<(u64, u64, EntryRef)> = None;
        for connection in self.connections.connections() {
            for entry in connection.transient_map().entries() {
                let (loaded, last_used) = {
                    let e = entry.lock().expect("map entry mutex poisoned");
                    (e.is_loaded(), e.last_used)
                };
                if !loaded {
                    continue;
                }
                let key = (last_used, connection.id());
                if best
                    .as_ref()
                    .map_or(true, |(lu, cid, _)| key < (*lu, *cid))
                {
                    best = Some((last_used, connection.id(), entry.clone()));
                }
            }
        }
        best.map(|(_, _, entry)| entry)
    }

    /// Save tail-end sessions until the TPM has a free session slot.
    /// Saving a session is enough to unload it; the session stays
    /// active and reloadable.
    fn make_session_room(&self) -> Result<(), u32> {
        let limit = self.broker.session_limit() as usize;
        while self.session_list.loaded_count() >= limit {
            let victim = self
                .session_list
                .entries()
                .into_iter()
                .rev()
                .find(|e| e.lock().expect("session entry mutex poisoned").is_loaded());
            let Some(victim) = victim else {
                return Err(RC_SESSION_MEMORY);
            };
            let phandle = victim.lock().expect("session entry mutex poisoned").phandle;
            let context = self.broker.context_save(phandle)?;
            victim.lock().expect("session entry mutex poisoned").context = context;
            debug!("evicted session {phandle:#010x}");
        }
        Ok(())
    }

    /// Registry new-connection event. The connection arrives with its
    /// handle map already constructed; nothing to do but note it.
    pub fn add_connection(&self, connection: &Arc<Connection>) {
        debug!(
            "resource manager: tracking connection {:#018x}",
            connection.id()
        );
    }

    /// Registry connection-removed event: flush everything the
    /// connection owned. Flush errors are swallowed, the connection is
    /// going away regardless.
    pub fn remove_connection(&self, connection: &Arc<Connection>) {
        debug!(
            "resource manager: reaping connection {:#018x}",
            connection.id()
        );
        for entry in connection.transient_map().entries() {
            let (loaded, phandle) = {
                let e = entry.lock().expect("map entry mutex poisoned");
                (e.is_loaded(), e.phandle)
            };
            if loaded {
                self.broker.context_flush(phandle);
            }
        }
        connection.transient_map().clear();

        for session in self.session_list.take_connection(connection.id()) {
            let (loaded, phandle) = {
                let e = session.lock().expect("session entry mutex poisoned");
                (e.is_loaded(), e.phandle)
            };
            if loaded {
                self.broker.context_flush(phandle);
            }
        }
    }
}
