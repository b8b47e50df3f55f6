// SPDX-License-Identifier: GPL-3.0-or-later
#![allow(dead_code)]

//! Shared integration test fixtures: an in-memory TPM behind the
//! [`Tcti`] trait, canned command builders, and a wired-up broker
//! harness.

use std::collections::{HashMap, HashSet};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tpm2_proto::{
    codec, rc_handle_number, Capability, Command, Permanent, ResponseCode, Tag,
    ACTIVE_SESSION_FIRST, LOADED_SESSION_FIRST, PT_ACTIVE_SESSIONS_MAX, PT_CONTEXT_GAP_MAX,
    PT_HR_LOADED_MIN, PT_HR_TRANSIENT_MIN, PT_MAX_COMMAND_SIZE, PT_MAX_RESPONSE_SIZE,
    PT_TOTAL_COMMANDS, TRANSIENT_FIRST,
};

use tpm2_brokerd::access_broker::AccessBroker;
use tpm2_brokerd::command::Tpm2Command;
use tpm2_brokerd::connection::Connection;
use tpm2_brokerd::connection_manager::ConnectionManager;
use tpm2_brokerd::resource_manager::ResourceManager;
use tpm2_brokerd::response::Tpm2Response;
use tpm2_brokerd::session_list::SessionList;
use tpm2_brokerd::tcti::{Tcti, TctiError};

const RC_SUCCESS: u32 = ResponseCode::Success as u32;

/// Attribute words the fake TPM reports for its command set.
const COMMAND_ATTRS: &[u32] = &[
    0x0000_0144,             // Startup
    0x0000_0145,             // Shutdown
    0x0000_017A,             // GetCapability
    0x0000_017B,             // GetRandom
    0x1200_0131,             // CreatePrimary: 1 handle, rHandle
    0x1200_0157,             // Load: 1 handle, rHandle
    0x0200_0173,             // ReadPublic: 1 handle
    0x0200_015D,             // Sign: 1 handle
    0x0400_0147,             // ActivateCredential: 2 handles
    0x1400_0176,             // StartAuthSession: 2 handles, rHandle
    0x0200_0162,             // ContextSave: 1 handle
    0x1000_0161,             // ContextLoad: rHandle
    0x0000_0165,             // FlushContext
];

const CONTEXT_OBJECT: u8 = 0;
const CONTEXT_SESSION: u8 = 1;

/// Observable state of the fake TPM, shared with the tests.
pub struct FakeState {
    /// Loaded transient objects, physical handle to object serial.
    pub objects: HashMap<u32, u32>,
    pub loaded_sessions: HashSet<u32>,
    pub saved_sessions: HashSet<u32>,
    pub transient_limit: usize,
    pub session_limit: usize,
    pub started: bool,
    /// Every command buffer received, in arrival order.
    pub received: Vec<Vec<u8>>,
    next_serial: u32,
    next_phandle: u32,
    next_session: u32,
}

impl FakeState {
    fn new(transient_limit: usize, session_limit: usize) -> FakeState {
        FakeState {
            objects: HashMap::new(),
            loaded_sessions: HashSet::new(),
            saved_sessions: HashSet::new(),
            transient_limit,
            session_limit,
            started: false,
            received: Vec::new(),
            next_serial: 1,
            next_phandle: TRANSIENT_FIRST,
            next_session: LOADED_SESSION_FIRST,
        }
    }

    /// Command codes received, for ordering assertions.
    pub fn received_codes(&self) -> Vec<u32> {
        self.received.iter().map(|b| codec::command_code(b)).collect()
    }
}

pub struct FakeTpm {
    state: Arc<Mutex<FakeState>>,
    pending: Option<Vec<u8>>,
}

impl FakeTpm {
    pub fn new() -> (FakeTpm, Arc<Mutex<FakeState>>) {
        FakeTpm::with_limits(3, 3)
    }

    pub fn with_limits(
        transient_limit: usize,
        session_limit: usize,
    ) -> (FakeTpm, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::new(transient_limit, session_limit)));
        (
            FakeTpm {
                state: state.clone(),
                pending: None,
            },
            state,
        )
    }
}

fn response(rc: u32, params: &[u8]) -> Vec<u8> {
    let size = u32::try_from(codec::HEADER_SIZE + params.len()).unwrap();
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend((Tag::NoSessions as u16).to_be_bytes());
    buf.extend(size.to_be_bytes());
    buf.extend(rc.to_be_bytes());
    buf.extend(params);
    buf
}

fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn capability_header(more: bool, capability: u32, count: u32) -> Vec<u8> {
    let mut params = vec![u8::from(more)];
    params.extend(capability.to_be_bytes());
    params.extend(count.to_be_bytes());
    params
}

impl FakeState {
    fn get_capability(&self, cmd: &[u8]) -> Vec<u8> {
        let capability = be32(cmd, 10);
        let property = be32(cmd, 14);
        if capability == Capability::TpmProperties as u32 {
            let pairs: Vec<(u32, u32)> = [
                (PT_HR_TRANSIENT_MIN, self.transient_limit as u32),
                (PT_HR_LOADED_MIN, self.session_limit as u32),
                (PT_ACTIVE_SESSIONS_MAX, 64),
                (PT_CONTEXT_GAP_MAX, 0xFFFF),
                (PT_MAX_COMMAND_SIZE, 4096),
                (PT_MAX_RESPONSE_SIZE, 4096),
                (PT_TOTAL_COMMANDS, COMMAND_ATTRS.len() as u32),
            ]
            .into_iter()
            .filter(|(pt, _)| *pt >= property)
            .collect();
            let mut params =
                capability_header(false, capability, u32::try_from(pairs.len()).unwrap());
            for (pt, value) in pairs {
                params.extend(pt.to_be_bytes());
                params.extend(value.to_be_bytes());
            }
            response(RC_SUCCESS, &params)
        } else if capability == Capability::Commands as u32 {
            let mut params = capability_header(
                false,
                capability,
                u32::try_from(COMMAND_ATTRS.len()).unwrap(),
            );
            for word in COMMAND_ATTRS {
                params.extend(word.to_be_bytes());
            }
            response(RC_SUCCESS, &params)
        } else if capability == Capability::Handles as u32 {
            let mut handles: Vec<u32> = if property == TRANSIENT_FIRST {
                self.objects.keys().copied().collect()
            } else if property == LOADED_SESSION_FIRST {
                self.loaded_sessions.iter().copied().collect()
            } else if property == ACTIVE_SESSION_FIRST {
                self.saved_sessions.iter().copied().collect()
            } else {
                Vec::new()
            };
            handles.sort_unstable();
            let mut params =
                capability_header(false, capability, u32::try_from(handles.len()).unwrap());
            for handle in handles {
                params.extend(handle.to_be_bytes());
            }
            response(RC_SUCCESS, &params)
        } else {
            response(ResponseCode::Value as u32, &[])
        }
    }

    fn create_object(&mut self) -> Option<u32> {
        if self.objects.len() >= self.transient_limit {
            return None;
        }
        let phandle = self.next_phandle;
        self.next_phandle += 1;
        let serial = self.next_serial;
        self.next_serial += 1;
        self.objects.insert(phandle, serial);
        Some(phandle)
    }

    fn execute(&mut self, cmd: &[u8]) -> Vec<u8> {
        self.received.push(cmd.to_vec());
        let code = codec::command_code(cmd);

        if code == Command::Startup as u32 {
            if self.started {
                return response(ResponseCode::Initialize as u32, &[]);
            }
            self.started = true;
            return response(RC_SUCCESS, &[]);
        }
        if code == Command::GetCapability as u32 {
            return self.get_capability(cmd);
        }
        if code == Command::CreatePrimary as u32 || code == Command::Load as u32 {
            if code == Command::Load as u32 && !self.objects.contains_key(&be32(cmd, 10)) {
                return response(rc_handle_number(1), &[]);
            }
            let Some(phandle) = self.create_object() else {
                return response(ResponseCode::ObjectMemory as u32, &[]);
            };
            let mut params = Vec::new();
            params.extend(phandle.to_be_bytes());
            params.extend([0_u8; 4]);
            return response(RC_SUCCESS, &params);
        }
        if code == Command::ReadPublic as u32
            || code == Command::Sign as u32
            || code == Command::ActivateCredential as u32
        {
            let count: u8 = if code == Command::ActivateCredential as u32 {
                2
            } else {
                1
            };
            for i in 0..count {
                if !self.objects.contains_key(&be32(cmd, 10 + 4 * usize::from(i))) {
                    return response(rc_handle_number(i + 1), &[]);
                }
            }
            return response(RC_SUCCESS, &[0, 4, 0xDE, 0xAD, 0xBE, 0xEF]);
        }
        if code == Command::StartAuthSession as u32 {
            if self.loaded_sessions.len() >= self.session_limit {
                return response(ResponseCode::SessionMemory as u32, &[]);
            }
            let handle = self.next_session;
            self.next_session += 1;
            self.loaded_sessions.insert(handle);
            let mut params = Vec::new();
            params.extend(handle.to_be_bytes());
            params.extend(16_u16.to_be_bytes());
            params.extend([0_u8; 16]);
            return response(RC_SUCCESS, &params);
        }
        if code == Command::ContextSave as u32 {
            let handle = be32(cmd, 10);
            if let Some(serial) = self.objects.get(&handle).copied() {
                // Saving an object leaves it loaded.
                let mut blob = vec![CONTEXT_OBJECT];
                blob.extend(serial.to_be_bytes());
                return response(RC_SUCCESS, &blob);
            }
            if self.loaded_sessions.remove(&handle) {
                // Saving a session unloads it.
                self.saved_sessions.insert(handle);
                let mut blob = vec![CONTEXT_SESSION];
                blob.extend(handle.to_be_bytes());
                return response(RC_SUCCESS, &blob);
            }
            return response(rc_handle_number(1), &[]);
        }
        if code == Command::ContextLoad as u32 {
            let blob = &cmd[10..];
            if blob.len() < 5 {
                return response(ResponseCode::BadContext as u32, &[]);
            }
            let value = be32(blob, 1);
            let handle = match blob[0] {
                CONTEXT_OBJECT => {
                    let Some(phandle) = self.create_object() else {
                        return response(ResponseCode::ObjectMemory as u32, &[]);
                    };
                    self.objects.insert(phandle, value);
                    phandle
                }
                CONTEXT_SESSION => {
                    if !self.saved_sessions.remove(&value) {
                        return response(ResponseCode::BadContext as u32, &[]);
                    }
                    if self.loaded_sessions.len() >= self.session_limit {
                        self.saved_sessions.insert(value);
                        return response(ResponseCode::SessionMemory as u32, &[]);
                    }
                    self.loaded_sessions.insert(value);
                    value
                }
                _ => return response(ResponseCode::BadContext as u32, &[]),
            };
            return response(RC_SUCCESS, &handle.to_be_bytes());
        }
        if code == Command::FlushContext as u32 {
            let handle = be32(cmd, 10);
            if self.objects.remove(&handle).is_some()
                || self.loaded_sessions.remove(&handle)
                || self.saved_sessions.remove(&handle)
            {
                return response(RC_SUCCESS, &[]);
            }
            return response(rc_handle_number(1), &[]);
        }
        if code == Command::GetRandom as u32 {
            let mut params = Vec::new();
            params.extend(16_u16.to_be_bytes());
            params.extend([0xA5_u8; 16]);
            return response(RC_SUCCESS, &params);
        }
        response(ResponseCode::CommandCode as u32, &[])
    }
}

impl Tcti for FakeTpm {
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TctiError> {
        let mut state = self.state.lock().unwrap();
        self.pending = Some(state.execute(buf));
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TctiError> {
        let pending = self.pending.take().ok_or(TctiError::InvalidRead)?;
        if pending.len() > buf.len() {
            return Err(TctiError::InvalidData);
        }
        buf[..pending.len()].copy_from_slice(&pending);
        Ok(pending.len())
    }

    fn set_locality(&mut self, _locality: u8) -> Result<(), TctiError> {
        Ok(())
    }
}

// Command builders, the shapes the original integration suite sends.

pub fn build_create_primary() -> Vec<u8> {
    let mut auth = Vec::new();
    auth.extend((Permanent::Password as u32).to_be_bytes());
    auth.extend(0_u16.to_be_bytes()); // nonce
    auth.push(0x01); // continueSession
    auth.extend(0_u16.to_be_bytes()); // hmac

    let mut cmd = Vec::new();
    cmd.extend((Tag::Sessions as u16).to_be_bytes());
    let size = 10 + 4 + 4 + auth.len() + 4;
    cmd.extend(u32::try_from(size).unwrap().to_be_bytes());
    cmd.extend((Command::CreatePrimary as u32).to_be_bytes());
    cmd.extend((Permanent::Owner as u32).to_be_bytes());
    cmd.extend(u32::try_from(auth.len()).unwrap().to_be_bytes());
    cmd.extend(&auth);
    cmd.extend([0_u8; 4]); // abbreviated parameters
    cmd
}

pub fn build_read_public(handle: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(14_u32.to_be_bytes());
    cmd.extend((Command::ReadPublic as u32).to_be_bytes());
    cmd.extend(handle.to_be_bytes());
    cmd
}

pub fn build_activate_credential(activate: u32, key: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(22_u32.to_be_bytes());
    cmd.extend((Command::ActivateCredential as u32).to_be_bytes());
    cmd.extend(activate.to_be_bytes());
    cmd.extend(key.to_be_bytes());
    cmd.extend([0xAA, 0xBB, 0xCC, 0xDD]); // abbreviated parameters
    cmd
}

pub fn build_start_auth_session() -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(43_u32.to_be_bytes());
    cmd.extend((Command::StartAuthSession as u32).to_be_bytes());
    cmd.extend((Permanent::Null as u32).to_be_bytes()); // tpmKey
    cmd.extend((Permanent::Null as u32).to_be_bytes()); // bind
    cmd.extend(16_u16.to_be_bytes());
    cmd.extend([0_u8; 16]); // nonceCaller
    cmd.extend(0_u16.to_be_bytes()); // encryptedSalt
    cmd.push(0x00); // TPM_SE_HMAC
    cmd.extend(0x0010_u16.to_be_bytes()); // symmetric: TPM_ALG_NULL
    cmd.extend(0x000B_u16.to_be_bytes()); // authHash: TPM_ALG_SHA256
    cmd
}

/// A `Sign` whose auth area references `session`.
pub fn build_sign(handle: u32, session: u32) -> Vec<u8> {
    let mut auth = Vec::new();
    auth.extend(session.to_be_bytes());
    auth.extend(0_u16.to_be_bytes());
    auth.push(0x01);
    auth.extend(0_u16.to_be_bytes());

    let mut cmd = Vec::new();
    cmd.extend((Tag::Sessions as u16).to_be_bytes());
    let size = 10 + 4 + 4 + auth.len() + 4;
    cmd.extend(u32::try_from(size).unwrap().to_be_bytes());
    cmd.extend((Command::Sign as u32).to_be_bytes());
    cmd.extend(handle.to_be_bytes());
    cmd.extend(u32::try_from(auth.len()).unwrap().to_be_bytes());
    cmd.extend(&auth);
    cmd.extend([0_u8; 4]); // abbreviated parameters
    cmd
}

pub fn build_flush_context(handle: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(14_u32.to_be_bytes());
    cmd.extend((Command::FlushContext as u32).to_be_bytes());
    cmd.extend(handle.to_be_bytes());
    cmd
}

pub fn build_get_capability(capability: u32, property: u32, count: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(22_u32.to_be_bytes());
    cmd.extend((Command::GetCapability as u32).to_be_bytes());
    cmd.extend(capability.to_be_bytes());
    cmd.extend(property.to_be_bytes());
    cmd.extend(count.to_be_bytes());
    cmd
}

pub fn build_context_save(handle: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend((Tag::NoSessions as u16).to_be_bytes());
    cmd.extend(14_u32.to_be_bytes());
    cmd.extend((Command::ContextSave as u32).to_be_bytes());
    cmd.extend(handle.to_be_bytes());
    cmd
}

// Harness wiring the broker stack against the fake TPM.

pub struct Harness {
    pub broker: Arc<AccessBroker>,
    pub session_list: Arc<SessionList>,
    pub manager: Arc<ConnectionManager>,
    pub resource_manager: Arc<ResourceManager>,
    pub state: Arc<Mutex<FakeState>>,
    max_transient_objects: u32,
    clients: Mutex<Vec<UnixStream>>,
}

pub fn harness() -> Harness {
    harness_with(3, 3, 27, 27, 27)
}

pub fn harness_with(
    transient_limit: usize,
    session_limit: usize,
    max_connections: u32,
    max_transient_objects: u32,
    max_sessions: u32,
) -> Harness {
    let (tpm, state) = FakeTpm::with_limits(transient_limit, session_limit);
    let mut broker = AccessBroker::new(Box::new(tpm));
    broker.init_tpm().expect("fake TPM init");
    let broker = Arc::new(broker);

    let session_list = Arc::new(SessionList::new(max_sessions));
    let manager = Arc::new(ConnectionManager::new(max_connections));
    let resource_manager = Arc::new(ResourceManager::new(
        broker.clone(),
        session_list.clone(),
        manager.clone(),
    ));
    {
        let weak = Arc::downgrade(&resource_manager);
        manager.subscribe_removed(Box::new(move |connection| {
            if let Some(rm) = weak.upgrade() {
                rm.remove_connection(connection);
            }
        }));
    }
    Harness {
        broker,
        session_list,
        manager,
        resource_manager,
        state,
        max_transient_objects,
        clients: Mutex::new(Vec::new()),
    }
}

impl Harness {
    /// Register a connection, keeping the client end alive for the
    /// test's duration.
    pub fn connect(&self, id: u64) -> Arc<Connection> {
        let (server, client) = UnixStream::pair().unwrap();
        let connection = Arc::new(Connection::new(id, server, self.max_transient_objects));
        assert!(self.manager.insert(connection.clone()));
        self.clients.lock().unwrap().push(client);
        connection
    }

    /// Push `bytes` through the resource manager as `connection`.
    pub fn service(&self, connection: &Arc<Connection>, bytes: Vec<u8>) -> Tpm2Response {
        let code = codec::command_code(&bytes);
        let attributes = self
            .broker
            .command_attributes(code)
            .expect("command in fake TPM table");
        self.resource_manager
            .service_command(Tpm2Command::new(connection.clone(), bytes, attributes))
    }

    /// Create one primary and return the virtual handle from the
    /// rewritten response.
    pub fn create_primary(&self, connection: &Arc<Connection>) -> u32 {
        let response = self.service(connection, build_create_primary());
        assert!(response.is_success(), "rc {:#010x}", response.code());
        response.handle().expect("response handle")
    }

    /// Start a session and return its (physical) handle.
    pub fn start_session(&self, connection: &Arc<Connection>) -> u32 {
        let response = self.service(connection, build_start_auth_session());
        assert!(response.is_success(), "rc {:#010x}", response.code());
        response.handle().expect("response handle")
    }
}
