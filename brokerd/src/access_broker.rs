// SPDX-License-Identifier: GPL-3.0-or-later

//! Serialized gate in front of the TPM.
//!
//! The broker owns the only handle to the TPM transport. Every
//! operation takes the gate mutex for its full duration, so commands
//! from different connections are strictly serialized and internal
//! operations such as save-then-flush are atomic with respect to
//! client traffic.
//!
//! Internal commands are built as raw big-endian buffers and their
//! responses parsed field by field; the broker needs only a handful of
//! commands for its own purposes.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tpm2_proto::{
    codec, Capability, Command, CommandAttributes, ResponseCode, Tag, CC_FIRST,
    LOADED_SESSION_FIRST, MAX_CAP_HANDLES, MAX_TPM_PROPERTIES, PT_CONTEXT_GAP_MAX, PT_FIXED,
    PT_HR_LOADED_MIN, PT_HR_TRANSIENT_MIN, PT_MAX_COMMAND_SIZE, PT_MAX_RESPONSE_SIZE,
    PT_TOTAL_COMMANDS, SU_CLEAR, TRANSIENT_FIRST,
};

use crate::command::Tpm2Command;
use crate::command_attrs::CommandAttrsTable;
use crate::response::Tpm2Response;
use crate::tcti::{Tcti, TctiError};

const RC_SUCCESS: u32 = ResponseCode::Success as u32;
const RC_FAILURE: u32 = ResponseCode::Failure as u32;
const RC_INITIALIZE: u32 = ResponseCode::Initialize as u32;

/// Response buffer size used before `TPM_PT_MAX_RESPONSE_SIZE` is known.
const BOOTSTRAP_RESPONSE_SIZE: usize = 4096;

/// Slot limit fallback when the TPM omits the property; 3 is the
/// minimum the TPM 2.0 specification guarantees.
const MIN_SLOTS: u32 = 3;

struct TpmGate {
    tcti: Box<dyn Tcti>,
    locality: u8,
}

pub struct AccessBroker {
    gate: Mutex<TpmGate>,
    fixed_properties: HashMap<u32, u32>,
    command_attrs: CommandAttrsTable,
    max_command_size: u32,
    max_response_size: u32,
    transient_limit: u32,
    session_limit: u32,
}

fn header(tag: Tag, size: u32, code: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend((tag as u16).to_be_bytes());
    buf.extend(size.to_be_bytes());
    buf.extend(code.to_be_bytes());
    buf
}

fn build_startup(startup_type: u16) -> Vec<u8> {
    let mut cmd = header(Tag::NoSessions, 12, Command::Startup as u32);
    cmd.extend(startup_type.to_be_bytes());
    cmd
}

fn build_get_capability(capability: u32, property: u32, property_count: u32) -> Vec<u8> {
    let mut cmd = header(Tag::NoSessions, 22, Command::GetCapability as u32);
    cmd.extend(capability.to_be_bytes());
    cmd.extend(property.to_be_bytes());
    cmd.extend(property_count.to_be_bytes());
    cmd
}

fn build_context_save(handle: u32) -> Vec<u8> {
    let mut cmd = header(Tag::NoSessions, 14, Command::ContextSave as u32);
    cmd.extend(handle.to_be_bytes());
    cmd
}

fn build_context_load(context: &[u8]) -> Result<Vec<u8>, u32> {
    let size = u32::try_from(codec::HEADER_SIZE + context.len()).or(Err(RC_FAILURE))?;
    let mut cmd = header(Tag::NoSessions, size, Command::ContextLoad as u32);
    cmd.extend(context);
    Ok(cmd)
}

fn build_flush_context(handle: u32) -> Vec<u8> {
    let mut cmd = header(Tag::NoSessions, 14, Command::FlushContext as u32);
    cmd.extend(handle.to_be_bytes());
    cmd
}

fn be32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse a `TPMS_CAPABILITY_DATA` for `TPM_CAP_TPM_PROPERTIES`:
/// moreData, capability, count, then count property/value pairs.
fn parse_properties(params: &[u8]) -> Result<(bool, Vec<(u32, u32)>), u32> {
    if params.len() < 9 {
        return Err(RC_FAILURE);
    }
    let more = params[0] != 0;
    let count = be32(params, 5).ok_or(RC_FAILURE)? as usize;
    let mut pairs = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 9 + i * 8;
        let property = be32(params, offset).ok_or(RC_FAILURE)?;
        let value = be32(params, offset + 4).ok_or(RC_FAILURE)?;
        pairs.push((property, value));
    }
    Ok((more, pairs))
}

/// Parse a `TPMS_CAPABILITY_DATA` for `TPM_CAP_HANDLES`.
fn parse_handles(params: &[u8]) -> Result<Vec<u32>, u32> {
    if params.len() < 9 || ((params.len() - 9) & 0x03) != 0 {
        return Err(RC_FAILURE);
    }
    let count = be32(params, 5).ok_or(RC_FAILURE)? as usize;
    if count != (params.len() - 9) >> 2 {
        return Err(RC_FAILURE);
    }
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        handles.push(be32(params, 9 + i * 4).ok_or(RC_FAILURE)?);
    }
    Ok(handles)
}

/// Parse a `TPMS_CAPABILITY_DATA` for `TPM_CAP_COMMANDS`: a `TPML_CCA`.
fn parse_command_attrs(params: &[u8]) -> Result<(bool, Vec<u32>), u32> {
    if params.len() < 9 {
        return Err(RC_FAILURE);
    }
    let more = params[0] != 0;
    let count = be32(params, 5).ok_or(RC_FAILURE)? as usize;
    let mut words = Vec::with_capacity(count);
    for i in 0..count {
        words.push(be32(params, 9 + i * 4).ok_or(RC_FAILURE)?);
    }
    Ok((more, words))
}

impl TpmGate {
    /// One command/response exchange. The caller holds the gate.
    fn exec(&mut self, cmd: &[u8], max_response: usize) -> Result<Vec<u8>, u32> {
        if let Err(err) = self.tcti.transmit(cmd) {
            warn!("tcti transmit failed: {err}");
            return Err(RC_FAILURE);
        }
        let mut buf = vec![0_u8; max_response];
        match self.tcti.receive(&mut buf, None) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) => {
                warn!("tcti receive failed: {err}");
                Err(RC_FAILURE)
            }
        }
    }

    /// Exchange expecting success; returns the parameter area.
    fn exec_checked(&mut self, cmd: &[u8], max_response: usize) -> Result<Vec<u8>, u32> {
        let response = self.exec(cmd, max_response)?;
        let rc = codec::response_code(&response);
        if rc != RC_SUCCESS {
            return Err(rc);
        }
        Ok(response[codec::HEADER_SIZE..].to_vec())
    }
}

impl AccessBroker {
    /// Wrap `tcti`. The TPM is not touched until [`init_tpm`] runs.
    ///
    /// [`init_tpm`]: AccessBroker::init_tpm
    #[must_use]
    pub fn new(tcti: Box<dyn Tcti>) -> AccessBroker {
        AccessBroker {
            gate: Mutex::new(TpmGate { tcti, locality: 0 }),
            fixed_properties: HashMap::new(),
            command_attrs: CommandAttrsTable::new([]),
            max_command_size: 0,
            max_response_size: 0,
            transient_limit: MIN_SLOTS,
            session_limit: MIN_SLOTS,
        }
    }

    /// Start the TPM and populate the caches: `TPM2_Startup(CLEAR)`
    /// with `TPM_RC_INITIALIZE` treated as success, the `PT_FIXED`
    /// property group, and the command attribute table. Must complete
    /// before the broker is shared.
    ///
    /// # Errors
    ///
    /// The TPM response code of the failing step; the caller treats any
    /// failure as fatal.
    pub fn init_tpm(&mut self) -> Result<(), u32> {
        let gate = self.gate.get_mut().expect("tpm gate mutex poisoned");

        let response = gate.exec(&build_startup(SU_CLEAR), BOOTSTRAP_RESPONSE_SIZE)?;
        let rc = codec::response_code(&response);
        if rc != RC_SUCCESS && rc != RC_INITIALIZE {
            warn!("TPM2_Startup returned unexpected {}", ResponseCode::from(rc));
            return Err(rc);
        }

        let mut property = PT_FIXED;
        loop {
            let params = gate.exec_checked(
                &build_get_capability(Capability::TpmProperties as u32, property, MAX_TPM_PROPERTIES),
                BOOTSTRAP_RESPONSE_SIZE,
            )?;
            let (more, pairs) = parse_properties(&params)?;
            let Some(last) = pairs.last().map(|p| p.0) else {
                break;
            };
            self.fixed_properties.extend(pairs);
            if !more {
                break;
            }
            property = last + 1;
        }

        self.max_command_size = *self
            .fixed_properties
            .get(&PT_MAX_COMMAND_SIZE)
            .ok_or(RC_FAILURE)?;
        self.max_response_size = *self
            .fixed_properties
            .get(&PT_MAX_RESPONSE_SIZE)
            .ok_or(RC_FAILURE)?;
        let total_commands = *self
            .fixed_properties
            .get(&PT_TOTAL_COMMANDS)
            .ok_or(RC_FAILURE)?;
        self.transient_limit = self
            .fixed_properties
            .get(&PT_HR_TRANSIENT_MIN)
            .copied()
            .unwrap_or(MIN_SLOTS);
        self.session_limit = self
            .fixed_properties
            .get(&PT_HR_LOADED_MIN)
            .copied()
            .unwrap_or(MIN_SLOTS);

        let mut words = Vec::with_capacity(total_commands as usize);
        let mut code = CC_FIRST;
        loop {
            let params = gate.exec_checked(
                &build_get_capability(Capability::Commands as u32, code, total_commands),
                self.max_response_size as usize,
            )?;
            let (more, batch) = parse_command_attrs(&params)?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            words.extend(batch);
            if !more {
                break;
            }
            code = u32::from(CommandAttributes::from_bits_retain(last).command_index()) + 1;
        }
        self.command_attrs = CommandAttrsTable::new(words);

        debug!(
            "TPM ready: {} commands, transient slots {}, session slots {}",
            self.command_attrs.len(),
            self.transient_limit,
            self.session_limit
        );
        Ok(())
    }

    /// Dispatch a client command and collect its response.
    ///
    /// A transport failure still produces a response: a synthetic one
    /// carrying `TPM_RC_FAILURE`, so the caller's request is never
    /// dropped on the floor.
    pub fn send_command(&self, command: &Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");

        let locality = connection.locality();
        if locality != gate.locality {
            match gate.tcti.set_locality(locality) {
                Ok(()) => {}
                Err(TctiError::Unsupported) => {
                    debug!("tcti has no locality control, ignoring locality {locality}");
                }
                Err(err) => warn!("tcti set_locality failed: {err}"),
            }
            gate.locality = locality;
        }

        match gate.exec(command.buffer(), self.max_response_size as usize) {
            Ok(buffer) => Tpm2Response::new(connection, buffer, command.attributes()),
            Err(rc) => Tpm2Response::from_rc(connection, rc),
        }
    }

    /// `TPM2_ContextSave`, returning the opaque context blob.
    ///
    /// # Errors
    ///
    /// The TPM response code on failure.
    pub fn context_save(&self, handle: u32) -> Result<Vec<u8>, u32> {
        debug!("context_save: handle {handle:#010x}");
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");
        gate.exec_checked(&build_context_save(handle), self.max_response_size as usize)
    }

    /// `TPM2_ContextLoad`, returning the handle the TPM assigned.
    ///
    /// # Errors
    ///
    /// The TPM response code on failure.
    pub fn context_load(&self, context: &[u8]) -> Result<u32, u32> {
        let cmd = build_context_load(context)?;
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");
        let params = gate.exec_checked(&cmd, self.max_response_size as usize)?;
        let handle = be32(&params, 0).ok_or(RC_FAILURE)?;
        debug!("context_load: got handle {handle:#010x}");
        Ok(handle)
    }

    /// `TPM2_FlushContext`. Returns the TPM response code.
    pub fn context_flush(&self, handle: u32) -> u32 {
        debug!("context_flush: handle {handle:#010x}");
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");
        match gate.exec(&build_flush_context(handle), self.max_response_size as usize) {
            Ok(response) => {
                let rc = codec::response_code(&response);
                if rc != RC_SUCCESS {
                    warn!(
                        "failed to flush context for handle {handle:#010x}: {}",
                        ResponseCode::from(rc)
                    );
                }
                rc
            }
            Err(rc) => rc,
        }
    }

    /// Save then flush `handle` under a single gate acquisition, so no
    /// other command can observe the handle between the two steps. Used
    /// by eviction.
    ///
    /// # Errors
    ///
    /// The TPM response code of the failing step. When the save fails
    /// the object is still loaded; when the flush fails the returned
    /// error leaves the caller's entry loaded as well, since the slot
    /// was not reclaimed.
    pub fn save_flush(&self, handle: u32) -> Result<Vec<u8>, u32> {
        debug!("save_flush: handle {handle:#010x}");
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");
        let context =
            gate.exec_checked(&build_context_save(handle), self.max_response_size as usize)?;
        let response =
            gate.exec(&build_flush_context(handle), self.max_response_size as usize)?;
        let rc = codec::response_code(&response);
        if rc != RC_SUCCESS {
            warn!(
                "save_flush: flush of {handle:#010x} failed: {}",
                ResponseCode::from(rc)
            );
            return Err(rc);
        }
        Ok(context)
    }

    /// Handles currently allocated in the range starting at `first`,
    /// via `TPM2_GetCapability(TPM_CAP_HANDLES)`.
    ///
    /// # Errors
    ///
    /// The TPM response code on failure.
    pub fn get_handles(&self, first: u32) -> Result<Vec<u32>, u32> {
        let mut gate = self.gate.lock().expect("tpm gate mutex poisoned");
        let params = gate.exec_checked(
            &build_get_capability(Capability::Handles as u32, first, MAX_CAP_HANDLES),
            self.max_response_size as usize,
        )?;
        parse_handles(&params)
    }

    /// Number of transient objects currently loaded in the TPM.
    ///
    /// # Errors
    ///
    /// The TPM response code on failure.
    pub fn get_trans_object_count(&self) -> Result<u32, u32> {
        self.get_handles(TRANSIENT_FIRST)
            .map(|handles| u32::try_from(handles.len()).unwrap_or(u32::MAX))
    }

    /// Flush every transient object and loaded session the TPM is
    /// holding, so the broker starts from a clean device.
    pub fn flush_all(&self) {
        for first in [TRANSIENT_FIRST, LOADED_SESSION_FIRST] {
            match self.get_handles(first) {
                Ok(handles) => {
                    for handle in handles {
                        self.context_flush(handle);
                    }
                }
                Err(rc) => warn!(
                    "flush_all: capability query failed: {}",
                    ResponseCode::from(rc)
                ),
            }
        }
    }

    /// Cached fixed property `pt`, fetched once at startup.
    #[must_use]
    pub fn get_fixed_property(&self, pt: u32) -> Option<u32> {
        self.fixed_properties.get(&pt).copied()
    }

    #[must_use]
    pub fn max_command_size(&self) -> u32 {
        self.max_command_size
    }

    #[must_use]
    pub fn max_response_size(&self) -> u32 {
        self.max_response_size
    }

    /// Transient object slots the TPM guarantees loadable.
    #[must_use]
    pub fn transient_limit(&self) -> u32 {
        self.transient_limit
    }

    /// Session slots the TPM guarantees loadable.
    #[must_use]
    pub fn session_limit(&self) -> u32 {
        self.session_limit
    }

    #[must_use]
    pub fn context_gap_max(&self) -> Option<u32> {
        self.get_fixed_property(PT_CONTEXT_GAP_MAX)
    }

    /// Attributes for `code` from the startup capability query; `None`
    /// when the TPM does not implement the command.
    #[must_use]
    pub fn command_attributes(&self, code: u32) -> Option<CommandAttributes> {
        self.command_attrs.lookup(code)
    }
}
