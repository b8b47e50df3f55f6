// SPDX-License-Identifier: GPL-3.0-or-later

//! An owned TPM response buffer on its way back to a connection.

use std::sync::Arc;
use tpm2_proto::{codec, CommandAttributes, HandleType, ResponseCode, Tag};

use crate::connection::Connection;

#[derive(Debug)]
pub struct Tpm2Response {
    connection: Arc<Connection>,
    buffer: Vec<u8>,
    attributes: CommandAttributes,
}

impl Tpm2Response {
    /// Wrap a response received from the TPM. `attributes` are those of
    /// the command that produced it.
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        buffer: Vec<u8>,
        attributes: CommandAttributes,
    ) -> Tpm2Response {
        Tpm2Response {
            connection,
            buffer,
            attributes,
        }
    }

    /// A synthetic header-only response carrying `rc`, used wherever
    /// the broker answers without dispatching to the TPM.
    #[must_use]
    pub fn from_rc(connection: Arc<Connection>, rc: u32) -> Tpm2Response {
        let mut buffer = Vec::with_capacity(codec::HEADER_SIZE);
        buffer.extend((Tag::NoSessions as u16).to_be_bytes());
        buffer.extend(u32::try_from(codec::HEADER_SIZE).expect("header fits u32").to_be_bytes());
        buffer.extend(rc.to_be_bytes());
        Tpm2Response {
            connection,
            buffer,
            attributes: CommandAttributes::empty(),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn attributes(&self) -> CommandAttributes {
        self.attributes
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        codec::response_code(&self.buffer)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code() == ResponseCode::Success as u32
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        codec::size(&self.buffer)
    }

    #[must_use]
    pub fn tag(&self) -> u16 {
        codec::tag(&self.buffer)
    }

    /// True when this response carries a newly allocated handle: the
    /// command's `rHandle` attribute is set and the payload is present.
    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.attributes.has_response_handle() && codec::response_handle(&self.buffer).is_some()
    }

    #[must_use]
    pub fn handle(&self) -> Option<u32> {
        if self.attributes.has_response_handle() {
            codec::response_handle(&self.buffer)
        } else {
            None
        }
    }

    /// Type byte of the carried handle.
    #[must_use]
    pub fn handle_type(&self) -> Option<HandleType> {
        self.handle().and_then(HandleType::of)
    }

    pub fn set_handle(&mut self, handle: u32) -> bool {
        if !self.attributes.has_response_handle() {
            return false;
        }
        codec::set_response_handle(&mut self.buffer, handle)
    }
}
