// SPDX-License-Identifier: GPL-3.0-or-later

//! An owned TPM command buffer paired with its originating connection
//! and the command attributes that describe its handle and auth areas.

use std::sync::Arc;
use tpm2_proto::{codec, CommandAttributes, Tag};

use crate::connection::Connection;

#[derive(Debug)]
pub struct Tpm2Command {
    connection: Arc<Connection>,
    buffer: Vec<u8>,
    attributes: CommandAttributes,
}

impl Tpm2Command {
    /// Wrap a framed command buffer. The buffer must already be at
    /// least a full header, which the command source guarantees.
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        buffer: Vec<u8>,
        attributes: CommandAttributes,
    ) -> Tpm2Command {
        Tpm2Command {
            connection,
            buffer,
            attributes,
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
        codec::command_code(&self.buffer)
    }

    #[must_use]
    pub fn tag(&self) -> u16 {
        codec::tag(&self.buffer)
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        codec::size(&self.buffer)
    }

    /// Number of handles in the handle area, from the attributes.
    #[must_use]
    pub fn handle_count(&self) -> u8 {
        self.attributes.handle_count()
    }

    #[must_use]
    pub fn handle(&self, index: u8) -> Option<u32> {
        codec::handle(&self.buffer, index, self.handle_count())
    }

    pub fn set_handle(&mut self, index: u8, handle: u32) -> bool {
        let count = self.handle_count();
        codec::set_handle(&mut self.buffer, index, count, handle)
    }

    /// True when the tag declares an authorization area.
    #[must_use]
    pub fn has_auths(&self) -> bool {
        self.tag() == Tag::Sessions as u16
    }

    /// Session handles referenced from the authorization area.
    ///
    /// # Errors
    ///
    /// Propagates [`codec::CodecError`] when the area is malformed.
    pub fn auth_session_handles(&self) -> Result<Vec<u32>, codec::CodecError> {
        codec::auth_session_handles(&self.buffer, self.handle_count())
    }

    /// The handle a `TPM2_FlushContext` command flushes.
    #[must_use]
    pub fn flush_handle(&self) -> Option<u32> {
        codec::flush_handle(&self.buffer)
    }

    pub fn set_flush_handle(&mut self, handle: u32) -> bool {
        codec::set_flush_handle(&mut self.buffer, handle)
    }
}
