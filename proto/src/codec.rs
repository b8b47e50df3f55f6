// SPDX-License-Identifier: MIT

//! Byte-level access to TPM 2.0 command and response buffers.
//!
//! Commands and responses share a fixed 10 byte header: a `u16` tag, a
//! `u32` total size and a `u32` command or response code, all big endian.
//! Commands may carry up to three handles immediately after the header
//! and, when the tag is `TPM_ST_SESSIONS`, a size-prefixed authorization
//! area after the handles. Responses whose command has the `rHandle`
//! attribute carry the new handle in the first four payload bytes.
//!
//! Callers are expected to have validated the buffer against
//! [`HEADER_SIZE`] once at framing time; accessors over the fixed header
//! index directly, everything beyond it is bounds checked.

use core::mem::size_of;

/// Size of the fixed command/response header.
pub const HEADER_SIZE: usize = 10;

const HANDLE_SIZE: usize = size_of::<u32>();

/// Errors produced when a buffer does not parse as its header claims.
#[derive(Debug, strum_macros::Display, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ends before a field the header promises.
    Truncated,
    /// The authorization area size disagrees with its contents.
    AuthArea,
}

fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// The header tag.
#[must_use]
pub fn tag(buf: &[u8]) -> u16 {
    be16(buf, 0)
}

/// The total message size from the header.
#[must_use]
pub fn size(buf: &[u8]) -> u32 {
    be32(buf, 2)
}

/// The command code of a command buffer.
#[must_use]
pub fn command_code(buf: &[u8]) -> u32 {
    be32(buf, 6)
}

/// The response code of a response buffer.
#[must_use]
pub fn response_code(buf: &[u8]) -> u32 {
    be32(buf, 6)
}

fn handle_offset(index: u8) -> usize {
    HEADER_SIZE + HANDLE_SIZE * index as usize
}

/// Handle at 0-based `index` in the handle area of a command carrying
/// `count` handles. `None` when the index is out of range or the buffer
/// is shorter than the handle area.
#[must_use]
pub fn handle(buf: &[u8], index: u8, count: u8) -> Option<u32> {
    let offset = handle_offset(index);
    if index >= count || buf.len() < offset + HANDLE_SIZE {
        return None;
    }
    Some(be32(buf, offset))
}

/// Overwrite the handle at 0-based `index`. The message size is not
/// affected since handles are fixed width. Returns false when the index
/// is out of range.
pub fn set_handle(buf: &mut [u8], index: u8, count: u8, handle: u32) -> bool {
    let offset = handle_offset(index);
    if index >= count || buf.len() < offset + HANDLE_SIZE {
        return false;
    }
    buf[offset..offset + HANDLE_SIZE].copy_from_slice(&handle.to_be_bytes());
    true
}

/// Handle carried in the first four payload bytes of a response.
#[must_use]
pub fn response_handle(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_SIZE + HANDLE_SIZE {
        return None;
    }
    Some(be32(buf, HEADER_SIZE))
}

/// Overwrite the handle in the first four payload bytes of a response.
pub fn set_response_handle(buf: &mut [u8], handle: u32) -> bool {
    if buf.len() < HEADER_SIZE + HANDLE_SIZE {
        return false;
    }
    buf[HEADER_SIZE..HEADER_SIZE + HANDLE_SIZE].copy_from_slice(&handle.to_be_bytes());
    true
}

/// The handle flushed by a `TPM2_FlushContext` command.
///
/// The flushed handle is not in the handle area and is not declared in
/// the command attributes; it is the first parameter. Since the command
/// has no other handles or authorizations the parameter sits where the
/// first handle would.
#[must_use]
pub fn flush_handle(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_SIZE + HANDLE_SIZE {
        return None;
    }
    Some(be32(buf, HEADER_SIZE))
}

/// Overwrite the handle flushed by a `TPM2_FlushContext` command.
pub fn set_flush_handle(buf: &mut [u8], handle: u32) -> bool {
    if buf.len() < HEADER_SIZE + HANDLE_SIZE {
        return false;
    }
    buf[HEADER_SIZE..HEADER_SIZE + HANDLE_SIZE].copy_from_slice(&handle.to_be_bytes());
    true
}

/// Session handles referenced by the authorization area of a command
/// carrying `handle_count` handles, in order of appearance.
///
/// Each authorization is `{sessionHandle: u32, nonce: TPM2B,
/// sessionAttributes: u8, hmac: TPM2B}`; the walk steps over the
/// size-prefixed fields the way the TPM itself consumes the area.
///
/// # Errors
///
/// [`CodecError`] when the area size runs past the buffer or an
/// authorization is cut short.
pub fn auth_session_handles(buf: &[u8], handle_count: u8) -> Result<Vec<u32>, CodecError> {
    let area_offset = handle_offset(handle_count);
    if buf.len() < area_offset + size_of::<u32>() {
        return Err(CodecError::Truncated);
    }
    let area_size = be32(buf, area_offset) as usize;
    let first = area_offset + size_of::<u32>();
    let end = first
        .checked_add(area_size)
        .ok_or(CodecError::AuthArea)?;
    if buf.len() < end {
        return Err(CodecError::Truncated);
    }

    let mut handles = Vec::new();
    let mut offset = first;
    while offset < end {
        if offset + HANDLE_SIZE + size_of::<u16>() > end {
            return Err(CodecError::AuthArea);
        }
        handles.push(be32(buf, offset));
        offset += HANDLE_SIZE;
        let nonce_size = be16(buf, offset) as usize;
        offset += size_of::<u16>() + nonce_size;
        // session attributes byte, then the hmac TPM2B
        offset += size_of::<u8>();
        if offset + size_of::<u16>() > end {
            return Err(CodecError::AuthArea);
        }
        let hmac_size = be16(buf, offset) as usize;
        offset += size_of::<u16>() + hmac_size;
        if offset > end {
            return Err(CodecError::AuthArea);
        }
    }
    Ok(handles)
}
