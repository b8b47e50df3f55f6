// SPDX-License-Identifier: GPL-3.0-or-later

//! Client-facing control socket.
//!
//! Clients reach the broker through a Unix domain socket carrying small
//! typed administrative messages. `CreateConnection` allocates a
//! dedicated socketpair for TPM traffic: the broker keeps one end,
//! registers the connection and spawns its worker, and passes the other
//! end back over the control socket as an `SCM_RIGHTS` descriptor next
//! to the 64 bit connection id. `Cancel` and `SetLocality` act on a
//! previously returned id. These messages are serviced locally; none of
//! them enter the TPM gate.
//!
//! Request framing: one opcode byte followed by its fixed payload.
//! Response framing: one status byte, then any payload.

use log::{debug, warn};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::cancel::{wait_readable, Wait};
use crate::command_source::CommandSource;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::random::Random;

/// Allocate a connection; reply carries the id and the stream fd.
pub const OP_CREATE_CONNECTION: u8 = 0x01;
/// Cancel the pending command of the identified connection.
pub const OP_CANCEL: u8 = 0x02;
/// Record the locality for the identified connection.
pub const OP_SET_LOCALITY: u8 = 0x03;

pub const STATUS_OK: u8 = 0x00;
/// The connection registry is at its bound.
pub const STATUS_FULL: u8 = 0x01;
/// No connection with the given id.
pub const STATUS_UNKNOWN_ID: u8 = 0x02;
/// Unrecognized opcode or truncated request.
pub const STATUS_BAD_REQUEST: u8 = 0x03;
/// The broker could not allocate the connection transport.
pub const STATUS_INTERNAL: u8 = 0x04;

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    manager: Arc<ConnectionManager>,
    source: CommandSource,
    random: Mutex<Random>,
    max_transient_objects: u32,
    cancel_fd: RawFd,
}

/// Send `payload` over `stream` with `fd` attached as `SCM_RIGHTS`
/// ancillary data, in one `sendmsg` call.
fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> std::io::Result<()> {
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut cmsg_buf = [0_u8; 64];
    let controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
    debug_assert!(controllen <= cmsg_buf.len());

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = std::ptr::addr_of!(iov).cast_mut();
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = controllen;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::copy_nonoverlapping(
            std::ptr::addr_of!(fd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            std::mem::size_of::<RawFd>(),
        );
        if libc::sendmsg(stream.as_raw_fd(), &msg, 0) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn read_u64(stream: &mut &UnixStream) -> std::io::Result<u64> {
    let mut bytes = [0_u8; 8];
    stream.read_exact(&mut bytes)?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_u8(stream: &mut &UnixStream) -> std::io::Result<u8> {
    let mut byte = [0_u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

impl IpcServer {
    /// Bind the control socket at `path`, replacing a stale socket file
    /// from an earlier run.
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub fn bind(
        path: &Path,
        manager: Arc<ConnectionManager>,
        source: CommandSource,
        random: Random,
        max_transient_objects: u32,
        cancel_fd: RawFd,
    ) -> std::io::Result<IpcServer> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        debug!("control socket bound at {}", path.display());
        Ok(IpcServer {
            listener,
            path: path.to_path_buf(),
            manager,
            source,
            random: Mutex::new(random),
            max_transient_objects,
            cancel_fd,
        })
    }

    /// Accept and service admin clients until the cancel pipe fires.
    pub fn run(self: Arc<Self>) {
        loop {
            match wait_readable(self.listener.as_raw_fd(), self.cancel_fd) {
                Wait::Readable => {}
                Wait::Canceled | Wait::Gone => break,
            }
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    thread::Builder::new()
                        .name("admin".to_string())
                        .spawn(move || server.serve_client(&stream))
                        .expect("failed to spawn admin worker");
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }

    /// One admin client; requests are serviced until it hangs up.
    fn serve_client(&self, stream: &UnixStream) {
        let mut reader = stream;
        loop {
            match wait_readable(stream.as_raw_fd(), self.cancel_fd) {
                Wait::Readable => {}
                Wait::Canceled | Wait::Gone => return,
            }
            let opcode = match read_u8(&mut reader) {
                Ok(opcode) => opcode,
                Err(_) => return,
            };
            let result = match opcode {
                OP_CREATE_CONNECTION => self.create_connection(stream),
                OP_CANCEL => self.cancel(stream, &mut reader),
                OP_SET_LOCALITY => self.set_locality(stream, &mut reader),
                _ => {
                    warn!("admin client sent unknown opcode {opcode:#04x}");
                    stream_write(stream, &[STATUS_BAD_REQUEST])
                }
            };
            if result.is_err() {
                return;
            }
        }
    }

    fn create_connection(&self, stream: &UnixStream) -> std::io::Result<()> {
        let id = {
            let mut random = self.random.lock().expect("random mutex poisoned");
            loop {
                let id = random.next_id();
                if !self.manager.contains_id(id) {
                    break id;
                }
            }
        };
        let Ok((ours, theirs)) = UnixStream::pair() else {
            return stream_write(stream, &[STATUS_INTERNAL]);
        };
        let connection = Arc::new(Connection::new(id, ours, self.max_transient_objects));
        if !self.manager.insert(connection.clone()) {
            return stream_write(stream, &[STATUS_FULL]);
        }
        // Workers are detached; they exit on hangup or cancel.
        let _ = self.source.spawn(connection);

        let mut payload = vec![STATUS_OK];
        payload.extend(id.to_be_bytes());
        let result = send_with_fd(stream, &payload, theirs.as_raw_fd());
        // `theirs` drops here; the client holds its own duplicate now.
        debug!("created connection {id:#018x}");
        result
    }

    fn cancel(&self, stream: &UnixStream, reader: &mut &UnixStream) -> std::io::Result<()> {
        let Ok(id) = read_u64(reader) else {
            return stream_write(stream, &[STATUS_BAD_REQUEST]);
        };
        match self.manager.lookup_id(id) {
            Some(connection) => {
                connection.request_cancel();
                stream_write(stream, &[STATUS_OK])
            }
            None => stream_write(stream, &[STATUS_UNKNOWN_ID]),
        }
    }

    fn set_locality(&self, stream: &UnixStream, reader: &mut &UnixStream) -> std::io::Result<()> {
        let (Ok(id), Ok(locality)) = (read_u64(reader), read_u8(reader)) else {
            return stream_write(stream, &[STATUS_BAD_REQUEST]);
        };
        match self.manager.lookup_id(id) {
            Some(connection) => {
                connection.set_locality(locality);
                stream_write(stream, &[STATUS_OK])
            }
            None => stream_write(stream, &[STATUS_UNKNOWN_ID]),
        }
    }
}

fn stream_write(stream: &UnixStream, payload: &[u8]) -> std::io::Result<()> {
    let mut writer = stream;
    writer.write_all(payload)
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
