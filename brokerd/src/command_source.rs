// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-connection command pump.
//!
//! One worker thread per connection polls the client stream alongside
//! the process-wide cancel pipe, frames one TPM command at a time,
//! hands it to the resource manager and writes the response back with a
//! single blocking write. Wire errors (EOF mid frame, impossible sizes)
//! remove the connection from the registry, which triggers the reap of
//! everything it owned; no response is sent for them.

use log::{debug, warn};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tpm2_proto::{codec, ResponseCode};

use crate::access_broker::AccessBroker;
use crate::cancel::{wait_readable, Wait};
use crate::command::Tpm2Command;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::resource_manager::ResourceManager;
use crate::response::Tpm2Response;

#[derive(Clone)]
pub struct CommandSource {
    manager: Arc<ConnectionManager>,
    resource_manager: Arc<ResourceManager>,
    broker: Arc<AccessBroker>,
    cancel_fd: RawFd,
}

impl CommandSource {
    #[must_use]
    pub fn new(
        manager: Arc<ConnectionManager>,
        resource_manager: Arc<ResourceManager>,
        broker: Arc<AccessBroker>,
        cancel_fd: RawFd,
    ) -> CommandSource {
        CommandSource {
            manager,
            resource_manager,
            broker,
            cancel_fd,
        }
    }

    /// Spawn the worker draining `connection`.
    pub fn spawn(&self, connection: Arc<Connection>) -> JoinHandle<()> {
        let source = self.clone();
        thread::Builder::new()
            .name(format!("conn-{:016x}", connection.id()))
            .spawn(move || source.run(&connection))
            .expect("failed to spawn connection worker")
    }

    fn run(&self, connection: &Arc<Connection>) {
        debug!("connection {:#018x}: worker up", connection.id());
        let max_command_size = self.broker.max_command_size();
        loop {
            match wait_readable(connection.fd(), self.cancel_fd) {
                Wait::Readable => {}
                Wait::Canceled => {
                    debug!("connection {:#018x}: worker canceled", connection.id());
                    break;
                }
                Wait::Gone => {
                    self.manager.remove(connection);
                    break;
                }
            }

            let Some(buffer) = self.read_command(connection, max_command_size) else {
                self.manager.remove(connection);
                break;
            };

            let code = codec::command_code(&buffer);
            let response = match self.broker.command_attributes(code) {
                Some(attributes) => self
                    .resource_manager
                    .service_command(Tpm2Command::new(connection.clone(), buffer, attributes)),
                None => {
                    debug!(
                        "connection {:#018x}: unknown command code {code:#010x}",
                        connection.id()
                    );
                    Tpm2Response::from_rc(
                        connection.clone(),
                        ResponseCode::CommandCode as u32,
                    )
                }
            };

            if let Err(err) = connection.stream().write_all(response.buffer()) {
                warn!(
                    "connection {:#018x}: response write failed: {err}",
                    connection.id()
                );
                self.manager.remove(connection);
                break;
            }

            if connection.is_doomed() {
                self.manager.remove(connection);
                break;
            }
        }
        debug!("connection {:#018x}: worker down", connection.id());
    }

    /// Frame one command: header first, then the remainder the header
    /// promises. `None` on EOF or a size outside
    /// `[HEADER_SIZE, max_command_size]`; the caller drops the
    /// connection.
    fn read_command(&self, connection: &Arc<Connection>, max_command_size: u32) -> Option<Vec<u8>> {
        let mut stream = connection.stream();
        let mut header = [0_u8; codec::HEADER_SIZE];
        if let Err(err) = stream.read_exact(&mut header) {
            debug!(
                "connection {:#018x}: client went away: {err}",
                connection.id()
            );
            return None;
        }
        let size = codec::size(&header);
        if (size as usize) < codec::HEADER_SIZE || size > max_command_size {
            warn!(
                "connection {:#018x}: bad command size {size}",
                connection.id()
            );
            return None;
        }
        let mut buffer = vec![0_u8; size as usize];
        buffer[..codec::HEADER_SIZE].copy_from_slice(&header);
        if let Err(err) = stream.read_exact(&mut buffer[codec::HEADER_SIZE..]) {
            warn!(
                "connection {:#018x}: short command body: {err}",
                connection.id()
            );
            return None;
        }
        Some(buffer)
    }
}
