// SPDX-License-Identifier: GPL-3.0-or-later
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tpm2_proto::ResponseCode;

use tpm2_brokerd::access_broker::AccessBroker;
use tpm2_brokerd::cancel::CancelPipe;
use tpm2_brokerd::command_source::CommandSource;
use tpm2_brokerd::connection_manager::{ConnectionManager, MAX_CONNECTIONS_MAX};
use tpm2_brokerd::handle_map::MAX_ENTRIES_MAX;
use tpm2_brokerd::session_list::MAX_ENTRIES_MAX as MAX_SESSIONS_MAX;
use tpm2_brokerd::ipc::IpcServer;
use tpm2_brokerd::random::{Random, ENTROPY_FILE_DEFAULT};
use tpm2_brokerd::resource_manager::ResourceManager;
use tpm2_brokerd::session_list::SessionList;
use tpm2_brokerd::tcti::{DeviceTcti, SocketTcti, Tcti};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TctiKind {
    /// TPM character device
    Device,
    /// TPM simulator socket
    Socket,
    /// Unset; behaves as the device transport
    None,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Bound on concurrent client connections
    #[arg(long, default_value_t = 27, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_CONNECTIONS_MAX)))]
    max_connections: u32,
    /// Bound on transient objects per connection
    #[arg(long, default_value_t = 27, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_ENTRIES_MAX)))]
    max_transient_objects: u32,
    /// Bound on tracked sessions
    #[arg(long, default_value_t = 27, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_SESSIONS_MAX)))]
    max_sessions: u32,
    /// TPM transport
    #[arg(long, value_enum, default_value_t = TctiKind::Device)]
    tcti: TctiKind,
    /// Path of the TPM character device
    #[arg(long, default_value = "/dev/tpm0")]
    tcti_device_name: String,
    /// Address of the TPM simulator
    #[arg(long, default_value = "127.0.0.1")]
    tcti_socket_address: String,
    /// Port of the TPM simulator
    #[arg(long, default_value_t = 2321)]
    tcti_socket_port: u16,
    /// Path of the client control socket
    #[arg(long, default_value = "/run/tpm2-brokerd.sock")]
    socket_path: PathBuf,
    /// Seed source for connection ids
    #[arg(long, default_value = ENTROPY_FILE_DEFAULT)]
    entropy_file: PathBuf,
    /// Flush pre-existing transient objects and sessions at startup
    #[arg(long)]
    flush_on_startup: bool,
}

fn open_tcti(options: &Options) -> Result<Box<dyn Tcti>, String> {
    match options.tcti {
        TctiKind::Device | TctiKind::None => DeviceTcti::open(&options.tcti_device_name)
            .map(|tcti| Box::new(tcti) as Box<dyn Tcti>)
            .map_err(|err| format!("cannot open {}: {err}", options.tcti_device_name)),
        TctiKind::Socket => {
            SocketTcti::connect(&options.tcti_socket_address, options.tcti_socket_port)
                .map(|tcti| Box::new(tcti) as Box<dyn Tcti>)
                .map_err(|err| {
                    format!(
                        "cannot reach {}:{}: {err}",
                        options.tcti_socket_address, options.tcti_socket_port
                    )
                })
        }
    }
}

fn main() {
    env_logger::init();
    let options = Options::parse();
    debug!("{options:?}");

    let tcti = open_tcti(&options).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });

    let mut broker = AccessBroker::new(tcti);
    if let Err(rc) = broker.init_tpm() {
        error!("TPM initialization failed: {}", ResponseCode::from(rc));
        std::process::exit(1);
    }
    if options.flush_on_startup {
        broker.flush_all();
    }
    let broker = Arc::new(broker);

    let random = Random::seed_from_file(&options.entropy_file).unwrap_or_else(|err| {
        error!("cannot seed from {}: {err}", options.entropy_file.display());
        std::process::exit(1);
    });

    let session_list = Arc::new(SessionList::new(options.max_sessions));
    let manager = Arc::new(ConnectionManager::new(options.max_connections));
    let resource_manager = Arc::new(ResourceManager::new(
        broker.clone(),
        session_list,
        manager.clone(),
    ));

    {
        let weak = Arc::downgrade(&resource_manager);
        manager.subscribe_new(Box::new(move |connection| {
            if let Some(rm) = weak.upgrade() {
                rm.add_connection(connection);
            }
        }));
    }
    {
        let weak = Arc::downgrade(&resource_manager);
        manager.subscribe_removed(Box::new(move |connection| {
            if let Some(rm) = weak.upgrade() {
                rm.remove_connection(connection);
            }
        }));
    }

    let cancel = CancelPipe::new().unwrap_or_else(|err| {
        error!("cannot create cancel pipe: {err}");
        std::process::exit(1);
    });
    cancel.install_signal_handlers();

    let source = CommandSource::new(
        manager.clone(),
        resource_manager,
        broker,
        cancel.read_fd(),
    );

    let server = IpcServer::bind(
        &options.socket_path,
        manager.clone(),
        source,
        random,
        options.max_transient_objects,
        cancel.read_fd(),
    )
    .unwrap_or_else(|err| {
        error!("cannot bind {}: {err}", options.socket_path.display());
        std::process::exit(1);
    });
    let server = Arc::new(server);

    info!("accepting clients on {}", options.socket_path.display());
    server.run();

    info!("shutting down");
    manager.remove_all();
}
