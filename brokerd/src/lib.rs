// SPDX-License-Identifier: GPL-3.0-or-later
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

//! TPM 2.0 access broker and resource manager.
//!
//! A TPM can hold only a handful of transient objects and sessions at
//! once. This daemon multiplexes many clients onto the one device:
//! handles returned to clients are virtual, contexts are saved and
//! reloaded behind their backs as slots run out, and everything a
//! client loaded is flushed when it disconnects.

pub mod access_broker;
pub mod cancel;
pub mod command;
pub mod command_attrs;
pub mod command_source;
pub mod connection;
pub mod connection_manager;
pub mod handle_map;
pub mod ipc;
pub mod random;
pub mod resource_manager;
pub mod response;
pub mod session_list;
pub mod tcti;
