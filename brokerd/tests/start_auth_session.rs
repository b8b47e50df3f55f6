// SPDX-License-Identifier: GPL-3.0-or-later

//! Session tracking: load-order bookkeeping, save-based eviction,
//! transparent reload, flushing, reaping.

mod common;

use common::{build_flush_context, build_sign, harness, harness_with};
use tpm2_proto::{HandleType, ResponseCode};

#[test]
fn session_is_tracked_on_start() {
    let h = harness();
    let conn = h.connect(1);

    let handle = h.start_session(&conn);
    assert!(HandleType::of(handle).unwrap().is_session());

    assert_eq!(h.session_list.size(), 1);
    assert_eq!(h.session_list.loaded_count(), 1);
    let entry = h.session_list.lookup_handle(handle).unwrap();
    assert_eq!(entry.lock().unwrap().connection_id, 1);

    let state = h.state.lock().unwrap();
    assert!(state.loaded_sessions.contains(&handle));
    assert!(state.saved_sessions.is_empty());
}

#[test]
fn sessions_evict_least_recently_loaded() {
    // TPM holds 3 sessions; starting a 4th saves the oldest.
    let h = harness();
    let conn = h.connect(1);

    let first = h.start_session(&conn);
    for _ in 0..3 {
        h.start_session(&conn);
    }

    assert_eq!(h.session_list.size(), 4);
    assert_eq!(h.session_list.loaded_count(), 3);
    let entry = h.session_list.lookup_handle(first).unwrap();
    assert!(!entry.lock().unwrap().is_loaded());

    let state = h.state.lock().unwrap();
    assert_eq!(state.loaded_sessions.len(), 3);
    assert!(state.saved_sessions.contains(&first));
}

#[test]
fn saved_session_reloads_when_referenced() {
    let h = harness();
    let conn = h.connect(1);

    let first = h.start_session(&conn);
    for _ in 0..3 {
        h.start_session(&conn);
    }
    assert!(!h
        .session_list
        .lookup_handle(first)
        .unwrap()
        .lock()
        .unwrap()
        .is_loaded());

    // An authorization referencing the saved session forces it back in.
    let object = h.create_primary(&conn);
    let response = h.service(&conn, build_sign(object, first));
    assert!(response.is_success(), "rc {:#010x}", response.code());

    let entry = h.session_list.lookup_handle(first).unwrap();
    assert!(entry.lock().unwrap().is_loaded());
    // Reloading made it the most recently loaded.
    let head = &h.session_list.entries()[0];
    assert_eq!(head.lock().unwrap().phandle, first);

    let state = h.state.lock().unwrap();
    assert!(state.loaded_sessions.contains(&first));
    assert_eq!(state.loaded_sessions.len(), 3);
    assert_eq!(state.saved_sessions.len(), 1);
}

#[test]
fn flush_drops_the_session_entry() {
    let h = harness();
    let conn = h.connect(1);
    let handle = h.start_session(&conn);

    let response = h.service(&conn, build_flush_context(handle));
    assert!(response.is_success());
    assert_eq!(h.session_list.size(), 0);
    assert!(h.state.lock().unwrap().loaded_sessions.is_empty());
}

#[test]
fn session_list_bound_is_enforced() {
    let h = harness_with(3, 3, 27, 27, 2);
    let conn = h.connect(1);
    h.start_session(&conn);
    h.start_session(&conn);

    let dispatched_before = h.state.lock().unwrap().received.len();
    let response = h.service(&conn, common::build_start_auth_session());
    assert_eq!(response.code(), ResponseCode::SessionMemory as u32);
    assert_eq!(h.state.lock().unwrap().received.len(), dispatched_before);
    assert_eq!(h.session_list.size(), 2);
}

#[test]
fn malformed_auth_area_is_rejected() {
    let h = harness();
    let conn = h.connect(1);
    let object = h.create_primary(&conn);

    // An authSize pointing past the end of the buffer.
    let mut cmd = build_sign(object, 0x0200_0001);
    let size = cmd.len();
    cmd[14..18].copy_from_slice(&u32::try_from(size * 2).unwrap().to_be_bytes());

    let dispatched_before = h.state.lock().unwrap().received.len();
    let response = h.service(&conn, cmd);
    assert_eq!(response.code(), ResponseCode::AuthSize as u32);
    assert_eq!(h.state.lock().unwrap().received.len(), dispatched_before);
}

#[test]
fn disconnect_reaps_sessions_and_objects() {
    let h = harness();
    let conn = h.connect(1);
    for _ in 0..3 {
        h.create_primary(&conn);
    }
    let session = h.start_session(&conn);

    assert!(h.manager.remove(&conn));

    // All per-connection state is gone, loaded or saved.
    assert_eq!(h.session_list.size(), 0);
    assert_eq!(conn.transient_map().size(), 0);
    let state = h.state.lock().unwrap();
    assert!(state.objects.is_empty());
    assert!(!state.loaded_sessions.contains(&session));
}

#[test]
fn other_connections_survive_a_reap() {
    let h = harness();
    let conn_a = h.connect(1);
    let conn_b = h.connect(2);

    let object_b = h.create_primary(&conn_b);
    h.create_primary(&conn_a);
    let session_b = h.start_session(&conn_b);

    assert!(h.manager.remove(&conn_a));

    // B's object and session are untouched and still usable.
    assert_eq!(h.session_list.size(), 1);
    assert_eq!(conn_b.transient_map().size(), 1);
    let response = h.service(&conn_b, build_sign(object_b, session_b));
    assert!(response.is_success(), "rc {:#010x}", response.code());
}
