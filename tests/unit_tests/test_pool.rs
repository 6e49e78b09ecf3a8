// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use h1_client_rs::{
    cfg::config::Config,
    client::pool::Pool,
    models::{
        error::Error,
        message::{HttpRequest, SharedRequest},
        method::Method,
        request::ClientRequest,
    },
};

use crate::unit_tests::url;

// Queueing never touches the network; stepping does.  These tests only
// queue, so unroutable targets are fine.
fn request_for(target_url: &str) -> SharedRequest {
    ClientRequest::new(url(target_url), Method::Get, None)
}

fn small_pool(max_connections: u32) -> std::sync::Arc<Pool> {
    let mut cfg = Config::default();
    cfg.pool.max_connections = max_connections;
    Pool::new(cfg)
}

#[test]
fn queueing_binds_one_connection_per_thread_and_target() {
    let pool = small_pool(10);
    let first = request_for("http://127.0.0.1:9001/a");
    let second = request_for("http://127.0.0.1:9001/b");
    let elsewhere = request_for("http://127.0.0.1:9002/");

    pool.queue_request(&first, None).expect("queue first");
    pool.queue_request(&second, None).expect("queue second");
    assert_eq!(
        pool.active_count(),
        1,
        "same thread and target share one connection"
    );

    pool.queue_request(&elsewhere, None).expect("queue elsewhere");
    assert_eq!(pool.active_count(), 2);
    assert_eq!(pool.thread_active_count(), 2);
    assert_eq!(pool.idle_count(), 0);
}

#[test]
fn saturated_pool_fails_fast_with_zero_timeout() {
    let pool = small_pool(1);
    let first = request_for("http://127.0.0.1:9003/");
    pool.queue_request(&first, None).expect("queue first");

    // The only slot is active on this thread for another target and there
    // is nothing idle to evict.
    let second = request_for("http://127.0.0.1:9004/");
    let err = pool
        .queue_request(&second, Some(Duration::ZERO))
        .expect_err("no slot available");
    assert!(matches!(err, Error::ManagerBusy));

    // A short timeout waits, then fails the same way.
    let err = pool
        .queue_request(&second, Some(Duration::from_millis(20)))
        .expect_err("still no slot");
    assert!(matches!(err, Error::ManagerBusy));
}

#[test]
fn unsupported_schemes_are_rejected_at_queue_time() {
    let pool = small_pool(4);
    let request = request_for("ftp://127.0.0.1:9005/file");
    let err = pool
        .queue_request(&request, None)
        .expect_err("ftp is not carried");
    assert!(matches!(err, Error::Http(_)));
    assert_eq!(pool.active_count(), 0, "no slot was committed");
}

#[test]
fn queueing_applies_the_default_user_agent() {
    let pool = small_pool(4);
    let request = ClientRequest::new(
        url("http://127.0.0.1:9006/"),
        Method::Get,
        None,
    );
    let shared: SharedRequest = request.clone();
    pool.queue_request(&shared, None).expect("queue");
    let req = request.lock().expect("request lock");
    let agent = req.header("User-Agent").expect("User-Agent applied");
    assert!(agent.starts_with("h1-client-rs/"));
}

#[test]
fn a_preset_user_agent_is_left_alone() {
    let pool = small_pool(4);
    let request = ClientRequest::new(
        url("http://127.0.0.1:9007/"),
        Method::Get,
        None,
    );
    request
        .lock()
        .expect("request lock")
        .set_header("User-Agent", "custom/1.0");
    let shared: SharedRequest = request.clone();
    pool.queue_request(&shared, None).expect("queue");
    assert_eq!(
        request
            .lock()
            .expect("request lock")
            .header("User-Agent"),
        Some("custom/1.0")
    );
}

#[test]
fn close_latches_and_refuses_new_requests() {
    let pool = small_pool(2);
    let request = request_for("http://127.0.0.1:9008/");
    pool.queue_request(&request, None).expect("queue");
    assert_eq!(pool.active_count(), 1);

    pool.close();
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.idle_count(), 0);

    let late = request_for("http://127.0.0.1:9009/");
    let err = pool
        .queue_request(&late, None)
        .expect_err("pool is closing");
    assert!(matches!(err, Error::ConnectionClosed));

    // Closing again is a no-op.
    pool.close();
}

#[test]
fn dns_cache_serves_and_flushes() {
    let pool = small_pool(2);
    let addrs = pool.dnslookup("127.0.0.1", 80).expect("loopback resolves");
    assert!(!addrs.is_empty());
    let again = pool.dnslookup("127.0.0.1", 80).expect("cached");
    assert_eq!(addrs, again);
    pool.flush_dns();
    let fresh = pool.dnslookup("127.0.0.1", 80).expect("re-resolved");
    assert_eq!(addrs, fresh);
}
