// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{thread, time::Duration};

use anyhow::Result;
use h1_client_rs::{
    cfg::config::Config,
    client::pool::Pool,
    models::{message::SharedRequest, method::Method, request::ClientRequest},
};
use serial_test::serial;
use url::Url;

use crate::integration_tests::common::{ok_response, serve_with};

#[test]
#[serial]
fn a_stalled_response_times_out_and_closes() -> Result<()> {
    let (port, server) = serve_with(|mut conn| {
        conn.read_request().expect("the GET");
        // Dead air: never answer.
        thread::sleep(Duration::from_millis(600));
    });

    let mut cfg = Config::default();
    cfg.transport.timeout_connection = Some(Duration::from_millis(150));
    let pool = Pool::new(cfg);

    let url = Url::parse(&format!("http://127.0.0.1:{port}/slow"))?;
    let request = ClientRequest::new(url, Method::Get, None);
    let shared: SharedRequest = request.clone();
    pool.process_request(&shared, Some(Duration::from_millis(50)))?;

    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 0);
    let err = req.error.as_ref().expect("inactivity error recorded");
    assert!(err.is_timeout(), "got: {err}");
    drop(req);

    server.join().expect("server thread");
    Ok(())
}

#[test]
#[serial]
fn a_full_pool_evicts_the_oldest_idle_connection() -> Result<()> {
    let (port_a, server_a) = serve_with(|mut conn| {
        conn.read_request().expect("GET to a");
        conn.write_raw(&ok_response("a"));
    });
    let (port_b, server_b) = serve_with(|mut conn| {
        conn.read_request().expect("GET to b");
        conn.write_raw(&ok_response("b"));
    });

    let mut cfg = Config::default();
    cfg.pool.max_connections = 1;
    let pool = Pool::new(cfg);
    let timeout = Some(Duration::from_secs(5));

    let first = ClientRequest::new(
        Url::parse(&format!("http://127.0.0.1:{port_a}/"))?,
        Method::Get,
        None,
    );
    let shared: SharedRequest = first.clone();
    pool.process_request(&shared, timeout)?;
    server_a.join().expect("server a");
    assert_eq!(pool.idle_count(), 1);

    // The single slot is taken by the idle connection to A; queueing a
    // request for B must evict it rather than fail.
    let second = ClientRequest::new(
        Url::parse(&format!("http://127.0.0.1:{port_b}/"))?,
        Method::Get,
        None,
    );
    let shared: SharedRequest = second.clone();
    pool.process_request(&shared, timeout)?;
    server_b.join().expect("server b");

    assert_eq!(first.lock().expect("lock").res_body.as_ref(), b"a");
    assert_eq!(second.lock().expect("lock").res_body.as_ref(), b"b");
    assert_eq!(pool.idle_count(), 1, "only the connection to b remains");
    assert_eq!(pool.active_count(), 0);
    Ok(())
}
