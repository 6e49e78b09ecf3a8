// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use h1_client_rs::models::method::Method;

#[test]
fn parses_and_prints_wire_tokens() {
    for token in [
        "GET", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE", "POST",
        "CONNECT", "PATCH",
    ] {
        let method = Method::try_from(token).expect("known method");
        assert_eq!(method.raw(), token);
    }
    assert!(Method::try_from("get").is_err(), "method tokens are case sensitive");
    assert!(Method::try_from("BREW").is_err());
}

#[test]
fn idempotent_methods_may_pipeline() {
    let safe = [
        Method::Get,
        Method::Head,
        Method::Put,
        Method::Delete,
        Method::Options,
        Method::Trace,
    ];
    for method in safe {
        assert!(method.is_idempotent(), "{method} should pipeline");
    }
    for method in [Method::Post, Method::Connect, Method::Patch] {
        assert!(!method.is_idempotent(), "{method} must stall the pipeline");
    }
}
