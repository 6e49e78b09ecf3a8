// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use h1_client_rs::models::{
    error::Error,
    message::{HttpResponse, RecvData, RecvMode, StepSignals, Version},
    method::Method,
    request::ClientRequest,
};

use crate::unit_tests::url;

fn line(s: &'static str) -> RecvData {
    RecvData::Line(Bytes::from_static(s.as_bytes()))
}

fn lines(all: &[&'static str]) -> RecvData {
    RecvData::Lines(
        all.iter()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .collect(),
    )
}

fn chunk(s: &'static str) -> RecvData {
    RecvData::Chunk(Bytes::from_static(s.as_bytes()))
}

#[test]
fn parses_a_content_length_response() {
    let request = ClientRequest::new(url("http://h/"), Method::Get, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        assert_eq!(resp.recv_mode(), Some(RecvMode::Line));
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::Headers));
        resp.recv(
            lines(&["Content-Length: 5\r\n", "Connection: keep-alive\r\n", "\r\n"]),
            &mut sig,
        );
        assert_eq!(resp.recv_mode(), Some(RecvMode::Bytes(5)));
        resp.recv(chunk("hello"), &mut sig);
        assert_eq!(resp.recv_mode(), None, "response complete");
        assert!(resp.keep_alive());
        assert_eq!(resp.protocol(), Some(Version::Http11));
        assert_eq!(resp.reason, "OK");
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 200);
    assert_eq!(req.res_body.as_ref(), b"hello");
    assert!(req.error.is_none());
}

#[test]
fn decodes_chunked_transfer_coding() {
    let request = ClientRequest::new(url("http://h/"), Method::Get, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Transfer-Encoding: chunked\r\n", "\r\n"]), &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::Line));
        resp.recv(line("5\r\n"), &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::Bytes(5)));
        resp.recv(chunk("hello"), &mut sig);
        resp.recv(line("\r\n"), &mut sig);
        resp.recv(line("2\r\n"), &mut sig);
        resp.recv(chunk(", "), &mut sig);
        resp.recv(line("\r\n"), &mut sig);
        resp.recv(line("0\r\n"), &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::Line), "trailer section");
        resp.recv(line("\r\n"), &mut sig);
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 200);
    assert_eq!(req.res_body.as_ref(), b"hello, ");
}

#[test]
fn reads_until_close_and_completes_on_clean_disconnect() {
    let request = ClientRequest::new(url("http://h/"), Method::Get, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Server: old\r\n", "\r\n"]), &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::UntilClose));
        assert!(
            !resp.keep_alive(),
            "an unframed body can only end with a close"
        );
        resp.recv(chunk("first "), &mut sig);
        resp.recv(chunk("second"), &mut sig);
        resp.handle_disconnect(None);
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 200);
    assert_eq!(req.res_body.as_ref(), b"first second");
    assert!(req.error.is_none());
}

#[test]
fn head_responses_have_no_body() {
    let request = ClientRequest::new(url("http://h/"), Method::Head, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Content-Length: 1234\r\n", "\r\n"]), &mut sig);
        assert_eq!(resp.recv_mode(), None, "HEAD never carries a body");
    }
    assert_eq!(request.lock().expect("request lock").status, 200);
}

#[test]
fn informational_response_rearms_the_parser() {
    let request = ClientRequest::new(
        url("http://h/upload"),
        Method::Put,
        Some(Bytes::from_static(b"data")),
    );
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 100 Continue\r\n"), &mut sig);
        resp.recv(lines(&["\r\n"]), &mut sig);
        // Not complete: the parser is waiting for the real status line.
        assert_eq!(resp.recv_mode(), Some(RecvMode::Line));
        assert_eq!(request.lock().expect("request lock").status, 100);

        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Content-Length: 2\r\n", "\r\n"]), &mut sig);
        resp.recv(chunk("ok"), &mut sig);
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 200);
    assert_eq!(req.res_body.as_ref(), b"ok");
}

/// Accepts at most the budgeted number of bytes, then reports `WouldBlock`
/// until the test grants more room.
struct ThrottledSink {
    data: Arc<Mutex<Vec<u8>>>,
    room: Arc<Mutex<usize>>,
}

impl std::io::Write for ThrottledSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut room = self.room.lock().expect("sink room");
        if *room == 0 {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        let take = buf.len().min(*room);
        *room -= take;
        self.data
            .lock()
            .expect("sink data")
            .extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn a_blocked_sink_backpressures_through_flush() {
    let request = ClientRequest::new(url("http://h/file"), Method::Get, None);
    let data = Arc::new(Mutex::new(Vec::new()));
    let room = Arc::new(Mutex::new(4usize));
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        resp.set_sink(Box::new(ThrottledSink {
            data: data.clone(),
            room: room.clone(),
        }));
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Content-Length: 10\r\n", "\r\n"]), &mut sig);
        resp.recv(chunk("helloworld"), &mut sig);
        // The sink took four bytes and blocked.  The body is fully framed
        // but the response must not complete while the sink owes us six.
        assert_eq!(resp.recv_mode(), Some(RecvMode::Flush));
        assert_eq!(
            request.lock().expect("request lock").status,
            0,
            "not reported to the request yet"
        );

        // Pumping against a still-blocked sink keeps the backpressure on.
        resp.recv(RecvData::Flush, &mut sig);
        assert_eq!(resp.recv_mode(), Some(RecvMode::Flush));

        *room.lock().expect("sink room") = usize::MAX;
        resp.recv(RecvData::Flush, &mut sig);
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 200);
    assert!(req.res_body.is_empty(), "the body went to the sink");
    assert_eq!(data.lock().expect("sink data").as_slice(), b"helloworld");
}

#[test]
fn malformed_status_line_fails_the_request() {
    let request = ClientRequest::new(url("http://h/"), Method::Get, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("SMTP nonsense\r\n"), &mut sig);
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 0);
    assert!(req.error.is_some());
}

#[test]
fn disconnect_mid_message_surfaces_the_error() {
    let request = ClientRequest::new(url("http://h/"), Method::Get, None);
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 200 OK\r\n"), &mut sig);
        resp.recv(lines(&["Content-Length: 100\r\n", "\r\n"]), &mut sig);
        resp.handle_disconnect(Some(Arc::new(Error::Http(
            "connection reset".to_string(),
        ))));
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 0);
    assert!(req.error.is_some());
}

#[test]
fn redirect_status_is_kept_when_auto_redirect_is_off() {
    let request = ClientRequest::new(url("http://h/old"), Method::Get, None);
    request.lock().expect("request lock").auto_redirect = false;
    let response = request.lock().expect("request lock").client_response();
    {
        let mut resp = response.lock().expect("response lock");
        let mut sig = StepSignals::default();
        resp.start_receiving();
        resp.recv(line("HTTP/1.1 302 Found\r\n"), &mut sig);
        resp.recv(
            lines(&["Location: /new\r\n", "Content-Length: 0\r\n", "\r\n"]),
            &mut sig,
        );
        assert_eq!(resp.recv_mode(), None);
    }
    let req = request.lock().expect("request lock");
    assert_eq!(req.status, 302, "no redirect without auto_redirect");
    assert_eq!(req.url.path(), "/old");
}
