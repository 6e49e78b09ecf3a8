// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A deliberately dumb single-connection HTTP server for driving the real
//! engine over loopback sockets.  Each test scripts the exact byte exchange
//! it expects; anything off-script fails the server thread and, through the
//! join, the test.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
};

pub struct ServerConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ServerConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn fill(&mut self) -> bool {
        let mut tmp = [0u8; 4096];
        match self.stream.read(&mut tmp) {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&tmp[..n]);
                true
            },
        }
    }

    /// Reads one request head through the blank line, leaving any body (or
    /// pipelined follow-up request) buffered.
    pub fn read_head(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..pos + 4).collect();
                return Some(String::from_utf8_lossy(&head).into_owned());
            }
            if !self.fill() {
                return None;
            }
        }
    }

    /// Reads a full request, consuming the body advertised by
    /// Content-Length.
    pub fn read_request(&mut self) -> Option<(String, Vec<u8>)> {
        let head = self.read_head()?;
        let body = self.read_body(content_length(&head))?;
        Some((head, body))
    }

    pub fn read_body(&mut self, length: usize) -> Option<Vec<u8>> {
        while self.buf.len() < length {
            if !self.fill() {
                return None;
            }
        }
        Some(self.buf.drain(..length).collect())
    }

    /// Bytes received but not yet consumed; lets a script assert that
    /// nothing has been pipelined behind what it already read.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn write_raw(&mut self, raw: &str) {
        self.stream
            .write_all(raw.as_bytes())
            .expect("mock server write");
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(head: &str) -> usize {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            return value.trim().parse().unwrap_or(0);
        }
    }
    0
}

/// Binds a throwaway loopback port and serves exactly one connection with
/// the given script.  A test that opens a second connection hangs against
/// the closed listener and fails on its driver timeout.
pub fn serve_with<F, T>(script: F) -> (u16, JoinHandle<T>)
where
    F: FnOnce(ServerConn) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        script(ServerConn::new(stream))
    });
    (port, handle)
}

pub fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
        body.len(),
        body
    )
}
