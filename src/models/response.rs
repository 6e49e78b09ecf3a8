// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The concrete client response: a pull-driven HTTP/1.1 response parser.
//!
//! The parser never sees the socket.  It advertises through `recv_mode()`
//! what it wants next — the status line, the header block, a bounded run of
//! body bytes — and the connection's receive buffer carves exactly that out
//! of whatever has arrived.  Body framing follows RFC 7230 § 3.3.3:
//! `Content-Length`, chunked transfer coding, or read-until-close, with
//! HEAD and 1xx/204/304 responses carrying no body at all.
//!
//! An informational 1xx response completes like any other message but then
//! re-arms the parser for the real response, notifying the request so a
//! body held back by `Expect: 100-continue` can start flowing.
//!
//! A sink-backed body exerts backpressure: when the sink's `write` reports
//! `WouldBlock`, the unwritten bytes stay pending, `recv_mode()` switches to
//! [`RecvMode::Flush`] and the connection pumps the sink with
//! [`RecvData::Flush`] deliveries instead of feeding more body data.  The
//! message does not complete until the sink has drained.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, Weak},
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    client::common::lock,
    models::{
        error::Error,
        message::{HttpResponse, RecvData, RecvMode, StepSignals, Version},
        method::Method,
        request::ClientRequest,
    },
};

/// Everything the request-level policy needs to know about a finished
/// response, captured so the request never has to reach back into the
/// response object (and its lock) to decide what to do next.
#[derive(Debug, Default)]
pub struct ResponseOutcome {
    /// Final status; 0 for a response that never completed.
    pub status: u16,
    pub err: Option<Arc<Error>>,
    /// `Location` header, for redirect handling.
    pub location: Option<String>,
    /// Raw `WWW-Authenticate` values, for challenge handling.
    pub challenges: Vec<String>,
    /// The captured entity body; `None` when it was streamed to a sink.
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Constructed but not yet armed by `start_receiving`.
    Idle,
    StatusLine,
    Headers,
    FixedBody { left: usize },
    ChunkSize,
    ChunkData { left: usize },
    /// The CRLF trailing a chunk's data.
    ChunkEnd,
    /// Trailer lines after the last chunk, up to the blank line.
    ChunkTrailer,
    UntilClose,
    /// Body fully framed; a blocked sink still owes us progress.
    Draining,
    Complete,
}

pub struct ClientResponse {
    request: Weak<Mutex<ClientRequest>>,
    method: Method,
    state: ParseState,
    pub status: u16,
    pub reason: String,
    pub protocol: Option<Version>,
    headers: Vec<(String, String)>,
    body: BytesMut,
    sink: Option<Box<dyn Write + Send>>,
    /// Body bytes consumed from the wire that a blocked sink has not
    /// accepted yet.
    pending: BytesMut,
    keep_alive: bool,
}

impl ClientResponse {
    pub(crate) fn new(request: Weak<Mutex<ClientRequest>>, method: Method) -> Self {
        Self {
            request,
            method,
            state: ParseState::Idle,
            status: 0,
            reason: String::new(),
            protocol: None,
            headers: Vec::new(),
            body: BytesMut::new(),
            sink: None,
            pending: BytesMut::new(),
            keep_alive: true,
        }
    }

    /// Streams the entity body into `sink` instead of buffering it.
    ///
    /// A sink that reports `WouldBlock` throttles the whole exchange: the
    /// response advertises [`RecvMode::Flush`] until the backlog drains.
    pub fn set_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.sink = Some(sink);
    }

    /// First value of the named header, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn headers_all(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn parse_status_line(&mut self, line: &Bytes, signals: &mut StepSignals) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        let mut parts = text.splitn(3, ' ');
        let version = parts.next().and_then(Version::parse);
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        match (version, status) {
            (Some(version), Some(status)) if status >= 100 => {
                self.protocol = Some(version);
                self.status = status;
                self.reason = parts.next().unwrap_or_default().to_string();
                self.state = ParseState::Headers;
            },
            _ => {
                warn!(line = %text, "malformed status line");
                self.fail(
                    Error::Http(format!("malformed status line: {text}")),
                    signals,
                );
            },
        }
    }

    fn parse_header_lines(&mut self, lines: Vec<Bytes>, signals: &mut StepSignals) {
        for line in &lines {
            let text = String::from_utf8_lossy(line);
            let text = text.trim_end();
            if text.is_empty() {
                continue;
            }
            match text.split_once(':') {
                Some((name, value)) => self
                    .headers
                    .push((name.trim().to_string(), value.trim().to_string())),
                None => warn!(line = %text, "ignoring malformed header line"),
            }
        }
        self.handle_headers();
        self.arm_body(signals);
    }

    /// Hook: a complete set of response headers has arrived, before any of
    /// the associated data.
    fn handle_headers(&mut self) {
        debug!(
            status = self.status,
            reason = %self.reason,
            headers = self.headers.len(),
            "got response headers"
        );
    }

    /// Decides body framing and keep-alive once the header block is in.
    fn arm_body(&mut self, signals: &mut StepSignals) {
        self.keep_alive = match self.protocol {
            Some(Version::Http10) => self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive")),
            _ => !self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close")),
        };
        let bodyless = matches!(self.status, 100..=199 | 204 | 304)
            || self.method == Method::Head;
        if bodyless {
            self.complete(signals);
            return;
        }
        if self
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            self.state = ParseState::ChunkSize;
            return;
        }
        let content_length = self.header("Content-Length").map(str::to_string);
        match content_length {
            Some(value) => match value.parse::<usize>() {
                Ok(0) => self.complete(signals),
                Ok(length) => {
                    self.state = ParseState::FixedBody { left: length }
                },
                Err(_) => self.fail(
                    Error::Http(format!("bad Content-Length: {value}")),
                    signals,
                ),
            },
            None => {
                // An unframed body can only be delimited by the server
                // closing the connection.
                self.keep_alive = false;
                self.state = ParseState::UntilClose;
            },
        }
    }

    fn write_body(&mut self, chunk: &Bytes) {
        if self.sink.is_some() {
            self.pending.extend_from_slice(chunk);
            self.pump_sink();
        } else {
            self.body.extend_from_slice(chunk);
        }
    }

    /// Pushes pending bytes into the sink until it blocks or drains.
    fn pump_sink(&mut self) {
        let Some(sink) = &mut self.sink else {
            return;
        };
        while !self.pending.is_empty() {
            match sink.write(&self.pending) {
                Ok(0) => break,
                Ok(written) => {
                    let _ = self.pending.split_to(written);
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("response sink write failed: {err}");
                    self.pending.clear();
                    break;
                },
            }
        }
    }

    /// Body framing is done; completion may still have to wait for a
    /// blocked sink to drain.
    fn finish_message(&mut self, signals: &mut StepSignals) {
        if self.pending.is_empty() {
            self.complete(signals);
        } else {
            self.state = ParseState::Draining;
        }
    }

    fn parse_chunk_size(&mut self, line: &Bytes, signals: &mut StepSignals) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        let digits = text.split(';').next().unwrap_or_default().trim();
        match usize::from_str_radix(digits, 16) {
            Ok(0) => self.state = ParseState::ChunkTrailer,
            Ok(size) => self.state = ParseState::ChunkData { left: size },
            Err(_) => self.fail(
                Error::Http(format!("bad chunk size line: {text}")),
                signals,
            ),
        }
    }

    /// Hook: normal completion of the message framing.
    fn handle_message(&mut self) {
        debug!(status = self.status, "response complete");
    }

    /// Notifies the request of normal completion and, for a 1xx response,
    /// re-arms to read the real one.
    fn complete(&mut self, signals: &mut StepSignals) {
        if !self.pending.is_empty() {
            // Only reachable through the disconnect path; the sink never
            // took these bytes and never will.
            warn!(
                bytes = self.pending.len(),
                "dropping body bytes the sink never accepted"
            );
            self.pending.clear();
        }
        self.handle_message();
        let body = match &mut self.sink {
            Some(sink) => {
                if let Err(err) = sink.flush() {
                    warn!("response sink flush failed: {err}");
                }
                None
            },
            None => Some(self.body.split().freeze()),
        };
        let outcome = ResponseOutcome {
            status: self.status,
            err: None,
            location: self.header("Location").map(str::to_string),
            challenges: self.headers_all("WWW-Authenticate"),
            body,
        };
        let informational = (100..=199).contains(&self.status);
        self.notify_request(outcome, signals);
        if informational {
            // Not done yet: the final status is still on its way.
            self.start_receiving();
        } else {
            self.state = ParseState::Complete;
        }
    }

    fn fail(&mut self, err: Error, signals: &mut StepSignals) {
        self.state = ParseState::Complete;
        let outcome = ResponseOutcome {
            err: Some(Arc::new(err)),
            ..ResponseOutcome::default()
        };
        self.notify_request(outcome, signals);
    }

    fn notify_request(
        &mut self,
        outcome: ResponseOutcome,
        signals: &mut StepSignals,
    ) {
        if let Some(request) = self.request.upgrade() {
            lock(&request).response_finished(outcome, signals);
        }
    }
}

impl HttpResponse for ClientResponse {
    fn start_receiving(&mut self) {
        self.state = ParseState::StatusLine;
        self.status = 0;
        self.reason.clear();
        self.headers.clear();
        self.body.clear();
        self.pending.clear();
        self.keep_alive = true;
    }

    fn recv_mode(&self) -> Option<RecvMode> {
        if !self.pending.is_empty() {
            // The sink owes us progress before we accept more body bytes.
            return Some(RecvMode::Flush);
        }
        match self.state {
            ParseState::Idle | ParseState::StatusLine => Some(RecvMode::Line),
            ParseState::Headers => Some(RecvMode::Headers),
            ParseState::FixedBody { left } => {
                Some(RecvMode::Bytes(left.min(8 * 1024)))
            },
            ParseState::ChunkSize
            | ParseState::ChunkEnd
            | ParseState::ChunkTrailer => Some(RecvMode::Line),
            ParseState::ChunkData { left } => {
                Some(RecvMode::Bytes(left.min(8 * 1024)))
            },
            ParseState::UntilClose => Some(RecvMode::UntilClose),
            ParseState::Draining => Some(RecvMode::Flush),
            ParseState::Complete => None,
        }
    }

    fn recv(&mut self, data: RecvData, signals: &mut StepSignals) {
        match (self.state, data) {
            (ParseState::Idle | ParseState::StatusLine, RecvData::Line(line)) => {
                self.parse_status_line(&line, signals);
            },
            (ParseState::Headers, RecvData::Lines(lines)) => {
                self.parse_header_lines(lines, signals);
            },
            (ParseState::FixedBody { left }, RecvData::Chunk(chunk)) => {
                let left = left.saturating_sub(chunk.len());
                self.write_body(&chunk);
                if left == 0 {
                    self.finish_message(signals);
                } else {
                    self.state = ParseState::FixedBody { left };
                }
            },
            (ParseState::ChunkSize, RecvData::Line(line)) => {
                self.parse_chunk_size(&line, signals);
            },
            (ParseState::ChunkData { left }, RecvData::Chunk(chunk)) => {
                let left = left.saturating_sub(chunk.len());
                self.write_body(&chunk);
                self.state = if left == 0 {
                    ParseState::ChunkEnd
                } else {
                    ParseState::ChunkData { left }
                };
            },
            (ParseState::ChunkEnd, RecvData::Line(_)) => {
                self.state = ParseState::ChunkSize;
            },
            (ParseState::ChunkTrailer, RecvData::Line(line)) => {
                if line.as_ref() == b"\r\n" {
                    self.finish_message(signals);
                }
                // Trailer fields are read and discarded.
            },
            (ParseState::UntilClose, RecvData::Chunk(chunk)) => {
                self.write_body(&chunk);
            },
            (_, RecvData::Flush) => {
                self.pump_sink();
                if self.pending.is_empty()
                    && matches!(self.state, ParseState::Draining)
                {
                    self.complete(signals);
                }
            },
            (state, data) => {
                warn!(?state, ?data, "response fed data it did not ask for");
            },
        }
    }

    fn handle_disconnect(&mut self, err: Option<Arc<Error>>) {
        let mut signals = StepSignals::default();
        if matches!(self.state, ParseState::Complete) {
            return;
        }
        if err.is_none()
            && matches!(
                self.state,
                ParseState::UntilClose | ParseState::Draining
            )
        {
            // Reading until close, the disconnect is the end of the body;
            // a draining message was already fully framed.  Either way,
            // give a blocked sink one last chance before completing.
            self.pump_sink();
            self.complete(&mut signals);
            return;
        }
        if let Some(err) = &err {
            self.reason = err.to_string();
        }
        let err = err.unwrap_or_else(|| {
            Arc::new(Error::Http(
                "connection closed before response completed".to_string(),
            ))
        });
        self.state = ParseState::Complete;
        let outcome = ResponseOutcome {
            err: Some(err),
            ..ResponseOutcome::default()
        };
        self.notify_request(outcome, &mut signals);
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn protocol(&self) -> Option<Version> {
        self.protocol
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}
