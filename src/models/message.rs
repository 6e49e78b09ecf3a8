// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The trait seam between the connection engine and the HTTP messages it
//! moves.
//!
//! The engine never parses or serializes HTTP itself.  It pushes opaque byte
//! chunks produced by an [`HttpRequest`] onto the wire and feeds received
//! bytes into an [`HttpResponse`], asking `recv_mode()` before every delivery
//! to learn what shape of data the parser wants next.  Concrete message
//! implementations live in [`crate::models::request`] and
//! [`crate::models::response`]; tests may substitute their own.
//!
//! Message code must never call back into the connection that is driving it:
//! the connection's state is locked for the whole step.  Anything a message
//! wants the connection to do — release a body held back by
//! `Expect: 100-continue`, or abandon the current request — is recorded in
//! the [`StepSignals`] value handed into `recv` and applied by the connection
//! once the delivery returns.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::{
    client::{common::Target, pool::Pool},
    models::{error::Error, method::Method},
};

/// HTTP protocol versions this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// The version token as it appears on the wire.
    pub fn raw(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }
}

/// What a response parser wants delivered next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// A complete header block, split into CRLF-terminated lines ending with
    /// the blank line.
    Headers,
    /// A single CRLF-terminated line.
    Line,
    /// The parser is blocked draining previously delivered data; feed it
    /// [`RecvData::Flush`] so it can make progress.
    Flush,
    /// Exactly this many body bytes.
    Bytes(usize),
    /// Everything up to the server closing the connection.
    UntilClose,
}

/// Payload delivered to [`HttpResponse::recv`], matching the mode the parser
/// reported.
#[derive(Debug)]
pub enum RecvData {
    /// Header lines, each retaining its trailing CRLF.
    Lines(Vec<Bytes>),
    /// A single line, retaining its trailing CRLF.
    Line(Bytes),
    /// A run of body bytes.
    Chunk(Bytes),
    /// No new bytes; lets a [`RecvMode::Flush`] parser drain its sink.
    Flush,
}

/// One pull from a request body producer.
#[derive(Debug)]
pub enum BodyChunk {
    Data(Bytes),
    /// The producer has nothing ready yet; the connection moves on and asks
    /// again on a later step.
    Blocked,
    /// The body is exhausted.
    Done,
}

/// Deferred instructions from message code to the connection driving it.
///
/// Both carry the id of the request they concern so that a late signal for an
/// already-retired exchange cannot disturb a newer one sharing the pipeline.
#[derive(Debug, Default)]
pub struct StepSignals {
    pub(crate) continue_request: Option<u64>,
    pub(crate) abort_request: Option<u64>,
}

impl StepSignals {
    /// A 1xx status arrived for `request_id`: if that request is still
    /// holding back its body waiting for `100 Continue`, start sending it.
    pub fn continue_sending(&mut self, request_id: u64) {
        self.continue_request = Some(request_id);
    }

    /// Abandon `request_id` without sending the rest of it; the connection
    /// drains outstanding responses and then closes.
    pub fn request_disconnect(&mut self, request_id: u64) {
        self.abort_request = Some(request_id);
    }
}

pub type SharedRequest = Arc<Mutex<dyn HttpRequest + Send>>;
pub type SharedResponse = Arc<Mutex<dyn HttpResponse + Send>>;

/// The request side of the message contract.
///
/// The connection serializes a request by queueing `send_start()` and
/// `send_header()` and then pulling `send_body()` until it reports
/// [`BodyChunk::Done`].  `disconnect` is invoked when the connection is
/// finished transmitting — which may be before or after the matching
/// response has been handled.
pub trait HttpRequest {
    /// Process-unique id used to correlate [`StepSignals`] entries with the
    /// exchange they belong to.
    fn id(&self) -> u64;

    fn method(&self) -> Method;

    /// The pool partition key this request routes to.  Fails for URLs the
    /// client cannot carry (unsupported scheme, missing host).
    fn target(&self) -> Result<Target, Error>;

    fn has_header(&self, name: &str) -> bool;

    fn set_header(&mut self, name: &str, value: &str);

    /// Called by the manager when the request is queued.
    fn set_client(&mut self, manager: Weak<Pool>);

    /// Called when the request is bound to a connection.
    fn set_connection(&mut self, connection_id: u64);

    /// Called immediately before serialization starts; `protocol` is the
    /// last version observed from this server, if any.  A resent request
    /// must rewind its body here.
    fn start_sending(&mut self, protocol: Option<Version>);

    /// The request line, CRLF-terminated.
    fn send_start(&mut self) -> Bytes;

    /// The header block including the terminating blank line.
    fn send_header(&mut self) -> Bytes;

    fn send_body(&mut self) -> BodyChunk;

    /// Whether the request carries `Expect: 100-continue` and wants its body
    /// held back until the server agrees (or the wait times out).
    fn get_expect_continue(&self) -> bool;

    /// The connection has finished with this request.
    fn disconnect(&mut self);

    /// The response object replies to this request are delivered to.
    fn response(&self) -> SharedResponse;
}

/// The response side of the message contract.
///
/// `start_receiving` arms (or re-arms) the parser; the connection then
/// alternates `recv_mode()` and `recv(...)` until `recv_mode()` returns
/// `None`.  `handle_disconnect` is the abnormal-completion hook: the server
/// hung up, the socket failed, or the connection was killed.  Implementations
/// typically route header arrival and normal completion through hooks of
/// their own before notifying the request.
pub trait HttpResponse {
    fn start_receiving(&mut self);

    /// What the parser wants next; `None` once the response is complete.
    fn recv_mode(&self) -> Option<RecvMode>;

    fn recv(&mut self, data: RecvData, signals: &mut StepSignals);

    /// The connection is closing.  `err` is `None` for a clean remote close,
    /// which completes a read-until-close body normally.
    fn handle_disconnect(&mut self, err: Option<Arc<Error>>);

    /// Status of the parsed response; 0 until the status line has arrived.
    fn status(&self) -> u16;

    fn protocol(&self) -> Option<Version>;

    /// Whether the server will keep the connection open after this exchange.
    fn keep_alive(&self) -> bool;
}
