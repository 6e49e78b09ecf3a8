// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The concrete client request and the request-level retry policy.
//!
//! A [`ClientRequest`] owns its URL, headers and optional byte body, and
//! serializes itself on demand for the connection: request line, header
//! block, then body chunks pulled one at a time.  The body keeps a cursor
//! rather than being consumed, so a redirect or authentication retry can
//! rewind and resend it.
//!
//! Completion policy, in order: a 1xx releases a body held back by
//! `Expect: 100-continue`; 3xx statuses are re-queued at the `Location`
//! resolved against the request URL (302 only for GET and HEAD); a 401 is
//! retried once with matching credentials from the manager's registry,
//! which are kept on success and dropped after a second 401.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    client::{
        common::{Target, lock},
        pool::Pool,
    },
    handlers::auth::{Credentials, canonical_root, parse_challenges},
    models::{
        error::Error,
        message::{
            BodyChunk, HttpRequest, SharedResponse, StepSignals, Version,
        },
        method::Method,
        response::{ClientResponse, ResponseOutcome},
    },
};

/// Request body bytes handed to the connection per `send_body` pull.
const SEND_CHUNK: usize = 8 * 1024;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub struct ClientRequest {
    id: u64,
    self_ref: Weak<Mutex<dyn HttpRequest + Send>>,
    pub url: Url,
    pub method: Method,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    body_pos: usize,
    /// Status code received; 0 indicates a failed or unsent request.
    pub status: u16,
    /// If `status == 0`, the error raised during processing.
    pub error: Option<Arc<Error>>,
    /// The response body received (when not streaming to a sink).
    pub res_body: Bytes,
    /// Whether 3xx responses are followed automatically.
    pub auto_redirect: bool,
    /// Credentials currently on trial after a 401.
    try_credentials: Option<Arc<dyn Credentials>>,
    manager: Weak<Pool>,
    /// Id of the connection transmitting us, while attached.
    connection: Option<u64>,
    response: Arc<Mutex<ClientResponse>>,
    last_location: Option<String>,
    last_challenges: Vec<String>,
}

impl ClientRequest {
    /// Creates a request ready for [`Pool::queue_request`].
    pub fn new(
        url: Url,
        method: Method,
        body: Option<Bytes>,
    ) -> Arc<Mutex<Self>> {
        Arc::new_cyclic(|me: &Weak<Mutex<Self>>| {
            let response =
                Arc::new(Mutex::new(ClientResponse::new(me.clone(), method)));
            let self_ref: Weak<Mutex<dyn HttpRequest + Send>> = me.clone();
            Mutex::new(Self {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                self_ref,
                url,
                method,
                headers: Vec::new(),
                body,
                body_pos: 0,
                status: 0,
                error: None,
                res_body: Bytes::new(),
                auto_redirect: true,
                try_credentials: None,
                manager: Weak::new(),
                connection: None,
                response,
                last_location: None,
                last_challenges: Vec::new(),
            })
        })
    }

    /// Streams the response body into `sink` instead of buffering it in
    /// [`ClientRequest::res_body`].
    pub fn set_body_sink(&self, sink: Box<dyn std::io::Write + Send>) {
        lock(&self.response).set_sink(sink);
    }

    /// The concrete response object, for callers that want headers or the
    /// reason phrase after completion.
    pub fn client_response(&self) -> Arc<Mutex<ClientResponse>> {
        self.response.clone()
    }

    fn header_position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_position(name)
            .map(|i| self.headers[i].1.as_str())
    }

    fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Sets the `Authorization` header from `credentials`, replacing any
    /// previous value.
    pub fn set_authorization(&mut self, credentials: &dyn Credentials) {
        let value = credentials.authorization_value();
        self.set_header("Authorization", &value);
    }

    fn body_remaining(&self) -> bool {
        self.body
            .as_ref()
            .is_some_and(|body| self.body_pos < body.len())
    }

    /// Called by the response once it has everything the policy needs.
    pub(crate) fn response_finished(
        &mut self,
        outcome: ResponseOutcome,
        signals: &mut StepSignals,
    ) {
        self.status = outcome.status;
        self.error = outcome.err;
        if self.status == 0 {
            if let Some(err) = &self.error {
                error!("error receiving response: {err}");
            }
            self.finished();
            return;
        }
        info!(status = self.status, "finished response");
        if let Some(body) = outcome.body {
            self.res_body = body;
        }
        self.last_location = outcome.location;
        self.last_challenges = outcome.challenges;
        if (100..=199).contains(&self.status) {
            // We may be holding the body back waiting for exactly this;
            // tell the connection to stop waiting.  The final response is
            // still to come, so we are not finished.
            if self.connection.is_some() {
                signals.continue_sending(self.id);
            }
        } else if self.connection.is_some() {
            // The response landed before the connection finished with us.
            if self.status >= 300 && self.body_remaining() {
                // More request data to send but no intention of sending it,
                // so we have to hang up.
                signals.request_disconnect(self.id);
            }
            // For 2xx codes the connection keeps spooling and disconnects
            // from us when it is done.
        } else {
            self.finished();
        }
    }

    /// Runs once we have a final response *and* the connection has let go.
    /// Note the server may well have hung up before reading everything we
    /// sent even on a 2xx; reaching here never proves full delivery.
    fn finished(&mut self) {
        if let Some(tried) = self.try_credentials.take() {
            if self.status == 401 {
                // They matched the challenge but still got refused.
                if let Some(manager) = self.manager.upgrade() {
                    manager.remove_credentials(&tried);
                }
            } else {
                tried.add_success_path(self.url.path());
            }
        }
        if self.auto_redirect
            && (300..=399).contains(&self.status)
            && (self.status != 302
                || matches!(self.method, Method::Get | Method::Head))
        {
            // A 302 for anything but GET/HEAD must not be followed without
            // user confirmation.
            if let Some(location) = self.last_location.take() {
                // Servers routinely send relative or host-less Location
                // values; resolve against the URL we asked for.
                match self.url.join(location.trim()) {
                    Ok(url) => self.resend(Some(url)),
                    Err(err) => warn!(
                        location = %location,
                        "ignoring unresolvable redirect: {err}"
                    ),
                }
            }
        } else if self.status == 401 {
            let raw_challenges = std::mem::take(&mut self.last_challenges);
            let space = canonical_root(&self.url);
            for raw in &raw_challenges {
                for mut challenge in parse_challenges(raw) {
                    challenge.protection_space = Some(space.clone());
                    let found = self
                        .manager
                        .upgrade()
                        .and_then(|m| m.find_credentials(&challenge));
                    if let Some(credentials) = found {
                        self.set_authorization(credentials.as_ref());
                        self.try_credentials = Some(credentials);
                        // Back to the same URL, now with authorization.
                        self.resend(None);
                        return;
                    }
                }
            }
        }
    }

    /// Re-queues this request, optionally at a new URL.
    fn resend(&mut self, url: Option<Url>) {
        info!(url = ?url.as_ref().map(Url::as_str), "resending request");
        self.status = 0;
        self.error = None;
        if let Some(url) = url {
            if url.host_str() != self.url.host_str()
                || url.port() != self.url.port()
            {
                self.remove_header("Host");
            }
            self.url = url;
        }
        let (Some(manager), Some(me)) =
            (self.manager.upgrade(), self.self_ref.upgrade())
        else {
            warn!("cannot resend: request manager is gone");
            return;
        };
        // Zero timeout: resends run deep inside a connection step, and the
        // calling thread is the only one able to free a slot.  The common
        // case hits the connection already bound to this thread and target.
        if let Err(err) =
            manager.queue_request_locked(self, me, Some(Duration::ZERO))
        {
            error!("resend failed: {err}");
            self.error = Some(Arc::new(err));
        }
    }
}

impl HttpRequest for ClientRequest {
    fn id(&self) -> u64 {
        self.id
    }

    fn method(&self) -> Method {
        self.method
    }

    fn target(&self) -> Result<Target, Error> {
        Target::from_url(&self.url)
    }

    fn has_header(&self, name: &str) -> bool {
        self.header_position(name).is_some()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match self.header_position(name) {
            Some(i) => self.headers[i].1 = value.to_string(),
            None => self
                .headers
                .push((name.to_string(), value.to_string())),
        }
    }

    fn set_client(&mut self, manager: Weak<Pool>) {
        self.manager = manager;
    }

    fn set_connection(&mut self, connection_id: u64) {
        self.connection = Some(connection_id);
    }

    fn start_sending(&mut self, _protocol: Option<Version>) {
        // Rewind the body; a resent request transmits it from the start.
        self.body_pos = 0;
    }

    fn send_start(&mut self) -> Bytes {
        let path = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };
        Bytes::from(format!("{} {} HTTP/1.1\r\n", self.method.raw(), path))
    }

    fn send_header(&mut self) -> Bytes {
        if !self.has_header("Host") {
            let host = self.url.host_str().unwrap_or_default();
            let host = match self.url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            self.set_header("Host", &host);
        }
        if let Some(body) = &self.body {
            let length = body.len().to_string();
            self.set_header("Content-Length", &length);
        }
        // Offer credentials that already proved themselves for this URL.
        if !self.has_header("Authorization")
            && let Some(credentials) = self
                .manager
                .upgrade()
                .and_then(|m| m.find_credentials_by_url(&self.url))
        {
            debug!("adding known-good credentials preemptively");
            self.set_authorization(credentials.as_ref());
        }
        let mut out = BytesMut::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    fn send_body(&mut self) -> BodyChunk {
        let Some(body) = &self.body else {
            return BodyChunk::Done;
        };
        if self.body_pos >= body.len() {
            return BodyChunk::Done;
        }
        let end = (self.body_pos + SEND_CHUNK).min(body.len());
        let chunk = body.slice(self.body_pos..end);
        self.body_pos = end;
        BodyChunk::Data(chunk)
    }

    fn get_expect_continue(&self) -> bool {
        self.header("Expect")
            .is_some_and(|v| v.to_ascii_lowercase().contains("100-continue"))
    }

    fn disconnect(&mut self) {
        self.connection = None;
        if self.status > 0 {
            // The response got there first; run the completion policy now.
            self.finished();
        }
    }

    fn response(&self) -> SharedResponse {
        self.response.clone()
    }
}
