// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-connection send/receive state machine.
//!
//! A [`Connection`] owns one TCP (or TLS) stream to a [`Target`] together
//! with the request queue, the pipeline of outstanding responses and the
//! byte buffers in both directions.  Connections are shared across threads
//! through the pool but are never advanced by more than one thread at a
//! time: the pool binds an owner thread, and only that thread may call
//! [`Connection::connection_task`].  The two fields another thread may
//! legitimately touch — the socket and the killed latch — live behind their
//! own small mutex so that [`Connection::kill`] works from anywhere.
//!
//! `connection_task` is mostly non-blocking.  It returns the pair of
//! descriptors the caller should hand to the driver's readiness wait, or
//! `(None, None)` when the connection is not blocked on I/O.  DNS
//! resolution and TLS handshakes inside [`Connection::ensure_socket`] are
//! the deliberate exceptions and may block.

use core::fmt;
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::ThreadId,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        buffers::{RecvBuffer, SendBuffer},
        common::{RequestMode, Scheme, Target, lock, now_millis},
        pool::Pool,
        sock::{self, Stream},
    },
    models::{
        error::Error,
        message::{
            BodyChunk, RecvData, RecvMode, SharedRequest, SharedResponse,
            StepSignals, Version,
        },
    },
};

/// Cross-thread socket state: the only part of a connection that may be
/// touched by a thread other than the owner.
#[derive(Debug, Default)]
struct SockState {
    stream: Option<Stream>,
    fd: Option<RawFd>,
    /// Latched by [`Connection::kill`]; once set the socket is never
    /// reopened.
    closed: bool,
}

/// The request currently being transmitted.
struct ActiveRequest {
    handle: SharedRequest,
    id: u64,
}

/// Owner-thread state: queues, buffers and the exchange phase.
struct ConnState {
    request: Option<ActiveRequest>,
    response: Option<SharedResponse>,
    /// Responses whose requests have been fully pipelined but whose replies
    /// are still pending, in send order.
    response_queue: VecDeque<SharedResponse>,
    send_buf: SendBuffer,
    recv_buf: RecvBuffer,
    mode: RequestMode,
    /// Protocol version last observed from this server.
    protocol: Option<Version>,
    /// Time of the last successful send or recv; drives the inactivity
    /// timeout.
    last_rw: Option<Instant>,
    /// When the Expect: 100-continue wait began.
    continue_wait_start: Option<Instant>,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            request: None,
            response: None,
            response_queue: VecDeque::new(),
            send_buf: SendBuffer::default(),
            recv_buf: RecvBuffer::default(),
            mode: RequestMode::Ready,
            protocol: None,
            last_rw: None,
            continue_wait_start: None,
        }
    }
}

pub struct Connection {
    id: u64,
    target: Target,
    manager: Weak<Pool>,
    /// Thread currently permitted to advance this connection; maintained by
    /// the pool under its own lock.
    pub(crate) owner: Mutex<Option<ThreadId>>,
    /// Wall time of the most recent step, readable by pool cleanup without
    /// taking any connection lock.
    pub(crate) last_active: AtomicU64,
    timeout: Option<Duration>,
    continue_wait_max: Duration,
    chunk_size: usize,
    ca_certs: Option<PathBuf>,
    /// Requests accepted for this connection but not yet started.
    queue: Mutex<VecDeque<SharedRequest>>,
    sock: Mutex<SockState>,
    state: Mutex<ConnState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({}, {})", self.target, self.id)
    }
}

impl Connection {
    pub(crate) fn new(
        manager: Weak<Pool>,
        id: u64,
        target: Target,
        cfg: &Config,
    ) -> Arc<Self> {
        let ca_certs = match target.scheme {
            Scheme::Https => cfg.tls.ca_certs.clone(),
            Scheme::Http => None,
        };
        Arc::new(Self {
            id,
            target,
            manager,
            owner: Mutex::new(None),
            last_active: AtomicU64::new(now_millis()),
            timeout: cfg.transport.timeout_connection,
            continue_wait_max: cfg.transport.continue_wait_max,
            chunk_size: cfg.transport.socket_chunk,
            ca_certs,
            queue: Mutex::new(VecDeque::new()),
            sock: Mutex::new(SockState::default()),
            state: Mutex::new(ConnState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn push_request(&self, request: SharedRequest) {
        lock(&self.queue).push_back(request);
    }

    /// Processes the requests and responses for this connection.
    ///
    /// Loops through three phases — start a queued request if the pipeline
    /// allows it, flush as many request bytes as the socket accepts, feed
    /// received bytes into the current response — until blocked on I/O or
    /// idle.  Returns `(read_fd, write_fd)` for the driver's readiness
    /// wait; both `None` means the connection is not blocked.
    ///
    /// Must only be called by the owner thread.  Errors returned from here
    /// are routed by the driver to [`Connection::close`].
    pub fn connection_task(
        self: &Arc<Self>,
    ) -> Result<(Option<RawFd>, Option<RawFd>), Error> {
        let mut st = lock(&self.state);
        let mut rbusy;
        let mut wbusy;
        loop {
            self.last_active.store(now_millis(), Ordering::Relaxed);
            if st.mode == RequestMode::Ready {
                // While a response is outstanding only idempotent methods may
                // be pipelined; anything else leaves the head queued.
                let next = {
                    let mut queue = lock(&self.queue);
                    let dequeue = match queue.front() {
                        Some(head) => {
                            st.response.is_none()
                                || lock(head).method().is_idempotent()
                        },
                        None => false,
                    };
                    if dequeue { queue.pop_front() } else { None }
                };
                if let Some(request) = next {
                    self.start_request(&mut st, request);
                }
            }
            if st.request.is_none() && st.response.is_none() {
                // Nothing in flight: clean up if we were waiting to close,
                // then hand ourselves back to the pool.
                if st.mode == RequestMode::CloseWait {
                    self.close_locked(&mut st, None);
                }
                if let Some(manager) = self.manager.upgrade() {
                    manager.deactivate_connection(self);
                }
                return Ok((None, None));
            }
            let fd = self.ensure_socket()?;
            rbusy = None;
            wbusy = None;
            if !st.send_buf.is_empty() {
                match sock::poll_ready(fd, false, true, 0) {
                    Ok(ready) if ready.writable => {
                        self.send_chunk(&mut st);
                    },
                    Ok(_) => self.check_timeout(&st)?,
                    Err(err) => {
                        self.close_locked(&mut st, Some(Error::Io(err)));
                        continue;
                    },
                }
                if st.send_buf.is_empty() {
                    continue;
                }
                // Still waiting to write; move on to the response section.
                wbusy = Some(fd);
            } else if st.mode == RequestMode::BodyWaiting {
                // Empty buffer and we are waiting for a 100-continue that
                // may never come.
                match st.continue_wait_start {
                    None => st.continue_wait_start = Some(Instant::now()),
                    Some(started) => {
                        if started.elapsed() > self.continue_wait_max {
                            warn!(
                                host = %self.target.host,
                                "timeout while waiting for 100-Continue response"
                            );
                            st.mode = RequestMode::BodySending;
                        }
                    },
                }
            } else if st.mode == RequestMode::BodySending {
                if let Some(active) = &st.request {
                    let produced = lock(&active.handle).send_body();
                    match produced {
                        BodyChunk::Data(data) => {
                            debug!(
                                host = %self.target.host,
                                bytes = data.len(),
                                "queueing request body chunk"
                            );
                            st.send_buf.push(data);
                            continue;
                        },
                        BodyChunk::Blocked => {
                            debug!("send_body blocked waiting for message body");
                        },
                        BodyChunk::Done => {
                            if let Some(active) = st.request.take() {
                                lock(&active.handle).disconnect();
                            }
                            st.mode = RequestMode::Ready;
                        },
                    }
                }
            }
            if st.response.is_some() {
                match sock::poll_ready(fd, true, false, 0) {
                    Err(err) => {
                        self.close_locked(&mut st, Some(Error::Io(err)));
                    },
                    Ok(ready) if ready.error => {
                        self.close_locked(
                            &mut st,
                            Some(Error::Http(
                                "socket error indicated by poll".to_string(),
                            )),
                        );
                    },
                    Ok(ready) if ready.readable => {
                        if self.recv_step(&mut st) {
                            self.finish_response(&mut st);
                        }
                        // Any data received could change the request state,
                        // so we go round again.
                        continue;
                    },
                    Ok(_) => {
                        self.check_timeout(&st)?;
                        rbusy = Some(fd);
                    },
                }
            }
            break;
        }
        Ok((rbusy, wbusy))
    }

    /// The current response has been fully received: record the server
    /// protocol, promote the next pipelined response and close if the
    /// exchange (or the server) asked for it.
    fn finish_response(&self, st: &mut ConnState) {
        let mut close_connection = false;
        if let Some(done) = st.response.clone() {
            let done = lock(&done);
            st.protocol = done.protocol();
            close_connection = !done.keep_alive();
        }
        if let Some(next) = st.response_queue.pop_front() {
            lock(&next).start_receiving();
            st.response = Some(next);
        } else if st.response.take().is_some()
            && st.mode == RequestMode::CloseWait
        {
            close_connection = true;
        }
        if close_connection {
            self.close_locked(st, None);
        }
    }

    /// Binds `request` to this connection and queues its serialized head.
    fn start_request(&self, st: &mut ConnState, request: SharedRequest) {
        let (id, expect_continue, response) = {
            let mut req = lock(&request);
            req.set_connection(self.id);
            req.start_sending(st.protocol);
            let start = req.send_start();
            let headers = req.send_header();
            debug!(
                host = %self.target.host,
                bytes = start.len() + headers.len(),
                "sending request head"
            );
            st.send_buf.push(start);
            st.send_buf.push(headers);
            (req.id(), req.get_expect_continue(), req.response())
        };
        if expect_continue {
            st.mode = RequestMode::BodyWaiting;
            st.continue_wait_start = None;
        } else {
            st.mode = RequestMode::BodySending;
        }
        debug!(host = %self.target.host, mode = %st.mode, "request mode");
        if st.response.is_some() {
            // Still handling the previous reply; this one joins the pipeline.
            st.response_queue.push_back(response);
        } else {
            lock(&response).start_receiving();
            st.response = Some(response);
        }
        st.request = Some(ActiveRequest {
            handle: request,
            id,
        });
    }

    /// Sends the head chunk of the buffer, handling partial writes and the
    /// peer shutting down its read side.
    fn send_chunk(&self, st: &mut ConnState) {
        let written = {
            let Some(head) = st.send_buf.head() else {
                return;
            };
            let mut sock = lock(&self.sock);
            match sock.stream.as_mut() {
                Some(stream) => stream.write(head),
                None => Ok(0),
            }
        };
        match written {
            Ok(0) => {
                // The other side stopped reading.  Nothing much to do here:
                // if the server also fails to answer, that is handled more
                // seriously on the receive path.  We do stop accepting new
                // requests though.
                warn!(
                    host = %self.target.host,
                    "peer shut down the write side; abandoning current request"
                );
                if let Some(active) = st.request.take() {
                    lock(&active.handle).disconnect();
                }
                st.mode = RequestMode::CloseWait;
                st.send_buf.clear();
            },
            Ok(sent) => {
                st.last_rw = Some(Instant::now());
                debug!(host = %self.target.host, bytes = sent, "sent");
                st.send_buf.advance(sent);
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {},
            Err(err) => self.close_locked(st, Some(Error::Io(err))),
        }
    }

    /// Reads one chunk from the socket and feeds the current response until
    /// it either completes (returns `true`) or needs more bytes.
    fn recv_step(self: &Arc<Self>, st: &mut ConnState) -> bool {
        let mut err: Option<Error> = None;
        let mut chunk = vec![0u8; self.chunk_size];
        let read = {
            let mut sock = lock(&self.sock);
            match sock.stream.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => Ok(0),
            }
        };
        match read {
            Ok(0) => {
                debug!(
                    host = %self.target.host,
                    "closing connection after recv returned no data on a readable socket"
                );
                self.close_locked(st, None);
                return true;
            },
            Ok(count) => {
                st.last_rw = Some(Instant::now());
                debug!(host = %self.target.host, bytes = count, "recv");
                st.recv_buf.push(Bytes::copy_from_slice(&chunk[..count]));
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                // We cannot truly tell whether the server hung up except by
                // seeing an error here; latch it and let the parser decide
                // whether the bytes already buffered are enough.
                err = Some(Error::Io(e));
            },
        }
        while let Some(response) = st.response.clone() {
            let mode = lock(&response).recv_mode();
            match mode {
                None => return true,
                Some(RecvMode::Headers) => {
                    match st.recv_buf.take_header_block() {
                        Some(lines) => {
                            debug!(lines = lines.len(), "response headers");
                            self.deliver(st, &response, RecvData::Lines(lines));
                        },
                        None => return self.stalled(st, err.take()),
                    }
                },
                Some(RecvMode::Line) => match st.recv_buf.take_line() {
                    Some(line) => {
                        debug!("response header line");
                        self.deliver(st, &response, RecvData::Line(line));
                    },
                    None => return self.stalled(st, err.take()),
                },
                Some(RecvMode::Flush) => {
                    debug!("response blocked on write");
                    self.deliver(st, &response, RecvData::Flush);
                },
                Some(RecvMode::Bytes(wanted)) => {
                    if st.recv_buf.len() < wanted {
                        debug!(
                            waiting = wanted - st.recv_buf.len(),
                            "response waiting for bytes"
                        );
                        return self.stalled(st, err.take());
                    }
                    let bytes = st.recv_buf.extract(wanted);
                    self.deliver(st, &response, RecvData::Chunk(bytes));
                },
                Some(RecvMode::UntilClose) => {
                    if st.recv_buf.is_empty() {
                        return self.stalled(st, err.take());
                    }
                    let bytes = st.recv_buf.drain_all();
                    debug!(
                        bytes = bytes.len(),
                        "response reading until connection closes"
                    );
                    self.deliver(st, &response, RecvData::Chunk(bytes));
                },
            }
        }
        false
    }

    /// The parser needs more bytes than we have.  With a latched socket
    /// error there is nothing more to wait for, so close; otherwise report
    /// "not done yet".
    fn stalled(&self, st: &mut ConnState, err: Option<Error>) -> bool {
        match err {
            Some(err) => {
                self.close_locked(st, Some(err));
                true
            },
            None => false,
        }
    }

    /// Delivers one piece of data to the response and applies whatever the
    /// message layer asked for while processing it.
    fn deliver(
        &self,
        st: &mut ConnState,
        response: &SharedResponse,
        data: RecvData,
    ) {
        let mut signals = StepSignals::default();
        lock(response).recv(data, &mut signals);
        self.apply_signals(st, signals);
    }

    fn apply_signals(&self, st: &mut ConnState, signals: StepSignals) {
        let StepSignals {
            continue_request,
            abort_request,
        } = signals;
        if let Some(id) = continue_request {
            self.continue_sending_locked(st, id);
        }
        if let Some(id) = abort_request
            && st.request.as_ref().is_some_and(|active| active.id == id)
        {
            self.request_disconnect_locked(st);
        }
    }

    fn continue_sending_locked(&self, st: &mut ConnState, request_id: u64) {
        if st.request.as_ref().is_some_and(|active| active.id == request_id)
            && st.mode == RequestMode::BodyWaiting
        {
            debug!("100 Continue received... ready to send request body");
            st.mode = RequestMode::BodySending;
        }
    }

    /// Releases a body held back by `Expect: 100-continue`, if `request_id`
    /// is still the request being transmitted.
    pub fn continue_sending(&self, request_id: u64) {
        let mut st = lock(&self.state);
        self.continue_sending_locked(&mut st, request_id);
    }

    /// Abandons the current request.  If a response is still outstanding the
    /// connection drains the pipeline first; otherwise it closes right away.
    pub fn request_disconnect(&self) {
        let mut st = lock(&self.state);
        self.request_disconnect_locked(&mut st);
    }

    fn request_disconnect_locked(&self, st: &mut ConnState) {
        if let Some(active) = st.request.take() {
            lock(&active.handle).disconnect();
        }
        if st.response.is_some() {
            st.send_buf.clear();
            st.mode = RequestMode::CloseWait;
        } else {
            self.close_locked(st, None);
        }
    }

    /// Closes this connection nicely, optionally recording the error that
    /// caused it.  Outstanding responses get their disconnect hook; internal
    /// structures reset so the connection can reconnect for the next
    /// request.
    pub fn close(&self, err: Option<Error>) {
        let mut st = lock(&self.state);
        self.close_locked(&mut st, err);
    }

    fn close_locked(&self, st: &mut ConnState, err: Option<Error>) {
        match &err {
            Some(err) => {
                error!(host = %self.target.host, "closing connection after error: {err}")
            },
            None => debug!(host = %self.target.host, "closing connection"),
        }
        if let Some(active) = st.request.take() {
            lock(&active.handle).disconnect();
            st.mode = RequestMode::CloseWait;
        }
        let err = err.map(Arc::new);
        let mut response = st.response.take();
        while let Some(current) = response {
            // Tell the response about the error before hanging up.
            lock(&current).handle_disconnect(err.clone());
            response = st.response_queue.pop_front();
        }
        {
            let mut sock = lock(&self.sock);
            if let Some(stream) = sock.stream.take() {
                sock::shutdown_close(stream);
            }
            sock.fd = None;
        }
        st.send_buf.clear();
        st.recv_buf.clear();
        st.continue_wait_start = None;
        st.mode = RequestMode::Ready;
    }

    /// Kills the connection, typically from a thread other than the owner.
    ///
    /// Message state is left alone; the owner thread's next socket call
    /// observes the dead stream and runs the normal close path.  Once
    /// killed, a connection is never reconnected.
    pub fn kill(&self) {
        let mut sock = lock(&self.sock);
        debug!(host = %self.target.host, "killing connection");
        if !sock.closed {
            if let Some(stream) = &sock.stream {
                warn!(
                    host = %self.target.host,
                    "kill forcing socket shutdown"
                );
                let _ = stream.shutdown_both();
            }
            sock.closed = true;
        }
    }

    /// Opens the socket if there is none, blocking on DNS and (for https)
    /// the TLS handshake.  Fails if the connection has been killed.
    fn ensure_socket(&self) -> Result<RawFd, Error> {
        {
            let sock = lock(&self.sock);
            if sock.stream.is_some()
                && let Some(fd) = sock.fd
            {
                return Ok(fd);
            }
            if sock.closed {
                error!(
                    host = %self.target.host,
                    "open_socket called on a dead connection"
                );
                return Err(Error::ConnectionClosed);
            }
        }
        let manager = self.manager.upgrade().ok_or(Error::ConnectionClosed)?;
        let addrs = manager.dnslookup(&self.target.host, self.target.port)?;
        let tcp = sock::connect_first(&addrs).ok_or_else(|| {
            Error::Http(format!("failed to connect to {}", self.target.host))
        })?;
        let stream = match self.target.scheme {
            Scheme::Http => Stream::Plain(tcp),
            Scheme::Https => {
                let tls = sock::wrap_tls(
                    tcp,
                    &self.target.host,
                    self.ca_certs.as_deref(),
                )?;
                info!(host = %self.target.host, "established TLS session");
                Stream::Tls(Box::new(tls))
            },
        };
        stream.set_nonblocking(true)?;
        let mut sock = lock(&self.sock);
        if sock.closed {
            // Killed while we were connecting; drop the fresh socket.
            sock::shutdown_close(stream);
            error!(
                host = %self.target.host,
                "connection killed while connecting"
            );
            return Err(Error::ConnectionClosed);
        }
        let fd = stream.as_raw_fd();
        sock.fd = Some(fd);
        sock.stream = Some(stream);
        info!(id = self.id, target = %self.target, "opened connection");
        Ok(fd)
    }

    fn check_timeout(&self, st: &ConnState) -> Result<(), Error> {
        if let (Some(last_rw), Some(timeout)) = (st.last_rw, self.timeout)
            && last_rw.elapsed() > timeout
        {
            // Assume we are dead in the water.
            return Err(Error::timed_out());
        }
        Ok(())
    }
}
