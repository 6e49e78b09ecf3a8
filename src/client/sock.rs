// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Socket plumbing: candidate connects, the optional TLS wrap, readiness
//! probes and the driver's multi-descriptor wait.
//!
//! Streams are switched to non-blocking right after setup, so every send and
//! receive either completes immediately or reports `WouldBlock`.  Readiness
//! is asked of the kernel through `poll(2)`: a zero-timeout probe per
//! direction inside a connection step, and one aggregated wait per driver
//! pass across every blocked connection of the thread.

use std::{
    collections::HashMap,
    fs,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
    time::Duration,
};

use native_tls::{Certificate, TlsConnector, TlsStream};
use tracing::debug;

use crate::models::error::Error;

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// A plain or TLS-wrapped client stream.
#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.tcp().set_nonblocking(nonblocking)
    }

    /// Half-closes both directions, leaving the descriptor open.
    pub fn shutdown_both(&self) -> io::Result<()> {
        self.tcp().shutdown(Shutdown::Both)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}

/// Attempts a blocking TCP connect to each resolved address in order; the
/// first that succeeds wins.
pub fn connect_first(addrs: &[SocketAddr]) -> Option<TcpStream> {
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Some(stream),
            Err(err) => {
                debug!("connect to {addr} failed: {err}");
            },
        }
    }
    None
}

/// Wraps an established TCP stream in TLS, blocking for the handshake.
///
/// When a CA bundle is supplied the peer certificate is verified against it.
/// Without one, verification is disabled entirely — the connection is then
/// open to man-in-the-middle interception and the mode exists only for
/// development against self-signed endpoints.
pub fn wrap_tls(
    stream: TcpStream,
    host: &str,
    ca_certs: Option<&Path>,
) -> Result<TlsStream<TcpStream>, Error> {
    let mut builder = TlsConnector::builder();
    match ca_certs {
        Some(path) => {
            let pem = fs::read(path)?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| Error::Tls(format!("bad CA bundle {path:?}: {e}")))?;
            builder.add_root_certificate(cert);
        },
        None => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        },
    }
    let connector = builder
        .build()
        .map_err(|e| Error::Tls(format!("connector setup failed: {e}")))?;
    connector
        .connect(host, stream)
        .map_err(|e| Error::Tls(format!("handshake with {host} failed: {e}")))
}

/// Shuts the stream down and closes it, swallowing errors: the server most
/// likely stopped listening already.
pub fn shutdown_close(stream: Stream) {
    let _ = stream.shutdown_both();
    drop(stream);
}

/// Readiness of a single descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Zero-or-bounded-timeout readiness probe of one descriptor.
///
/// `error` mirrors the exceptional set of `select(2)`: POLLERR and POLLNVAL
/// only.  POLLHUP is deliberately not an error — a half-closed peer still
/// owes us buffered response bytes, which arrive through the readable path
/// until it reports EOF.
pub fn poll_ready(
    fd: RawFd,
    read: bool,
    write: bool,
    timeout_ms: i32,
) -> io::Result<Readiness> {
    let mut events: libc::c_short = 0;
    if read {
        events |= libc::POLLIN;
    }
    if write {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // Safe because the pollfd array outlives the call and the return value
    // is checked.
    cvt(unsafe { libc::poll(&mut pfd, 1, timeout_ms) })?;
    Ok(Readiness {
        readable: pfd.revents & libc::POLLIN != 0,
        writable: pfd.revents & libc::POLLOUT != 0,
        error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
    })
}

/// Blocks until any of the given descriptors is ready or the timeout runs
/// out.  `None` waits indefinitely.  Which descriptors fired is irrelevant:
/// the driver re-probes every connection on the next pass.
pub fn wait_ready(
    readers: &[RawFd],
    writers: &[RawFd],
    timeout: Option<Duration>,
) -> io::Result<()> {
    let mut interest: HashMap<RawFd, libc::c_short> = HashMap::new();
    for fd in readers {
        *interest.entry(*fd).or_default() |= libc::POLLIN;
    }
    for fd in writers {
        *interest.entry(*fd).or_default() |= libc::POLLOUT;
    }
    if interest.is_empty() {
        return Ok(());
    }
    let mut pfds: Vec<libc::pollfd> = interest
        .into_iter()
        .map(|(fd, events)| libc::pollfd {
            fd,
            events,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);
    // Safe because the vector outlives the call and the length matches.
    cvt(unsafe {
        libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms)
    })?;
    Ok(())
}
