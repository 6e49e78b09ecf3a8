// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io;

use thiserror::Error;

/// Error surface of the request manager and the connection state machines.
#[derive(Debug, Error)]
pub enum Error {
    /// No connection became available within the requested timeout.
    #[error("request manager busy: no connection available")]
    ManagerBusy,

    /// The manager is closing, or the connection has been killed and will
    /// never carry traffic again.
    #[error("connection closed")]
    ConnectionClosed,

    /// DNS failure, connect failure, unsupported scheme or a protocol-level
    /// problem that is not tied to a live socket operation.
    #[error("{0}")]
    Http(String),

    /// TLS setup or handshake failure.
    #[error("TLS failure: {0}")]
    Tls(String),

    /// A socket operation failed.  Inactivity timeouts surface here with an
    /// `ETIMEDOUT` payload.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The error reported when a connection sits idle past its inactivity
    /// deadline during a stalled send or receive.
    pub fn timed_out() -> Self {
        Self::Io(io::Error::from_raw_os_error(libc::ETIMEDOUT))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.raw_os_error() == Some(libc::ETIMEDOUT))
    }
}
