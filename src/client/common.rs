// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use once_cell::sync::Lazy;
use url::Url;

use crate::models::error::Error;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// Connection schemes the pool knows how to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => HTTP_PORT,
            Self::Https => HTTPS_PORT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// The pool partition key: one remote endpoint as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Decomposes a URL into the tuple the pool is keyed on.
    ///
    /// Schemes other than http/https are rejected here, before any pool slot
    /// is committed to the request.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::Http(format!(
                    "unsupported connection scheme: {other}"
                )));
            },
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Http(format!("URL has no host: {url}")))?
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self { scheme, host, port })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Phase of the exchange currently being transmitted on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Ready to start the next queued request.
    Ready,
    /// Headers flushed; body held back waiting for `100 Continue`.
    BodyWaiting,
    /// Streaming the request body.
    BodySending,
    /// The current request was abandoned; drain responses, then close.
    CloseWait,
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "Ready",
            Self::BodyWaiting => "Waiting",
            Self::BodySending => "Sending",
            Self::CloseWait => "Closing",
        })
    }
}

/// Locks a mutex, recovering the guard if a peer panicked while holding it.
/// The engine's invariants are re-checked on every step, so a poisoned lock
/// carries no extra meaning here.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first activity stamp in this process.
/// Stored in atomics so pool cleanup can read activity times without taking
/// any connection lock.
pub(crate) fn now_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}
