// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP request methods and the pipelining classification the connection
//! state machine relies on.
//!
//! RFC 7230 § 6.3.2 allows a client to pipeline requests on a persistent
//! connection, but RFC 7231 § 4.2.2 warns that only *idempotent* methods are
//! safe to send ahead of an outstanding response: if the connection dies the
//! client can blindly retransmit them.  A non-idempotent method therefore
//! stalls the pipeline until every queued response has been received.

use core::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported HTTP method: {0}")]
pub struct InvalidMethod(pub String);

/// The request methods understood by this client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Head,
    Put,
    Delete,
    Options,
    Trace,
    Post,
    Connect,
    Patch,
}

impl TryFrom<&str> for Method {
    type Error = InvalidMethod;

    /// Parses the wire form of a method.  Matching is case sensitive, as
    /// method tokens are per RFC 7230 § 3.1.1.
    fn try_from(token: &str) -> Result<Self, InvalidMethod> {
        Ok(match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "POST" => Self::Post,
            "CONNECT" => Self::Connect,
            "PATCH" => Self::Patch,
            other => return Err(InvalidMethod(other.to_string())),
        })
    }
}

impl Method {
    /// The token sent on the wire.
    pub fn raw(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Post => "POST",
            Self::Connect => "CONNECT",
            Self::Patch => "PATCH",
        }
    }

    /// Whether the method may be pipelined ahead of a pending response.
    ///
    /// PATCH is deliberately excluded: it is not idempotent by definition
    /// and gets the same conservative treatment as POST.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::Get
                | Self::Head
                | Self::Put
                | Self::Delete
                | Self::Options
                | Self::Trace
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}
