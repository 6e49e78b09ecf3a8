// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Connection pool limits.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Socket-level knobs: chunk sizes and timeouts.
    #[serde(default)]
    pub transport: TransportConfig,
    /// TLS trust configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Protocol-level defaults applied to outgoing requests.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Upper bounds on the connection pool.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(rename = "MaxConnections", default = "default_max_connections")]
    /// Maximum number of connections, active and idle combined.
    pub max_connections: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    100
}

/// Socket-level parameters.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(rename = "SocketChunk", default = "default_socket_chunk")]
    /// Bytes read from a socket per receive step.
    pub socket_chunk: usize,

    #[serde(
        rename = "ContinueWaitMax",
        with = "serde_secs",
        default = "default_continue_wait_max"
    )]
    /// How long a request with `Expect: 100-continue` holds its body back
    /// before sending it anyway.
    pub continue_wait_max: Duration,

    #[serde(rename = "TimeoutConnection", with = "serde_opt_secs", default)]
    /// Inactivity deadline for a connection blocked on send or receive.
    /// `None` waits forever.
    pub timeout_connection: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_chunk: default_socket_chunk(),
            continue_wait_max: default_continue_wait_max(),
            timeout_connection: None,
        }
    }
}

fn default_socket_chunk() -> usize {
    8 * 1024
}

fn default_continue_wait_max() -> Duration {
    Duration::from_secs(60)
}

/// TLS trust settings.
///
/// Without a CA bundle, certificates are not checked at all and https
/// connections are not safe from man-in-the-middle attacks.  Production
/// deployments should always configure `CaCerts`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(rename = "CaCerts", default)]
    /// PEM bundle to verify server certificates against.
    pub ca_certs: Option<PathBuf>,
}

/// Protocol-level request defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct HttpConfig {
    #[serde(rename = "UserAgent", default)]
    /// `User-Agent` applied to requests that lack one.  An explicit empty
    /// string disables the header entirely.
    pub user_agent: Option<String>,
}

impl HttpConfig {
    pub fn effective_user_agent(&self) -> String {
        match &self.user_agent {
            Some(user_agent) => user_agent.clone(),
            None => format!(
                "h1-client-rs/{} (RequestManager)",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.pool.max_connections >= 1,
            "MaxConnections must be >= 1"
        );
        ensure!(self.transport.socket_chunk >= 1, "SocketChunk must be >= 1");
        ensure!(
            !self.transport.continue_wait_max.is_zero(),
            "ContinueWaitMax must be > 0"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as [`serde_secs`] for optional durations.
mod serde_opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}
