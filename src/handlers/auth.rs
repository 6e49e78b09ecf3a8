// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Challenge-response authentication plumbing.
//!
//! The engine treats credentials as an opaque store: when a 401 arrives the
//! request-level policy parses the `WWW-Authenticate` challenges, scopes
//! each to its protection space (the canonical root of the request URL) and
//! asks the manager's registry for a match.  Matched credentials ride one
//! retry; a second 401 removes them from the registry.

use std::sync::Mutex;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use url::Url;

use crate::client::common::lock;

/// One challenge out of a `WWW-Authenticate` header, scoped to a protection
/// space once the policy layer has resolved it.
#[derive(Debug, Clone, Default)]
pub struct Challenge {
    /// Authentication scheme token, e.g. `Basic`.
    pub scheme: String,
    pub realm: Option<String>,
    /// All auth-params as they appeared, realm included.
    pub params: Vec<(String, String)>,
    /// Canonical root of the URL that issued the challenge.
    pub protection_space: Option<String>,
}

/// The canonical root used to scope authentication: scheme and authority
/// with the default port elided.
pub fn canonical_root(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

/// Splits a `WWW-Authenticate` value into its challenges.
///
/// The grammar overloads the comma to separate both auth-params and whole
/// challenges, so a bare token (no `=`) is taken as the scheme of a new
/// challenge and everything up to the next bare token as its params.
/// Quoted parameter values have their quotes stripped.
pub fn parse_challenges(value: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (first, rest) = match part.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, Some(rest)),
            None => (part, None),
        };
        if !first.contains('=') {
            challenges.push(Challenge {
                scheme: first.to_string(),
                ..Challenge::default()
            });
            match rest {
                Some(rest) => append_param(&mut challenges, rest),
                None => continue,
            }
        } else {
            append_param(&mut challenges, part);
        }
    }
    challenges
}

fn append_param(challenges: &mut [Challenge], param: &str) {
    let Some(challenge) = challenges.last_mut() else {
        return;
    };
    let Some((key, value)) = param.split_once('=') else {
        return;
    };
    let key = key.trim().to_string();
    let value = value.trim().trim_matches('"').to_string();
    if key.eq_ignore_ascii_case("realm") {
        challenge.realm = Some(value.clone());
    }
    challenge.params.push((key, value));
}

/// The opaque credentials contract the manager consults.
pub trait Credentials: Send + Sync {
    /// Whether these credentials answer `challenge`.
    fn match_challenge(&self, challenge: &Challenge) -> bool;

    /// Whether these credentials are known to work for `url`, allowing the
    /// client to send them preemptively.
    fn test_url(&self, url: &Url) -> bool;

    /// The value of the `Authorization` header to send.
    fn authorization_value(&self) -> String;

    /// Records a path these credentials succeeded on.  Only meaningful for
    /// schemes with a path-scoped protection model.
    fn add_success_path(&self, _path: &str) {}
}

/// RFC 7617 Basic credentials with path-prefix success tracking.
pub struct BasicCredentials {
    username: String,
    password: String,
    /// Canonical root these credentials belong to; `None` answers any host.
    protection_space: Option<String>,
    realm: Option<String>,
    /// Path prefixes the credentials are known to work under.
    success_paths: Mutex<Vec<String>>,
}

impl BasicCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            protection_space: None,
            realm: None,
            success_paths: Mutex::new(Vec::new()),
        }
    }

    /// Restricts the credentials to one protection space.
    pub fn for_space(mut self, protection_space: &str) -> Self {
        self.protection_space = Some(protection_space.to_string());
        self
    }

    /// Restricts the credentials to one realm.
    pub fn for_realm(mut self, realm: &str) -> Self {
        self.realm = Some(realm.to_string());
        self
    }
}

impl Credentials for BasicCredentials {
    fn match_challenge(&self, challenge: &Challenge) -> bool {
        if !challenge.scheme.eq_ignore_ascii_case("Basic") {
            return false;
        }
        if let Some(space) = &self.protection_space
            && challenge.protection_space.as_deref() != Some(space.as_str())
        {
            return false;
        }
        match (&self.realm, &challenge.realm) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }

    fn test_url(&self, url: &Url) -> bool {
        if let Some(space) = &self.protection_space
            && canonical_root(url) != *space
        {
            return false;
        }
        let path = url.path();
        lock(&self.success_paths)
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn authorization_value(&self) -> String {
        let token =
            BASE64.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }

    fn add_success_path(&self, path: &str) {
        let mut paths = lock(&self.success_paths);
        if paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return;
        }
        // The new prefix may subsume earlier, longer ones.
        paths.retain(|known| !known.starts_with(path));
        paths.push(path.to_string());
    }
}
