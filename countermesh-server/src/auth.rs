// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bearer-token authentication, off by default (spec §6.4). Wired as an
//! `axum::middleware::from_fn_with_state` layer ahead of every route
//! except `/ping`.

use axum::http::{header, HeaderMap};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    Missing,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("invalid bearer token")]
    Invalid,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError>;
}

/// Default: every request passes. Matches spec §6.4's "off by default".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<(), AuthError> {
        Ok(())
    }
}

pub struct BearerTokenAuth {
    token: String,
}

impl BearerTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Authenticator for BearerTokenAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let raw = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;
        let presented = raw.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
        if constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn no_auth_always_passes() {
        assert!(NoAuth.authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn bearer_auth_accepts_matching_token() {
        let auth = BearerTokenAuth::new("secret");
        assert!(auth.authenticate(&headers_with_bearer("secret")).is_ok());
    }

    #[test]
    fn bearer_auth_rejects_wrong_token() {
        let auth = BearerTokenAuth::new("secret");
        assert_eq!(auth.authenticate(&headers_with_bearer("nope")), Err(AuthError::Invalid));
    }

    #[test]
    fn bearer_auth_rejects_missing_header() {
        let auth = BearerTokenAuth::new("secret");
        assert_eq!(auth.authenticate(&HeaderMap::new()), Err(AuthError::Missing));
    }

    #[test]
    fn bearer_auth_rejects_non_bearer_scheme() {
        let auth = BearerTokenAuth::new("secret");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic secret".parse().unwrap());
        assert_eq!(auth.authenticate(&headers), Err(AuthError::Malformed));
    }
}
