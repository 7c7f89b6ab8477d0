//! Caller identity asserted by the fronting proxy.
//!
//! The service does not authenticate callers itself. An authenticating
//! proxy sets one header naming the user and another listing the
//! capabilities granted to them.

use std::collections::HashSet;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::config::AuthConfig;
use crate::error::{ControlError, ControlResult};

use super::AppState;

/// A permission the proxy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// View the manifest and restart status.
    Read,
    /// Request tokens and change the manifest.
    Edit,
}

impl Capability {
    /// Header value naming this capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Edit => "edit",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "edit" => Some(Self::Edit),
            _ => None,
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller {
    /// User identity tokens are bound to.
    pub user: String,
    capabilities: HashSet<Capability>,
}

impl Caller {
    /// Read the caller from request headers.
    pub fn from_headers(headers: &HeaderMap, auth: &AuthConfig) -> ControlResult<Self> {
        let user = headers
            .get(auth.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ControlError::Unauthenticated)?
            .to_owned();

        let capabilities = headers
            .get_all(auth.capabilities_header.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(Capability::parse)
            .collect();

        Ok(Self { user, capabilities })
    }

    /// Whether the caller holds a capability.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Fail with `Forbidden` unless the caller holds `capability`.
    pub fn require(&self, capability: Capability) -> ControlResult<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(ControlError::Forbidden(capability.as_str()))
        }
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ControlError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers, &state.auth)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn reads_user_and_capabilities() {
        let caller = Caller::from_headers(
            &headers(&[
                ("x-remote-user", "alice"),
                ("x-remote-capabilities", "read, EDIT,unknown"),
            ]),
            &AuthConfig::default(),
        )
        .unwrap();

        assert_eq!(caller.user, "alice");
        assert!(caller.has(Capability::Read));
        assert!(caller.require(Capability::Edit).is_ok());
    }

    #[test]
    fn missing_user_is_unauthenticated() {
        let err = Caller::from_headers(
            &headers(&[("x-remote-capabilities", "read")]),
            &AuthConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ControlError::Unauthenticated));

        let err = Caller::from_headers(&headers(&[("x-remote-user", "  ")]), &AuthConfig::default())
            .unwrap_err();
        assert!(matches!(err, ControlError::Unauthenticated));
    }

    #[test]
    fn missing_capability_is_forbidden() {
        let caller = Caller::from_headers(
            &headers(&[("x-remote-user", "bob"), ("x-remote-capabilities", "read")]),
            &AuthConfig::default(),
        )
        .unwrap();
        let err = caller.require(Capability::Edit).unwrap_err();
        assert!(matches!(err, ControlError::Forbidden("edit")));
    }

    #[test]
    fn custom_header_names() {
        let auth = AuthConfig {
            user_header: "x-forwarded-user".to_owned(),
            capabilities_header: "x-forwarded-groups".to_owned(),
        };
        let caller = Caller::from_headers(
            &headers(&[
                ("x-forwarded-user", "carol"),
                ("x-forwarded-groups", "edit"),
            ]),
            &auth,
        )
        .unwrap();
        assert_eq!(caller.user, "carol");
        assert!(caller.has(Capability::Edit));
        assert!(!caller.has(Capability::Read));
    }
}
