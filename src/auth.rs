//! HTTP Basic access guard.
//!
//! A single shared credential gates every request. The `Authorization`
//! header value is precomputed once at startup and compared verbatim.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Optional single-credential guard.
#[derive(Debug, Clone, Default)]
pub struct AccessGuard {
    /// `"Basic " + base64(user:pass)`, or None when auth is disabled.
    token: Option<String>,
}

impl AccessGuard {
    /// Build a guard from a username/password pair.
    ///
    /// Auth is disabled entirely when both are empty. A user without a
    /// password (or the reverse) still enables it.
    pub fn new(username: &str, password: &str) -> Self {
        if username.is_empty() && password.is_empty() {
            tracing::info!("HTTP authentication disabled");
            return Self::disabled();
        }

        let token = format!("Basic {}", BASE64.encode(format!("{username}:{password}")));
        tracing::info!(user = username, "HTTP basic authentication enabled");
        Self { token: Some(token) }
    }

    /// A guard that lets every request through.
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn needs_auth(&self) -> bool {
        self.token.is_some()
    }

    /// Check a presented `Authorization` header value.
    pub fn check(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(presented)) => expected == presented,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_guard_accepts_anything() {
        let guard = AccessGuard::new("", "");
        assert!(!guard.needs_auth());
        assert!(guard.check(None));
        assert!(guard.check(Some("Basic Zm9vOmJhcg==")));
        assert!(guard.check(Some("")));
    }

    #[test]
    fn test_enabled_guard_requires_exact_token() {
        // "user:secret"
        let guard = AccessGuard::new("user", "secret");
        assert!(guard.needs_auth());
        assert!(!guard.check(None));
        assert!(guard.check(Some("Basic dXNlcjpzZWNyZXQ=")));
        assert!(!guard.check(Some("Basic dXNlcjp3cm9uZw==")));
        assert!(!guard.check(Some("basic dXNlcjpzZWNyZXQ=")));
        assert!(!guard.check(Some("")));
    }

    #[test]
    fn test_user_without_password_enables_auth() {
        let guard = AccessGuard::new("user", "");
        assert!(guard.needs_auth());
        // "user:"
        assert!(guard.check(Some("Basic dXNlcjo=")));
    }
}
