// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Primary/fallback signing credentials.

use std::fmt;

/// Pre-hashed primary and optional fallback credential.
///
/// Switches from primary to fallback at most once per connection lifetime.
#[derive(Clone)]
pub struct CredentialPair {
    primary: String,
    fallback: Option<String>,
    using_fallback: bool,
}

impl CredentialPair {
    pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.filter(|f| !f.is_empty()),
            using_fallback: false,
        }
    }

    /// Credential to authenticate the next request with.
    pub fn current(&self) -> &str {
        match (&self.fallback, self.using_fallback) {
            (Some(fallback), true) => fallback,
            _ => &self.primary,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    /// Switch to the fallback credential. Returns `false` if there is none
    /// or it is already in use.
    pub fn switch_to_fallback(&mut self) -> bool {
        if self.using_fallback || self.fallback.is_none() {
            return false;
        }
        self.using_fallback = true;
        true
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("primary", &"***")
            .field("fallback", &self.fallback.as_ref().map(|_| "***"))
            .field("using_fallback", &self.using_fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switches_once() {
        let mut creds = CredentialPair::new("primary", Some("fallback".to_string()));
        assert_eq!(creds.current(), "primary");

        assert!(creds.switch_to_fallback());
        assert_eq!(creds.current(), "fallback");
        assert!(creds.is_using_fallback());

        assert!(!creds.switch_to_fallback());
        assert_eq!(creds.current(), "fallback");
    }

    #[test]
    fn test_no_fallback() {
        let mut creds = CredentialPair::new("primary", None);
        assert!(!creds.switch_to_fallback());
        assert_eq!(creds.current(), "primary");

        let mut empty = CredentialPair::new("primary", Some(String::new()));
        assert!(!empty.switch_to_fallback());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = CredentialPair::new("signkey-prod-abc", Some("signkey-prod-def".to_string()));
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("abc"));
        assert!(!debug.contains("def"));
    }
}
