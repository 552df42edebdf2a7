// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker connection configuration.

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{ConnectError, Result};
use crate::signals::ShutdownSignal;
use crate::types::AppRegistration;

/// Default API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.inngest.com";

/// API endpoint of a local dev server.
pub const DEV_API_BASE_URL: &str = "http://localhost:8288";

/// Configuration for a [`WorkerConnection`](crate::WorkerConnection).
#[derive(Clone)]
pub struct ConnectConfig {
    /// Applications served by this worker (at least one)
    pub apps: Vec<AppRegistration>,
    /// Primary signing key, already hashed
    pub signing_key: String,
    /// Fallback signing key used after an authentication failure
    pub signing_key_fallback: Option<String>,
    /// Environment name sent with every API request
    pub environment: Option<String>,
    /// Base URL of the start/flush API (default: "https://api.inngest.com")
    pub api_base_url: String,
    /// Stable worker identity. Falls back to `HOSTNAME`, then a random id.
    pub instance_id: Option<String>,
    /// Advertised upper bound on concurrently executing work items
    pub max_worker_concurrency: Option<u64>,
    /// Overall timeout for the setup handshake in milliseconds (default: 30_000)
    pub setup_timeout_ms: u64,
    /// Socket open timeout in milliseconds (default: 10_000)
    pub socket_timeout_ms: u64,
    /// Signals that trigger a graceful close. Empty disables interception.
    pub shutdown_signals: Vec<ShutdownSignal>,
    /// Delay schedule between reconnect attempts (default: 1s doubling to 60s)
    pub reconnect_backoff: Backoff,
    /// How long a reply sent on the socket may wait for its ack before it is
    /// buffered for HTTP delivery, in milliseconds (default: 5_000)
    pub reply_ack_timeout_ms: u64,
}

impl ConnectConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `INNGEST_SIGNING_KEY` - Hashed signing key
    ///
    /// # Optional Environment Variables
    /// - `INNGEST_SIGNING_KEY_FALLBACK` - Fallback signing key
    /// - `INNGEST_ENV` - Environment name
    /// - `INNGEST_API_BASE_URL` - API base URL (default: "https://api.inngest.com")
    /// - `INNGEST_DEV` - When `1`/`true`, use the local dev server URL
    /// - `INNGEST_CONNECT_INSTANCE_ID` - Worker instance id
    /// - `INNGEST_CONNECT_MAX_WORKER_CONCURRENCY` - Advertised concurrency limit
    /// - `INNGEST_CONNECT_SETUP_TIMEOUT_MS` - Setup timeout (default: 30000)
    /// - `INNGEST_CONNECT_SOCKET_TIMEOUT_MS` - Socket open timeout (default: 10000)
    /// - `INNGEST_CONNECT_SHUTDOWN_SIGNALS` - Comma-separated signals such as
    ///   `SIGINT,SIGTERM`; `none` disables interception
    ///
    /// Numeric variables and signal names that fail to parse are reported as
    /// [`ConnectError::Config`].
    pub fn from_env(apps: Vec<AppRegistration>) -> Result<Self> {
        let signing_key = env::var("INNGEST_SIGNING_KEY")
            .map_err(|_| ConnectError::Config("INNGEST_SIGNING_KEY is required".to_string()))?;

        let signing_key_fallback = non_empty_var("INNGEST_SIGNING_KEY_FALLBACK");
        let environment = non_empty_var("INNGEST_ENV");

        let dev = env::var("INNGEST_DEV")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let api_base_url = non_empty_var("INNGEST_API_BASE_URL").unwrap_or_else(|| {
            if dev {
                DEV_API_BASE_URL.to_string()
            } else {
                DEFAULT_API_BASE_URL.to_string()
            }
        });

        let instance_id = non_empty_var("INNGEST_CONNECT_INSTANCE_ID");

        let max_worker_concurrency = parsed_var("INNGEST_CONNECT_MAX_WORKER_CONCURRENCY")?;
        let setup_timeout_ms = parsed_var("INNGEST_CONNECT_SETUP_TIMEOUT_MS")?.unwrap_or(30_000);
        let socket_timeout_ms = parsed_var("INNGEST_CONNECT_SOCKET_TIMEOUT_MS")?.unwrap_or(10_000);

        let shutdown_signals = match env::var("INNGEST_CONNECT_SHUTDOWN_SIGNALS") {
            Ok(v) if v.trim().is_empty() || v.trim().eq_ignore_ascii_case("none") => Vec::new(),
            Ok(v) => v
                .split(',')
                .map(|name| {
                    name.parse::<ShutdownSignal>().map_err(|e| {
                        ConnectError::Config(format!("invalid INNGEST_CONNECT_SHUTDOWN_SIGNALS: {}", e))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => ShutdownSignal::defaults(),
        };

        let config = Self {
            signing_key_fallback,
            environment,
            api_base_url,
            instance_id,
            max_worker_concurrency,
            setup_timeout_ms,
            socket_timeout_ms,
            shutdown_signals,
            ..Self::new(signing_key, apps)
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with defaults for everything but the key and apps.
    pub fn new(signing_key: impl Into<String>, apps: Vec<AppRegistration>) -> Self {
        Self {
            apps,
            signing_key: signing_key.into(),
            signing_key_fallback: None,
            environment: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            instance_id: None,
            max_worker_concurrency: None,
            setup_timeout_ms: 30_000,
            socket_timeout_ms: 10_000,
            shutdown_signals: ShutdownSignal::defaults(),
            reconnect_backoff: Backoff::default(),
            reply_ack_timeout_ms: 5_000,
        }
    }

    /// Check the configuration before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(ConnectError::Config(
                "at least one application is required".to_string(),
            ));
        }
        if self.signing_key.trim().is_empty() {
            return Err(ConnectError::Config("signing key is empty".to_string()));
        }

        let mut names = HashSet::new();
        for app in &self.apps {
            if app.app_name.is_empty() {
                return Err(ConnectError::Config("application name is empty".to_string()));
            }
            if !names.insert(app.app_name.as_str()) {
                return Err(ConnectError::Config(format!(
                    "duplicate application name: {}",
                    app.app_name
                )));
            }
        }

        if self.setup_timeout_ms == 0 || self.socket_timeout_ms == 0 {
            return Err(ConnectError::Config("timeouts must be non-zero".to_string()));
        }
        if self.reply_ack_timeout_ms == 0 {
            return Err(ConnectError::Config(
                "reply ack timeout must be non-zero".to_string(),
            ));
        }
        if self.reconnect_backoff.base.is_zero() {
            return Err(ConnectError::Config(
                "reconnect backoff must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn reply_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_ack_timeout_ms)
    }

    /// Add an application.
    pub fn with_app(mut self, app: AppRegistration) -> Self {
        self.apps.push(app);
        self
    }

    pub fn with_signing_key_fallback(mut self, key: impl Into<String>) -> Self {
        self.signing_key_fallback = Some(key.into());
        self
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    /// Set the API base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_max_worker_concurrency(mut self, max: u64) -> Self {
        self.max_worker_concurrency = Some(max);
        self
    }

    pub fn with_setup_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.setup_timeout_ms = timeout_ms;
        self
    }

    pub fn with_socket_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.socket_timeout_ms = timeout_ms;
        self
    }

    /// Set the intercepted shutdown signals. An empty list disables interception.
    pub fn with_shutdown_signals(mut self, signals: Vec<ShutdownSignal>) -> Self {
        self.shutdown_signals = signals;
        self
    }

    pub fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_backoff = Backoff::new(base, max);
        self
    }

    pub fn with_reply_ack_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reply_ack_timeout_ms = timeout_ms;
        self
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("apps", &self.apps)
            .field("signing_key", &"***")
            .field(
                "signing_key_fallback",
                &self.signing_key_fallback.as_ref().map(|_| "***"),
            )
            .field("environment", &self.environment)
            .field("api_base_url", &self.api_base_url)
            .field("instance_id", &self.instance_id)
            .field("max_worker_concurrency", &self.max_worker_concurrency)
            .field("setup_timeout_ms", &self.setup_timeout_ms)
            .field("socket_timeout_ms", &self.socket_timeout_ms)
            .field("shutdown_signals", &self.shutdown_signals)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("reply_ack_timeout_ms", &self.reply_ack_timeout_ms)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match non_empty_var(name) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConnectError::Config(format!("invalid {}: {}", name, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::handler_fn;
    use crate::types::{ExecutionReply, WorkItem};
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 10] = [
        "INNGEST_SIGNING_KEY",
        "INNGEST_SIGNING_KEY_FALLBACK",
        "INNGEST_ENV",
        "INNGEST_API_BASE_URL",
        "INNGEST_DEV",
        "INNGEST_CONNECT_INSTANCE_ID",
        "INNGEST_CONNECT_MAX_WORKER_CONCURRENCY",
        "INNGEST_CONNECT_SETUP_TIMEOUT_MS",
        "INNGEST_CONNECT_SOCKET_TIMEOUT_MS",
        "INNGEST_CONNECT_SHUTDOWN_SIGNALS",
    ];

    /// Restores the connect environment variables on drop.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let saved = VARS.iter().map(|k| (*k, env::var(k).ok())).collect();
            for k in VARS {
                unsafe { env::remove_var(k) };
            }
            Self { saved }
        }

        fn set(&self, key: &str, value: &str) {
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in &self.saved {
                match v {
                    Some(v) => unsafe { env::set_var(k, v) },
                    None => unsafe { env::remove_var(k) },
                }
            }
        }
    }

    fn app(name: &str) -> AppRegistration {
        AppRegistration::new(
            name,
            serde_json::json!([]),
            handler_fn(|_item: WorkItem| async { Ok(ExecutionReply::done(vec![])) }),
        )
    }

    #[test]
    fn test_defaults() {
        let config = ConnectConfig::new("key", vec![app("shop")]);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.setup_timeout(), Duration::from_secs(30));
        assert_eq!(config.socket_timeout(), Duration::from_secs(10));
        assert_eq!(config.reply_ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.shutdown_signals, ShutdownSignal::defaults());
        assert_eq!(config.reconnect_backoff, Backoff::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConnectConfig::new("key", vec![])
            .with_app(app("shop"))
            .with_signing_key_fallback("fallback")
            .with_environment("branch-1")
            .with_instance_id("worker-1")
            .with_max_worker_concurrency(8)
            .with_setup_timeout_ms(1_000)
            .with_shutdown_signals(vec![]);

        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.signing_key_fallback.as_deref(), Some("fallback"));
        assert_eq!(config.environment.as_deref(), Some("branch-1"));
        assert_eq!(config.instance_id.as_deref(), Some("worker-1"));
        assert_eq!(config.max_worker_concurrency, Some(8));
        assert_eq!(config.setup_timeout_ms, 1_000);
        assert!(config.shutdown_signals.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(ConnectConfig::new("key", vec![]).validate().is_err());
        assert!(ConnectConfig::new(" ", vec![app("a")]).validate().is_err());
        assert!(
            ConnectConfig::new("key", vec![app("a"), app("a")])
                .validate()
                .is_err()
        );
        assert!(
            ConnectConfig::new("key", vec![app("a")])
                .with_socket_timeout_ms(0)
                .validate()
                .is_err()
        );
        assert!(
            ConnectConfig::new("key", vec![app("a")])
                .with_reconnect_backoff(Duration::ZERO, Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_from_env_requires_signing_key() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = EnvGuard::new();

        let err = ConnectConfig::from_env(vec![app("shop")]).unwrap_err();
        assert!(err.to_string().contains("INNGEST_SIGNING_KEY"));
    }

    #[test]
    fn test_from_env_reads_all_variables() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let guard = EnvGuard::new();
        guard.set("INNGEST_SIGNING_KEY", "signkey-prod-1");
        guard.set("INNGEST_SIGNING_KEY_FALLBACK", "signkey-prod-2");
        guard.set("INNGEST_ENV", "staging");
        guard.set("INNGEST_API_BASE_URL", "http://api.local");
        guard.set("INNGEST_CONNECT_INSTANCE_ID", "pod-7");
        guard.set("INNGEST_CONNECT_MAX_WORKER_CONCURRENCY", "16");
        guard.set("INNGEST_CONNECT_SETUP_TIMEOUT_MS", "5000");
        guard.set("INNGEST_CONNECT_SOCKET_TIMEOUT_MS", "2000");
        guard.set("INNGEST_CONNECT_SHUTDOWN_SIGNALS", "SIGTERM, hup");

        let config = ConnectConfig::from_env(vec![app("shop")]).unwrap();
        assert_eq!(config.signing_key, "signkey-prod-1");
        assert_eq!(config.signing_key_fallback.as_deref(), Some("signkey-prod-2"));
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.api_base_url, "http://api.local");
        assert_eq!(config.instance_id.as_deref(), Some("pod-7"));
        assert_eq!(config.max_worker_concurrency, Some(16));
        assert_eq!(config.setup_timeout_ms, 5_000);
        assert_eq!(config.socket_timeout_ms, 2_000);
        assert_eq!(
            config.shutdown_signals,
            vec![ShutdownSignal::Terminate, ShutdownSignal::Hangup]
        );
    }

    #[test]
    fn test_from_env_signal_defaults_and_opt_out() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let guard = EnvGuard::new();
        guard.set("INNGEST_SIGNING_KEY", "key");

        let config = ConnectConfig::from_env(vec![app("shop")]).unwrap();
        assert_eq!(config.shutdown_signals, ShutdownSignal::defaults());

        guard.set("INNGEST_CONNECT_SHUTDOWN_SIGNALS", "none");
        let config = ConnectConfig::from_env(vec![app("shop")]).unwrap();
        assert!(config.shutdown_signals.is_empty());

        guard.set("INNGEST_CONNECT_SHUTDOWN_SIGNALS", "SIGTERM,SIGUSR1");
        let err = ConnectConfig::from_env(vec![app("shop")]).unwrap_err();
        assert!(err.to_string().contains("SIGUSR1"));
    }

    #[test]
    fn test_from_env_dev_mode() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let guard = EnvGuard::new();
        guard.set("INNGEST_SIGNING_KEY", "key");
        guard.set("INNGEST_DEV", "1");

        let config = ConnectConfig::from_env(vec![app("shop")]).unwrap();
        assert_eq!(config.api_base_url, DEV_API_BASE_URL);
    }

    #[test]
    fn test_from_env_invalid_concurrency() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let guard = EnvGuard::new();
        guard.set("INNGEST_SIGNING_KEY", "key");
        guard.set("INNGEST_CONNECT_MAX_WORKER_CONCURRENCY", "lots");

        let err = ConnectConfig::from_env(vec![app("shop")]).unwrap_err();
        assert!(matches!(err, ConnectError::Config(_)));
    }

    #[test]
    fn test_from_env_invalid_timeouts() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let guard = EnvGuard::new();
        guard.set("INNGEST_SIGNING_KEY", "key");

        for var in [
            "INNGEST_CONNECT_SETUP_TIMEOUT_MS",
            "INNGEST_CONNECT_SOCKET_TIMEOUT_MS",
        ] {
            guard.set(var, "soon");
            let err = ConnectConfig::from_env(vec![app("shop")]).unwrap_err();
            assert!(matches!(err, ConnectError::Config(_)));
            assert!(err.to_string().contains(var));
            guard.set(var, "2500");
        }

        let config = ConnectConfig::from_env(vec![app("shop")]).unwrap();
        assert_eq!(config.setup_timeout_ms, 2_500);
        assert_eq!(config.socket_timeout_ms, 2_500);
    }

    #[test]
    fn test_debug_redacts_signing_keys() {
        let config = ConnectConfig::new("signkey-prod-secret", vec![app("shop")])
            .with_signing_key_fallback("signkey-prod-older");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("older"));
        assert!(debug.contains("shop"));
    }
}
