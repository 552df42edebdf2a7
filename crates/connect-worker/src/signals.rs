// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process shutdown signal interception.

use std::io;

/// OS signals that trigger a graceful close of the worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Hangup,
    /// SIGQUIT
    Quit,
}

impl ShutdownSignal {
    /// Signals intercepted when the configuration does not say otherwise.
    pub fn defaults() -> Vec<ShutdownSignal> {
        vec![ShutdownSignal::Interrupt, ShutdownSignal::Terminate]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::Quit => SignalKind::quit(),
        }
    }
}

impl std::str::FromStr for ShutdownSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIGINT" | "INT" => Ok(ShutdownSignal::Interrupt),
            "SIGTERM" | "TERM" => Ok(ShutdownSignal::Terminate),
            "SIGHUP" | "HUP" => Ok(ShutdownSignal::Hangup),
            "SIGQUIT" | "QUIT" => Ok(ShutdownSignal::Quit),
            other => Err(format!("unsupported shutdown signal: {}", other)),
        }
    }
}

/// Wait until any of the given signals is delivered.
///
/// Handlers are installed before the first await, so a signal delivered
/// right after this is called is not lost. Never resolves for an empty list.
#[cfg(unix)]
pub(crate) async fn wait_for_any(signals: &[ShutdownSignal]) -> io::Result<ShutdownSignal> {
    use futures::FutureExt;
    use tokio::signal::unix::signal;

    if signals.is_empty() {
        return std::future::pending().await;
    }

    let mut streams = Vec::with_capacity(signals.len());
    for sig in signals {
        streams.push((*sig, signal(sig.kind())?));
    }

    let waits = streams
        .iter_mut()
        .map(|(sig, stream)| {
            let sig = *sig;
            async move {
                stream.recv().await;
                sig
            }
            .boxed()
        })
        .collect::<Vec<_>>();

    let (sig, _, _) = futures::future::select_all(waits).await;
    Ok(sig)
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_any(signals: &[ShutdownSignal]) -> io::Result<ShutdownSignal> {
    if !signals.contains(&ShutdownSignal::Interrupt) {
        return std::future::pending().await;
    }
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(
            "SIGTERM".parse::<ShutdownSignal>().unwrap(),
            ShutdownSignal::Terminate
        );
        assert_eq!(
            "int".parse::<ShutdownSignal>().unwrap(),
            ShutdownSignal::Interrupt
        );
        assert!("SIGKILL".parse::<ShutdownSignal>().is_err());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(
            ShutdownSignal::defaults(),
            vec![ShutdownSignal::Interrupt, ShutdownSignal::Terminate]
        );
        assert_eq!(ShutdownSignal::Terminate.as_str(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_empty_list_never_resolves() {
        let wait = wait_for_any(&[]);
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), wait).await;
        assert!(result.is_err());
    }
}
