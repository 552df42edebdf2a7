// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution handler seam.
//!
//! The worker does not run user functions itself. Each registered
//! application supplies a [`RequestHandler`] that turns a [`WorkItem`] into
//! an [`ExecutionReply`]; the worker only routes items by application name.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{AppRegistration, ExecutionReply, WorkItem};

/// Executes work items for one application.
///
/// Implementations may run for a long time and may have side effects; the
/// worker keeps the item's lease alive until `handle` returns.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Execute a work item. Errors are reported to the gateway as `ERROR` replies.
    async fn handle(&self, item: WorkItem) -> anyhow::Result<ExecutionReply>;
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F, Fut>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ExecutionReply>> + Send,
{
    async fn handle(&self, item: WorkItem) -> anyhow::Result<ExecutionReply> {
        (self.f)(item).await
    }
}

/// Wrap an async closure as a shareable [`RequestHandler`].
///
/// ```ignore
/// let handler = handler_fn(|item: WorkItem| async move {
///     Ok(ExecutionReply::done(item.payload))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ExecutionReply>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

/// Registered handlers keyed by application name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from application registrations.
    pub fn from_apps(apps: &[AppRegistration]) -> Self {
        let mut registry = Self::new();
        for app in apps {
            registry.register(app.app_name.clone(), app.handler.clone());
        }
        registry
    }

    pub fn register(&mut self, app_name: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(app_name.into(), handler);
    }

    pub fn get(&self, app_name: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(app_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
