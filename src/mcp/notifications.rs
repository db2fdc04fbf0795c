//! Inbound notification routing
//!
//! Application handlers registered for a method take precedence; the
//! context and memory methods fall through to the [`ContextStore`] of the
//! session identity. Anything else is reported as unsupported.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use super::{
    context::{ContextStore, ContextUpdate},
    errors::{MCPError, MCPResult},
    protocol::JsonRpcNotification,
    transport::NotificationHandler,
};

/// Notification methods consumed by the context store
pub mod methods {
    pub const CONTEXT_UPDATE: &str = "context/update";
    pub const CONTEXT_CLEAR: &str = "context/clear";
    pub const MEMORY_APPEND: &str = "memory/append";
    pub const MEMORY_REPLACE: &str = "memory/replace";
}

/// Routes notifications by method name
pub struct NotificationRouter {
    identity: String,
    store: Arc<ContextStore>,
    handlers: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
    handled: AtomicU64,
}

impl NotificationRouter {
    pub fn new(identity: impl Into<String>, store: Arc<ContextStore>) -> Self {
        Self {
            identity: identity.into(),
            store,
            handlers: RwLock::new(HashMap::new()),
            handled: AtomicU64::new(0),
        }
    }

    /// Register an application handler for `method`, replacing any previous one
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn NotificationHandler>) {
        let method = method.into();
        debug!("Registering notification handler for {}", method);
        self.handlers.write().insert(method, handler);
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Notifications handled successfully so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// An empty id targets this session; otherwise it must name the session
    /// identity or its current context id
    fn targets_session(&self, update: &ContextUpdate) -> bool {
        update.id.is_empty()
            || update.id == self.identity
            || update.id == self.store.get_or_create(&self.identity).id
    }

    async fn route(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        let handler = self.handlers.read().get(&notification.method).cloned();
        if let Some(handler) = handler {
            return handler.handle_notification(notification).await;
        }

        match notification.method.as_str() {
            methods::CONTEXT_UPDATE => {
                let update = parse_update(&notification)?;
                self.store.apply_update(&self.identity, &update);
            }
            methods::CONTEXT_CLEAR => {
                self.store.clear(&self.identity);
            }
            methods::MEMORY_APPEND => {
                let update = parse_update(&notification)?;
                if !self.targets_session(&update) {
                    debug!("Ignoring memory/append for foreign context {}", update.id);
                    return Ok(());
                }
                self.store
                    .append_memory(&self.identity, update.append.unwrap_or_default());
            }
            methods::MEMORY_REPLACE => {
                let update = parse_update(&notification)?;
                match update.replace {
                    Some(blocks) => {
                        self.store.replace_memory(&self.identity, blocks);
                    }
                    None => {
                        for block in update.append.unwrap_or_default() {
                            if !self
                                .store
                                .update_block_content(&self.identity, &block.id, &block.content)
                            {
                                debug!("No memory block {} to replace", block.id);
                            }
                        }
                    }
                }
            }
            other => return Err(MCPError::unsupported_notification(other)),
        }
        Ok(())
    }
}

fn parse_update(notification: &JsonRpcNotification) -> MCPResult<ContextUpdate> {
    match notification.params_or_null() {
        Value::Null => Ok(ContextUpdate::default()),
        params => serde_json::from_value(params).map_err(|e| {
            MCPError::invalid_message(format!(
                "Invalid params for {}: {}",
                notification.method, e
            ))
        }),
    }
}

#[async_trait]
impl NotificationHandler for NotificationRouter {
    async fn handle_notification(&self, notification: JsonRpcNotification) -> MCPResult<()> {
        debug!("Handling notification {}", notification.method);
        let method = notification.method.clone();
        match self.route(notification).await {
            Ok(()) => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!("Notification {} not handled: {}", method, e);
                Err(e)
            }
        }
    }
}
