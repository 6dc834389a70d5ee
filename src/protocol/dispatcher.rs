use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::protocol::message::Message;
use crate::transport::{Connection, Handler};

type RouteFn = dyn Fn(&Arc<Connection>, &Message) -> Result<Option<Message>> + Send + Sync + 'static;

/// Routes inbound messages to callbacks keyed by message type.
///
/// A route may return a reply, which is queued on the same connection. Messages
/// with no route go to the fallback if one is set and are otherwise logged and
/// dropped.
pub struct Dispatcher {
    routes: Arc<RwLock<HashMap<u32, Box<RouteFn>>>>,
    fallback: RwLock<Option<Box<RouteFn>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            fallback: RwLock::new(None),
        }
    }

    /// Register (or replace) the route for `message_type`.
    pub fn register<F>(&self, message_type: u32, route: F) -> Result<()>
    where
        F: Fn(&Arc<Connection>, &Message) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        let mut routes = self
            .routes
            .write()
            .map_err(|_| EngineError::Fatal("dispatcher route table poisoned".to_string()))?;
        routes.insert(message_type, Box::new(route));
        Ok(())
    }

    /// Route for message types with no registered callback.
    pub fn set_fallback<F>(&self, route: F) -> Result<()>
    where
        F: Fn(&Arc<Connection>, &Message) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        let mut fallback = self
            .fallback
            .write()
            .map_err(|_| EngineError::Fatal("dispatcher fallback poisoned".to_string()))?;
        *fallback = Some(Box::new(route));
        Ok(())
    }

    pub fn is_routed(&self, message_type: u32) -> bool {
        self.routes
            .read()
            .map(|routes| routes.contains_key(&message_type))
            .unwrap_or(false)
    }

    /// Run the matching route and return its reply, if any.
    ///
    /// `Ok(None)` is also returned for unrouted messages when no fallback is set.
    pub fn dispatch(&self, conn: &Arc<Connection>, message: &Message) -> Result<Option<Message>> {
        let message_type = message.message_type();
        {
            let routes = self
                .routes
                .read()
                .map_err(|_| EngineError::Fatal("dispatcher route table poisoned".to_string()))?;
            if let Some(route) = routes.get(&message_type) {
                return route(conn, message);
            }
        }

        let fallback = self
            .fallback
            .read()
            .map_err(|_| EngineError::Fatal("dispatcher fallback poisoned".to_string()))?;
        match fallback.as_ref() {
            Some(route) => route(conn, message),
            None => {
                debug!(conn_id = conn.id(), message_type, "No route for message type");
                Ok(None)
            }
        }
    }
}

impl Handler for Dispatcher {
    fn on_message(&self, conn: &Arc<Connection>, message: Message) {
        match self.dispatch(conn, &message) {
            Ok(Some(reply)) => {
                if let Err(e) = conn.send(&reply) {
                    warn!(conn_id = conn.id(), error = %e, "Failed to queue reply");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                conn_id = conn.id(),
                message_type = message.message_type(),
                error = %e,
                "Route failed"
            ),
        }
    }
}
