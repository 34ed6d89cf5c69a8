//! Packet handlers, the handler registry and the dispatcher.
//!
//! The registry is built once at startup from an explicit list of handlers.
//! Each handler names its packet type, and that type's name becomes the
//! registry key; registering two handlers for one type is a configuration
//! error that aborts startup. After `build()` the map is never mutated.

use crate::registry::ConnectionRegistry;
use crate::session::ConnectionSession;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vernite_proto::{codec, Envelope, Packet, VerniteError, VerniteResult, CATALOG};

/// Logic bound to exactly one packet type.
///
/// Handlers are shared across connections and invoked concurrently, so they
/// keep no per-connection state.
pub trait Handler: Send + Sync + 'static {
    type Packet: Packet;

    fn handle<'a>(
        &'a self,
        connections: &'a ConnectionRegistry,
        session: &'a ConnectionSession,
        packet: Self::Packet,
    ) -> BoxFuture<'a, VerniteResult<()>>;
}

/// Type-erased handler: unpacks the envelope into the handler's packet type.
trait ErasedHandler: Send + Sync {
    fn call<'a>(
        &'a self,
        connections: &'a ConnectionRegistry,
        session: &'a ConnectionSession,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, VerniteResult<()>>;
}

struct Typed<H>(H);

impl<H: Handler> ErasedHandler for Typed<H> {
    fn call<'a>(
        &'a self,
        connections: &'a ConnectionRegistry,
        session: &'a ConnectionSession,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async move {
            let packet: H::Packet = envelope.unpack()?;
            self.0.handle(connections, session, packet).await
        })
    }
}

/// Immutable map from packet type name to handler.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Box<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// A registry with no handlers; every packet is unroutable.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn get(&self, type_name: &str) -> Option<&dyn ErasedHandler> {
        self.handlers.get(type_name).map(|h| h.as_ref())
    }
}

/// Collects handlers; consumed on the first duplicate so no partial
/// registry can escape.
pub struct HandlerRegistryBuilder {
    handlers: HashMap<&'static str, Box<dyn ErasedHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register<H: Handler>(mut self, handler: H) -> VerniteResult<Self> {
        let type_name = <H::Packet as Packet>::TYPE_NAME;
        if self.handlers.contains_key(type_name) {
            return Err(VerniteError::DuplicateHandler(type_name.to_string()));
        }
        self.handlers.insert(type_name, Box::new(Typed(handler)));
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        for name in CATALOG.iter().filter(|n| !self.handlers.contains_key(*n)) {
            debug!(type_name = %name, "no handler registered");
        }
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Routes decoded frames to their handlers.
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    connections: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<HandlerRegistry>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            handlers,
            connections,
        }
    }

    /// Decode a raw frame and dispatch it.
    pub async fn call(&self, session: &ConnectionSession, frame: &[u8]) -> VerniteResult<()> {
        let envelope = codec::decode(frame)?;
        self.dispatch(session, &envelope).await
    }

    /// Dispatch an already-decoded envelope. Packets without a handler are
    /// logged and dropped; handler errors are returned to the caller.
    pub async fn dispatch(&self, session: &ConnectionSession, envelope: &Envelope) -> VerniteResult<()> {
        let type_name = envelope.type_name();
        let Some(handler) = self.handlers.get(type_name) else {
            warn!(session = %session, type_name, "no handler for packet");
            return Ok(());
        };
        handler.call(&self.connections, session, envelope).await
    }
}
