//! vernite-gateway: real-time WebSocket gateway.
//!
//! Authenticates connections from the login-session cookie, keeps the live
//! connection set, routes typed packets to handlers, and pushes broadcasts
//! and heartbeats to every open connection.
//!
//! Handlers that need an external service are only registered when the
//! embedding application supplies it:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use vernite_gateway::handlers::{self, Communicator, HandlerDeps};
//! # use vernite_gateway::{GatewayConfig, GatewayServer, MemorySessionStore};
//! # async fn run(slack: Arc<dyn Communicator>) -> vernite_proto::VerniteResult<()> {
//! let handlers = handlers::catalog(HandlerDeps { communicator: Some(slack) })?;
//! let server = GatewayServer::new(
//!     GatewayConfig::default(),
//!     Arc::new(MemorySessionStore::new()),
//!     handlers,
//! );
//! let (_addr, accept_loop) = server.start().await?;
//! # let _ = accept_loop;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod handshake;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, Handler, HandlerRegistry};
pub use registry::ConnectionRegistry;
pub use server::GatewayServer;
pub use session::ConnectionSession;
pub use store::{MemorySessionStore, SessionRecord, SessionStore, User};
