//! Built-in packet handlers.

pub mod send_message;
pub mod text_relay;

pub use send_message::{Communicator, SendMessageHandler, SLACK_PROVIDER};
pub use text_relay::TextRelayHandler;

use crate::dispatch::HandlerRegistry;
use std::sync::Arc;
use vernite_proto::VerniteResult;

/// External services handlers depend on. Absent services leave their
/// handlers unregistered.
#[derive(Default, Clone)]
pub struct HandlerDeps {
    pub communicator: Option<Arc<dyn Communicator>>,
}

/// Build the gateway's handler registry.
pub fn catalog(deps: HandlerDeps) -> VerniteResult<HandlerRegistry> {
    let mut builder = HandlerRegistry::builder();
    if let Some(communicator) = deps.communicator {
        builder = builder.register(SendMessageHandler::new(communicator))?;
    }
    Ok(builder.build())
}
