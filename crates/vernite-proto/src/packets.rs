//! Packet catalog: every message type that can travel inside an envelope.
//!
//! Each packet type carries its fully-qualified name, which is what the
//! envelope records on the wire and what the gateway's handler registry keys
//! on. Adding a packet never changes the framing, only this catalog.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A message type that can be packed into an envelope.
pub trait Packet: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified type name, unique across the catalog.
    const TYPE_NAME: &'static str;
}

/// Names of all catalogued packet types.
pub const CATALOG: &[&str] = &[
    KeepAlive::TYPE_NAME,
    Task::TYPE_NAME,
    SendMessage::TYPE_NAME,
    ChatMessage::TYPE_NAME,
];

/// Liveness probe. The server sends one per heartbeat tick with `id` set to
/// the current Unix time in milliseconds; clients echo it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub id: i64,
}

impl Packet for KeepAlive {
    const TYPE_NAME: &'static str = "vernite.KeepAlive";
}

/// What happened to an entity in a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum BasicAction {
    Added = 0,
    Updated = 1,
    Removed = 2,
}

impl From<BasicAction> for u8 {
    fn from(a: BasicAction) -> u8 {
        a as u8
    }
}

impl TryFrom<u8> for BasicAction {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Added),
            1 => Ok(Self::Updated),
            2 => Ok(Self::Removed),
            _ => Err(format!("unknown BasicAction: {v}")),
        }
    }
}

/// Task change notification pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub project_id: u64,
    pub status_id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Creation time, Unix milliseconds.
    pub created_at: i64,
    #[serde(rename = "type")]
    pub task_type: i32,
    #[serde(default)]
    pub priority: String,
    pub created_by: u64,
    pub action: BasicAction,
}

impl Packet for Task {
    const TYPE_NAME: &'static str = "vernite.Task";
}

/// Client request to post a message through a chat integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub integration_id: u64,
    pub provider: String,
    pub channel: String,
    pub content: String,
}

impl Packet for SendMessage {
    const TYPE_NAME: &'static str = "vernite.communicator.SendMessage";
}

/// Chat message pushed to the integration owner when one arrives upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub user: String,
    pub channel: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub provider: String,
}

impl Packet for ChatMessage {
    const TYPE_NAME: &'static str = "vernite.communicator.Message";
}
