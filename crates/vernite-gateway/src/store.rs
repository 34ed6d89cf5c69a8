//! Session store collaborator.
//!
//! The gateway does not own HTTP login sessions; it only resolves the opaque
//! token from the session cookie and touches the record's last-used time and
//! IP. Production deployments plug the application's store in through
//! [`SessionStore`]; [`MemorySessionStore`] backs tests and local runs.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use tokio::sync::RwLock;
use vernite_proto::VerniteResult;

/// A user identity as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub username: String,
    /// Soft-deleted accounts keep their sessions but never get a live identity.
    pub deleted: bool,
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.username, self.id)
    }
}

/// An HTTP login session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Opaque token carried in the session cookie.
    pub token: String,
    pub user: User,
    /// Last known client IP.
    pub ip: Option<String>,
    pub last_used: SystemTime,
}

/// Lookup and persistence of login sessions.
pub trait SessionStore: Send + Sync {
    /// Resolve a token. `Ok(None)` means no such session.
    fn lookup<'a>(&'a self, token: &'a str) -> BoxFuture<'a, VerniteResult<Option<SessionRecord>>>;

    /// Persist an updated record.
    fn save<'a>(&'a self, record: &'a SessionRecord) -> BoxFuture<'a, VerniteResult<()>>;
}

/// In-memory session store keyed by token.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with records.
    pub fn from_records(records: impl IntoIterator<Item = SessionRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.token.clone(), r))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn insert(&self, record: SessionRecord) {
        let mut records = self.records.write().await;
        records.insert(record.token.clone(), record);
    }

    pub async fn get(&self, token: &str) -> Option<SessionRecord> {
        self.records.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl SessionStore for MemorySessionStore {
    fn lookup<'a>(&'a self, token: &'a str) -> BoxFuture<'a, VerniteResult<Option<SessionRecord>>> {
        Box::pin(async move { Ok(self.get(token).await) })
    }

    fn save<'a>(&'a self, record: &'a SessionRecord) -> BoxFuture<'a, VerniteResult<()>> {
        Box::pin(async move {
            self.insert(record.clone()).await;
            Ok(())
        })
    }
}
