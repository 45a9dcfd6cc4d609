//! Durable per-session transcripts.
//!
//! The store is a pure key/value contract: `get` returns the ordered transcript for a
//! session (empty when unknown) and `put` replaces it wholesale, last writer wins.
//! Writers for one session id must be serialized by the caller.
use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use types::{AttachmentRecord, MessageRecord, MessageRole, SessionSummary, StoredContent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait SessionStore: Send + Sync {
    fn get<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    fn put<'a>(
        &'a self,
        session_id: SessionId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Sessions with a stored transcript, most recently written first.
    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionSummary>>>;

    /// Returns whether a transcript existed.
    fn delete_session<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<bool>>;
}
