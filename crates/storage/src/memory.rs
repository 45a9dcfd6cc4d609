use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use super::error::StorageResult;
use super::ids::SessionId;
use super::types::{MessageRecord, SessionSummary};
use super::{BoxFuture, SessionStore};

struct StoredTranscript {
    messages: Vec<MessageRecord>,
    updated_at_unix_seconds: u64,
    // Breaks ties between writes that land in the same second.
    revision: u64,
}

/// Process-local store. Durable for the lifetime of the process only.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<SessionId, StoredTranscript>>,
    revision: std::sync::atomic::AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.revision
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .saturating_add(1)
    }
}

impl SessionStore for MemorySessionStore {
    fn get<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .get(&session_id)
                .map(|entry| entry.messages.clone())
                .unwrap_or_default())
        })
    }

    fn put<'a>(
        &'a self,
        session_id: SessionId,
        messages: Vec<MessageRecord>,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let revision = self.next_revision();
            let mut entries = self.entries.write().await;
            entries.insert(
                session_id,
                StoredTranscript {
                    messages,
                    updated_at_unix_seconds: unix_timestamp_seconds(),
                    revision,
                },
            );
            Ok(())
        })
    }

    fn list_sessions<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<SessionSummary>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            let mut ordered = entries.iter().collect::<Vec<_>>();
            ordered.sort_by(|(_, left), (_, right)| right.revision.cmp(&left.revision));

            Ok(ordered
                .into_iter()
                .map(|(id, entry)| SessionSummary {
                    id: *id,
                    message_count: entry.messages.len() as u64,
                    updated_at_unix_seconds: entry.updated_at_unix_seconds,
                })
                .collect())
        })
    }

    fn delete_session<'a>(&'a self, session_id: SessionId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            Ok(entries.remove(&session_id).is_some())
        })
    }
}

fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::types::{MessageRole, StoredContent};
    use pretty_assertions::assert_eq;

    fn record(role: MessageRole, text: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            role,
            content: StoredContent::Text(text.to_string()),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unknown_session_reads_as_empty() {
        let store = MemorySessionStore::new();
        let messages = store.get(SessionId::new_v7()).await.expect("read");
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn put_replaces_previous_transcript() {
        let store = MemorySessionStore::new();
        let session_id = SessionId::new_v7();

        store
            .put(
                session_id,
                vec![record(MessageRole::User, "hi"), record(MessageRole::Assistant, "hello")],
            )
            .await
            .expect("first write");
        let replacement = vec![record(MessageRole::User, "again")];
        store
            .put(session_id, replacement.clone())
            .await
            .expect("second write");

        assert_eq!(store.get(session_id).await.expect("read"), replacement);
    }

    #[tokio::test]
    async fn listing_orders_by_latest_write() {
        let store = MemorySessionStore::new();
        let older = SessionId::new_v7();
        let newer = SessionId::new_v7();

        store
            .put(older, vec![record(MessageRole::User, "a")])
            .await
            .expect("write older");
        store
            .put(newer, vec![record(MessageRole::User, "b")])
            .await
            .expect("write newer");

        let ids = store
            .list_sessions()
            .await
            .expect("list")
            .into_iter()
            .map(|summary| summary.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![newer, older]);

        assert!(store.delete_session(older).await.expect("delete"));
        assert!(!store.delete_session(older).await.expect("second delete"));
        assert_eq!(store.list_sessions().await.expect("list").len(), 1);
    }
}
