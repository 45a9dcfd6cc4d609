use palaver_session::session_route;
use palaver_storage::{SessionId, SessionStore};
use snafu::ResultExt;

use super::open_store;
use crate::error::{CliResult, InvalidSessionIdSnafu, StorageSnafu};
use crate::settings::SettingsStore;

pub async fn list(settings_store: &SettingsStore) -> CliResult<()> {
    let store = open_store(&settings_store.effective()).await?;
    let sessions = store
        .list_sessions()
        .await
        .context(StorageSnafu { stage: "list-sessions" })?;

    if sessions.is_empty() {
        println!("no stored sessions");
        return Ok(());
    }

    for summary in sessions {
        println!(
            "{}  {:>4} messages  updated {}",
            session_route(summary.id),
            summary.message_count,
            summary.updated_at_unix_seconds
        );
    }
    Ok(())
}

pub async fn forget(settings_store: &SettingsStore, raw: &str) -> CliResult<()> {
    let session_id = parse_session_reference(raw)?;
    let store = open_store(&settings_store.effective()).await?;
    let existed = store
        .delete_session(session_id)
        .await
        .context(StorageSnafu {
            stage: "delete-session",
        })?;

    if existed {
        println!("forgot session {session_id}");
    } else {
        println!("no stored session {session_id}");
    }
    Ok(())
}

/// Accepts a bare id or a `/c/<id>` route.
pub(crate) fn parse_session_reference(raw: &str) -> CliResult<SessionId> {
    let trimmed = raw.trim();
    let id = trimmed
        .split('?')
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(trimmed);
    SessionId::parse(id).context(InvalidSessionIdSnafu {
        raw: raw.to_string(),
    })
}
