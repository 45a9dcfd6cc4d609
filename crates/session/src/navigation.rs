use palaver_storage::SessionId;

/// Route of the empty composer.
pub const ENTRY_ROUTE: &str = "/";

pub fn session_route(session_id: SessionId) -> String {
    format!("/c/{session_id}")
}

/// Host routing capability. Replacing must not push history.
pub trait Navigator: Send + Sync {
    fn navigate_replace(&self, path: &str);
}
