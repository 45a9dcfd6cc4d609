use palaver_storage::SqliteSessionStore;
use snafu::ResultExt;

use crate::error::{CliResult, OpenStoreSnafu};
use crate::settings::Settings;

pub mod chat;
pub mod model;
pub mod sessions;

pub(crate) async fn open_store(settings: &Settings) -> CliResult<SqliteSessionStore> {
    let path = settings.database_path();
    let location = path.to_string_lossy().into_owned();
    SqliteSessionStore::open(&location)
        .await
        .context(OpenStoreSnafu { path })
}
