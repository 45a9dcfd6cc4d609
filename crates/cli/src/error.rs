use std::path::PathBuf;

use palaver_llm::ProviderError;
use palaver_session::ControllerError;
use palaver_storage::StorageError;
use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("failed to save settings: {source}"))]
    Settings { source: SettingsError },
    #[snafu(display("failed to open session database at {path:?}: {source}"))]
    OpenStore { path: PathBuf, source: StorageError },
    #[snafu(display("session store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("'{raw}' is not a session id: {source}"))]
    InvalidSessionId { raw: String, source: StorageError },
    #[snafu(display("failed to configure provider: {source}"))]
    Provider { source: ProviderError },
    #[snafu(display("failed to open session: {source}"))]
    Controller { source: ControllerError },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to read image {path:?}: {source}"))]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;
