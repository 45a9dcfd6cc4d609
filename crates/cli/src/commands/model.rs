use snafu::ResultExt;

use crate::error::{CliResult, SettingsSnafu};
use crate::settings::{Settings, SettingsStore};

pub fn use_model(settings_store: &SettingsStore, model: &str) -> CliResult<()> {
    let updated = Settings {
        default_model: Some(model.to_string()),
        ..settings_store.settings().as_ref().clone()
    };
    settings_store.update(updated).context(SettingsSnafu)?;

    match settings_store.settings().default_model.as_deref() {
        Some(model) => println!("new sessions will use {model}"),
        None => println!("default model cleared"),
    }
    Ok(())
}
