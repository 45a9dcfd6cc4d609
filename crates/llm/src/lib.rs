//! Streaming completion transport used by the chat-session controller.
use std::sync::Arc;

mod provider;
mod rig_adapter;

pub use provider::{
    BoxFuture, LlmProvider, ProviderAttachment, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEventMapped, StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

pub const OLLAMA_PROVIDER_ID: &str = "ollama";

/// Ollama ignores the bearer token, but the OpenAI client insists on one.
const OLLAMA_PLACEHOLDER_API_KEY: &str = "ollama";

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        OLLAMA_PROVIDER_ID => {
            if config.api_key.is_empty() {
                config.api_key = OLLAMA_PLACEHOLDER_API_KEY.to_string();
            }
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_provider_id_defaults_to_openai() {
        let provider = create_provider(ProviderConfig::new("", "key", ""))
            .expect("openai adapter with key");
        assert_eq!(provider.id(), RIG_OPENAI_PROVIDER_ID);
    }

    #[test]
    fn ollama_does_not_need_a_key() {
        let provider = create_provider(ProviderConfig::new(
            "ollama",
            "",
            "http://localhost:11434/v1",
        ))
        .expect("ollama adapter without key");
        assert_eq!(provider.id(), OLLAMA_PROVIDER_ID);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let error = create_provider(ProviderConfig::new("bard", "key", ""))
            .err()
            .expect("unknown provider");
        assert!(matches!(error, ProviderError::UnsupportedProvider { .. }));
    }
}
