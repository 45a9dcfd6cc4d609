use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::message::{ImageMediaType, UserContent};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, MissingModelSnafu, ProviderAttachment, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    StreamEventMapped, StreamRequest, StreamTarget, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible streaming transport backed by rig.
///
/// Ollama exposes the same wire API under `/v1`, so one adapter covers both.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> ProviderResult<Option<RigMessage>> {
        match message.role {
            Role::System => Ok(None),
            Role::Assistant => Ok(Some(RigMessage::assistant(message.content.clone()))),
            Role::User if message.attachments.is_empty() => {
                Ok(Some(RigMessage::user(message.content.clone())))
            }
            Role::User => {
                let mut parts = Vec::with_capacity(message.attachments.len() + 1);
                if !message.content.trim().is_empty() {
                    parts.push(UserContent::text(message.content.clone()));
                }
                parts.extend(message.attachments.iter().map(Self::image_part));

                let content =
                    OneOrMany::many(parts).map_err(|source| ProviderError::PromptContent {
                        stage: "user-message-parts",
                        details: source.to_string(),
                    })?;
                Ok(Some(RigMessage::User { content }))
            }
        }
    }

    fn image_part(attachment: &ProviderAttachment) -> UserContent {
        let url = attachment.url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            return UserContent::image_url(url, None, None);
        }

        // Browser uploads arrive as data URLs; bare payloads are forwarded as-is.
        match url
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
        {
            Some((mime, data)) => UserContent::image_base64(data, image_media_type(mime), None),
            None => UserContent::image_base64(url, image_media_type(&attachment.content_type), None),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            if let Some(converted) = Self::to_rig_message(message)? {
                messages.push(converted);
            }
        }

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                target: request.target,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped::error(target, error.to_string()));
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventMapped::delta(target, text.text))
            }
            // Only answer text belongs to the timeline.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "provider stream cancelled before opening");
                return;
            }
            opened = Self::open_stream(&config, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        target = ?target,
                        provider_id = %config.provider_id,
                        model_id = %request.model_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    Self::emit_error_event(&event_tx, target, error);
                    return;
                }
            },
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped::done(target));
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI-compatible"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );
        ensure!(
            !request.model_id.trim().is_empty(),
            MissingModelSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        tracing::debug!(
            target = ?request.target,
            provider_id = %self.config.provider_id,
            model_id = %request.model_id,
            message_count = request.messages.len(),
            attachment_count = request.attachment_count(),
            "opening provider stream"
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn image_media_type(mime: &str) -> Option<ImageMediaType> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some(ImageMediaType::PNG),
        "image/jpeg" | "image/jpg" => Some(ImageMediaType::JPEG),
        "image/gif" => Some(ImageMediaType::GIF),
        "image/webp" => Some(ImageMediaType::WEBP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request_with(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new(StreamTarget::new(Uuid::nil(), 1), "llama3", messages)
    }

    #[test]
    fn adapter_requires_api_key() {
        let error = RigProviderAdapter::new(ProviderConfig::new("openai", "  ", ""))
            .err()
            .expect("blank key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let request = request_with(vec![
            ProviderMessage::new(Role::System, "be brief"),
            ProviderMessage::new(Role::User, "hi"),
        ])
        .with_preamble("you are helpful");

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("you are helpful\n\nbe brief")
        );
    }

    #[test]
    fn system_messages_are_not_sent_as_turns() {
        let message = ProviderMessage::new(Role::System, "be brief");
        assert!(matches!(
            RigProviderAdapter::to_rig_message(&message),
            Ok(None)
        ));
    }

    #[test]
    fn user_message_with_images_becomes_multipart() {
        let message = ProviderMessage::new(Role::User, "what is this?").with_attachments(vec![
            ProviderAttachment::new("image/base64", "data:image/png;base64,aGVsbG8="),
        ]);

        match RigProviderAdapter::to_rig_message(&message) {
            Ok(Some(RigMessage::User { content })) => assert_eq!(content.len(), 2),
            other => panic!("expected multipart user message, got {other:?}"),
        }
    }

    #[test]
    fn empty_request_is_rejected_before_spawning() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "key", ""))
            .expect("adapter with key");
        let error = adapter
            .stream_chat(request_with(Vec::new()))
            .err()
            .expect("empty request must fail");
        assert!(matches!(error, ProviderError::EmptyMessageSet { .. }));
    }

    #[test]
    fn recognises_common_image_mime_types() {
        assert!(matches!(
            image_media_type("image/JPEG"),
            Some(ImageMediaType::JPEG)
        ));
        assert!(image_media_type("image/base64").is_none());
    }
}
