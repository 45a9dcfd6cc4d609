use std::sync::Arc;

use palaver_llm::{
    LlmProvider, ProviderEventStream, ProviderMessage, StreamEventPayload, StreamRequest,
    StreamTarget,
};
use tokio::task::JoinHandle;

use crate::error::{ControllerResult, ModelNotSelectedSnafu};
use crate::message::{Attachment, Message, to_provider_attachment, to_provider_role};

/// Everything one submit/reload hands to the transport.
#[derive(Debug, Clone)]
pub struct Submission {
    pub target: StreamTarget,
    /// Timeline as it stood when the submission was made.
    pub timeline: Vec<Message>,
    /// Prompt text; appended as a user turn unless it already ends the timeline.
    pub draft: String,
    /// Images carried by the final user turn.
    pub attachments: Vec<Attachment>,
    pub model: String,
}

/// Event surfaced to the controller while a submission is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Chunk(String),
    Finished,
    Failed(String),
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Finished(Message),
    Failed(String),
    Stopped,
}

/// Turns submissions into provider streams.
#[derive(Clone)]
pub struct SubmissionPipeline {
    provider: Arc<dyn LlmProvider>,
    max_tokens: Option<u64>,
}

impl SubmissionPipeline {
    pub fn new(provider: Arc<dyn LlmProvider>, max_tokens: Option<u64>) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn build_request(&self, submission: &Submission) -> StreamRequest {
        let mut messages = submission
            .timeline
            .iter()
            .filter(|message| !message.content.is_blank() || !message.attachments.is_empty())
            .map(|message| {
                ProviderMessage::new(to_provider_role(message.role), message.text())
                    .with_attachments(
                        message
                            .attachments
                            .iter()
                            .map(to_provider_attachment)
                            .collect(),
                    )
            })
            .collect::<Vec<_>>();

        let ends_with_draft = messages.last().is_some_and(|last| {
            last.role == palaver_llm::Role::User && last.content == submission.draft
        });
        if !ends_with_draft {
            messages.push(ProviderMessage::new(
                palaver_llm::Role::User,
                submission.draft.clone(),
            ));
        }

        if let Some(prompt) = messages.last_mut() {
            for attachment in submission.attachments.iter().map(to_provider_attachment) {
                if !prompt.attachments.contains(&attachment) {
                    prompt.attachments.push(attachment);
                }
            }
        }

        let request = StreamRequest::new(submission.target, submission.model.clone(), messages);
        match self.max_tokens {
            Some(max_tokens) => request.with_max_tokens(max_tokens),
            None => request,
        }
    }

    /// Opens the stream and spawns its worker.
    ///
    /// Transport failures do not error here; they surface as the submission's
    /// terminal [`PipelineEvent::Failed`].
    pub fn start(&self, submission: Submission) -> ControllerResult<ActiveSubmission> {
        if submission.model.trim().is_empty() {
            return ModelNotSelectedSnafu {
                stage: "pipeline-start",
            }
            .fail();
        }

        let request = self.build_request(&submission);
        tracing::debug!(
            session_id = %submission.target.session_id,
            sequence = submission.target.sequence,
            model = %submission.model,
            provider = self.provider.id(),
            message_count = request.messages.len(),
            attachment_count = request.attachment_count(),
            "starting submission"
        );

        match self.provider.stream_chat(request) {
            Ok(handle) => Ok(ActiveSubmission {
                target: submission.target,
                stream: Some(handle.stream),
                worker: Some(tokio::spawn(handle.worker)),
                pending_failure: None,
                terminated: false,
            }),
            Err(error) => {
                tracing::warn!(
                    session_id = %submission.target.session_id,
                    "provider refused submission: {error}"
                );
                Ok(ActiveSubmission {
                    target: submission.target,
                    stream: None,
                    worker: None,
                    pending_failure: Some(error.to_string()),
                    terminated: false,
                })
            }
        }
    }
}

/// One live submission: zero or more chunks, then exactly one terminal event.
pub struct ActiveSubmission {
    target: StreamTarget,
    stream: Option<ProviderEventStream>,
    worker: Option<JoinHandle<()>>,
    pending_failure: Option<String>,
    terminated: bool,
}

impl ActiveSubmission {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Next event for this submission; `None` once the terminal event was returned.
    ///
    /// Cancel-safe: dropping the future loses no event.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        if self.terminated {
            return None;
        }

        if let Some(message) = self.pending_failure.take() {
            return Some(self.terminate(PipelineEvent::Failed(message)));
        }

        let Some(stream) = self.stream.as_mut() else {
            return Some(self.terminate(PipelineEvent::Failed(
                "submission has no provider stream".to_string(),
            )));
        };

        loop {
            let Some(event) = stream.recv().await else {
                return Some(self.terminate(PipelineEvent::Failed(
                    "provider stream ended before a terminal event".to_string(),
                )));
            };

            if event.target != self.target {
                tracing::warn!(
                    expected_sequence = self.target.sequence,
                    received_sequence = event.target.sequence,
                    "dropping stale stream event"
                );
                continue;
            }

            return Some(match event.payload {
                StreamEventPayload::Delta(chunk) => PipelineEvent::Chunk(chunk),
                StreamEventPayload::Done => self.terminate(PipelineEvent::Finished),
                StreamEventPayload::Error(message) => {
                    self.terminate(PipelineEvent::Failed(message))
                }
            });
        }
    }

    /// Signals the transport to stop. Returns false when nothing was live.
    pub fn cancel(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        self.stream
            .as_mut()
            .map(ProviderEventStream::cancel)
            .unwrap_or(false)
    }

    fn terminate(&mut self, event: PipelineEvent) -> PipelineEvent {
        self.terminated = true;
        event
    }
}

impl Drop for ActiveSubmission {
    fn drop(&mut self) {
        self.stream = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, ScriptedProvider};
    use pretty_assertions::assert_eq;

    fn target(sequence: u64) -> StreamTarget {
        StreamTarget::new(palaver_storage::SessionId::new_v7().as_uuid(), sequence)
    }

    fn submission(timeline: Vec<Message>, draft: &str) -> Submission {
        Submission {
            target: target(1),
            timeline,
            draft: draft.to_string(),
            attachments: Vec::new(),
            model: "m1".to_string(),
        }
    }

    async fn drain(active: &mut ActiveSubmission) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = active.next_event().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn draft_is_not_duplicated_when_it_already_ends_the_timeline() {
        let pipeline = SubmissionPipeline::new(ScriptedProvider::arc(), Some(256));
        let request = pipeline.build_request(&submission(vec![Message::user("hi")], "hi"));

        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, Some(256));
        assert_eq!(request.model_id, "m1");
    }

    #[test]
    fn draft_is_appended_after_an_assistant_turn() {
        let pipeline = SubmissionPipeline::new(ScriptedProvider::arc(), None);
        let request = pipeline.build_request(&submission(
            vec![Message::user("hi"), Message::assistant("hello")],
            "again",
        ));

        let contents = request
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["hi", "hello", "again"]);
    }

    #[test]
    fn attachments_land_on_the_final_user_turn_once() {
        let pipeline = SubmissionPipeline::new(ScriptedProvider::arc(), None);
        let image = Attachment::image("aGk=");
        let mut request_input = submission(
            vec![Message::user("look").with_attachments(vec![image.clone()])],
            "look",
        );
        request_input.attachments = vec![image];

        let request = pipeline.build_request(&request_input);
        assert_eq!(request.attachment_count(), 1);
        assert_eq!(
            request.messages[0].attachments[0].content_type,
            crate::message::IMAGE_ATTACHMENT_CONTENT_TYPE
        );
    }

    #[test]
    fn blank_model_is_rejected() {
        let pipeline = SubmissionPipeline::new(ScriptedProvider::arc(), None);
        let mut input = submission(Vec::new(), "hi");
        input.model = "  ".to_string();
        assert!(pipeline.start(input).is_err());
    }

    #[tokio::test]
    async fn reply_yields_chunks_then_one_terminal_event() {
        let provider = ScriptedProvider::with_scripts([Script::reply(["hel", "lo"])]);
        let pipeline = SubmissionPipeline::new(provider, None);
        let mut active = pipeline
            .start(submission(Vec::new(), "hi"))
            .expect("submission starts");

        assert_eq!(
            drain(&mut active).await,
            vec![
                PipelineEvent::Chunk("hel".to_string()),
                PipelineEvent::Chunk("lo".to_string()),
                PipelineEvent::Finished,
            ]
        );
        assert!(active.is_terminated());
    }

    #[tokio::test]
    async fn refused_stream_fails_without_chunks() {
        let provider = ScriptedProvider::with_scripts([Script::Refuse]);
        let pipeline = SubmissionPipeline::new(provider, None);
        let mut active = pipeline
            .start(submission(Vec::new(), "hi"))
            .expect("refusal surfaces as an event");

        let events = drain(&mut active).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PipelineEvent::Failed(_)));
    }

    #[tokio::test]
    async fn cancelling_ends_the_submission() {
        let provider = ScriptedProvider::with_scripts([Script::hang(["par"])]);
        let pipeline = SubmissionPipeline::new(provider, None);
        let mut active = pipeline
            .start(submission(Vec::new(), "hi"))
            .expect("submission starts");

        assert_eq!(
            active.next_event().await,
            Some(PipelineEvent::Chunk("par".to_string()))
        );
        assert!(active.cancel());
        assert!(!active.cancel());
        assert_eq!(active.next_event().await, None);
    }
}
