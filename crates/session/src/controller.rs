use std::sync::Arc;
use std::time::Duration;

use palaver_llm::{LlmProvider, StreamTarget};
use palaver_storage::{MessageId, MessageRecord, SessionId, SessionStore};
use snafu::ResultExt;

use crate::auto_submit::{
    AutoSubmitAction, AutoSubmitCoordinator, AutoSubmitState, AutoSubmitTransition,
};
use crate::error::{
    ControllerResult, ModelNotSelectedSnafu, NothingToReloadSnafu, StorageSnafu,
    SubmissionInFlightSnafu,
};
use crate::launch::LaunchParams;
use crate::message::{Attachment, Message, Role, to_records};
use crate::navigation::{ENTRY_ROUTE, Navigator, session_route};
use crate::pipeline::{
    ActiveSubmission, PipelineEvent, Submission, SubmissionOutcome, SubmissionPipeline,
};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Pause between seeding a deep-link question and sending it.
    pub settle_delay: Duration,
    pub max_tokens: Option<u64>,
    /// Model selected at mount, before any deep-link override.
    pub default_model: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            max_tokens: None,
            default_model: None,
        }
    }
}

/// Capabilities the controller is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub navigator: Arc<dyn Navigator>,
}

/// Snapshot of the per-session runtime flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub is_streaming: bool,
    pub is_submitting_initial: bool,
    pub auto_submit_completed: bool,
    pub pending_attachments: Option<Vec<String>>,
    pub selected_model: Option<String>,
}

/// Observable progress produced by [`TimelineController::next_update`].
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineUpdate {
    Chunk(String),
    Settled(SubmissionOutcome),
}

struct InFlight {
    submission: ActiveSubmission,
    // Created lazily on the first chunk.
    assistant_id: Option<MessageId>,
}

/// Owns one session's timeline and drives submissions against it.
///
/// All mutation goes through `&mut self`, so store writes for the session happen
/// in the order the operations were issued.
pub struct TimelineController {
    session_id: SessionId,
    launch: LaunchParams,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    pipeline: SubmissionPipeline,
    config: ControllerConfig,
    timeline: Vec<Message>,
    input: String,
    selected_model: Option<String>,
    pending_attachments: Option<Vec<String>>,
    auto_submit: AutoSubmitCoordinator,
    in_flight: Option<InFlight>,
    // Finished answer whose persistence has not completed yet.
    finishing: Option<Message>,
    next_sequence: u64,
}

impl TimelineController {
    /// Loads the stored transcript and captures the launch parameters.
    pub async fn mount(
        session_id: SessionId,
        launch: LaunchParams,
        collaborators: Collaborators,
        config: ControllerConfig,
    ) -> ControllerResult<Self> {
        let Collaborators {
            store,
            provider,
            navigator,
        } = collaborators;

        let records = store
            .get(session_id)
            .await
            .context(StorageSnafu { stage: "mount-load" })?;
        let timeline = records.into_iter().map(Message::from).collect::<Vec<_>>();

        tracing::info!(
            %session_id,
            message_count = timeline.len(),
            has_initial_query = launch.initial_query().is_some(),
            "mounted session"
        );

        Ok(Self {
            session_id,
            launch,
            store,
            navigator,
            pipeline: SubmissionPipeline::new(provider, config.max_tokens),
            selected_model: normalize_model(config.default_model.clone()),
            config,
            timeline,
            input: String::new(),
            pending_attachments: None,
            auto_submit: AutoSubmitCoordinator::new(),
            in_flight: None,
            finishing: None,
            next_sequence: 0,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.timeline
    }

    pub fn launch(&self) -> &LaunchParams {
        &self.launch
    }

    /// True until the live submission has reached a settled outcome.
    pub fn is_streaming(&self) -> bool {
        self.in_flight.is_some() || self.finishing.is_some()
    }

    /// Busy while streaming or until the deep-link handling has finished.
    pub fn is_loading(&self) -> bool {
        self.is_streaming() || !self.auto_submit.is_done()
    }

    /// Streaming, but no answer text has arrived yet.
    pub fn is_awaiting_response(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.assistant_id.is_none())
    }

    pub fn auto_submit_state(&self) -> AutoSubmitState {
        self.auto_submit.state()
    }

    pub fn runtime_state(&self) -> RuntimeState {
        RuntimeState {
            is_streaming: self.is_streaming(),
            is_submitting_initial: self.auto_submit.state().is_in_progress(),
            auto_submit_completed: self.auto_submit.is_done(),
            pending_attachments: self.pending_attachments.clone(),
            selected_model: self.selected_model.clone(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    pub fn select_model(&mut self, model: impl Into<String>) {
        self.selected_model = normalize_model(Some(model.into()));
        tracing::info!(
            session_id = %self.session_id,
            model = self.selected_model.as_deref().unwrap_or(""),
            "selected model"
        );
    }

    /// Images attached to the next submission. An empty list clears them.
    pub fn set_pending_attachments(&mut self, encoded_images: Vec<String>) {
        self.pending_attachments = (!encoded_images.is_empty()).then_some(encoded_images);
    }

    pub fn pending_attachments(&self) -> Option<&[String]> {
        self.pending_attachments.as_deref()
    }

    /// Seeds the timeline from the resumed transcript and the deep-link question,
    /// then sends the question once if it is still unanswered.
    ///
    /// Later calls are no-ops.
    pub async fn auto_submit(&mut self) -> ControllerResult<AutoSubmitState> {
        let Some(plan) =
            self.auto_submit
                .begin(&self.launch, self.selected_model.as_deref(), &self.timeline)
        else {
            return Ok(self.auto_submit.state());
        };

        if let Some(model) = plan.select_model {
            self.select_model(model);
        }

        match plan.action {
            AutoSubmitAction::Skip => {}
            AutoSubmitAction::Seed { timeline } => {
                self.timeline = timeline;
            }
            AutoSubmitAction::Submit {
                timeline,
                persist,
                prompt,
                model,
            } => {
                self.timeline = timeline;
                if let Err(error) = self.write_transcript(&persist, "auto-submit-seed").await {
                    tracing::error!(
                        session_id = %self.session_id,
                        "failed to persist deep-link question: {error}"
                    );
                }
                self.input = prompt.clone();

                self.transition_auto_submit(AutoSubmitTransition::Settle);
                tokio::time::sleep(self.config.settle_delay).await;
                self.transition_auto_submit(AutoSubmitTransition::Submit);

                tracing::info!(
                    session_id = %self.session_id,
                    %model,
                    "auto-submitting deep-link question"
                );
                if let Err(error) = self.start_submission(prompt, model) {
                    self.transition_auto_submit(AutoSubmitTransition::Finish);
                    return Err(error);
                }
            }
        }

        Ok(self.auto_submit.state())
    }

    /// Appends a user turn, persists it, and starts streaming the answer.
    ///
    /// Without a selected model nothing changes and nothing is written.
    pub async fn submit_turn(&mut self, draft: impl Into<String>) -> ControllerResult<()> {
        let draft = draft.into();
        self.ensure_idle("submit")?;
        let Some(model) = self.selected_model.clone() else {
            tracing::warn!(session_id = %self.session_id, "submit rejected: no model selected");
            return ModelNotSelectedSnafu { stage: "submit" }.fail();
        };

        let attachments = self
            .pending_attachments
            .iter()
            .flatten()
            .map(Attachment::image)
            .collect::<Vec<_>>();
        let mut next_timeline = self.timeline.clone();
        next_timeline.push(Message::user(draft.as_str()).with_attachments(attachments));

        self.write_transcript(&next_timeline, "submit-persist")
            .await?;
        self.timeline = next_timeline;
        self.navigator
            .navigate_replace(&session_route(self.session_id));

        self.start_submission(draft, model)
    }

    /// Drops the trailing message and regenerates the answer to the last user turn.
    pub async fn reload(&mut self) -> ControllerResult<()> {
        self.ensure_idle("reload")?;
        let Some(model) = self.selected_model.clone() else {
            tracing::warn!(session_id = %self.session_id, "reload rejected: no model selected");
            return ModelNotSelectedSnafu { stage: "reload" }.fail();
        };

        let mut truncated = self.timeline.clone();
        if truncated.pop().is_none() {
            return NothingToReloadSnafu {
                stage: "reload",
                session_id: self.session_id,
            }
            .fail();
        }
        let Some(prompt) = truncated
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(Message::text)
        else {
            return NothingToReloadSnafu {
                stage: "reload",
                session_id: self.session_id,
            }
            .fail();
        };

        self.write_transcript(&truncated, "reload-persist").await?;
        self.timeline = truncated;
        self.start_submission(prompt, model)
    }

    /// Removes the last message and persists the shortened timeline.
    pub async fn remove_latest(&mut self) -> ControllerResult<Option<Message>> {
        self.ensure_idle("remove-latest")?;
        let mut truncated = self.timeline.clone();
        let Some(removed) = truncated.pop() else {
            return Ok(None);
        };

        self.write_transcript(&truncated, "remove-latest-persist")
            .await?;
        self.timeline = truncated;
        Ok(Some(removed))
    }

    /// Cancels the live submission and keeps whatever answer text arrived.
    ///
    /// An answer that already finished is saved instead. Returns `None` when nothing
    /// was streaming.
    pub async fn stop(&mut self) -> Option<SubmissionOutcome> {
        if self.finishing.is_some() {
            return self.finish().await;
        }
        let mut in_flight = self.in_flight.take()?;
        in_flight.submission.cancel();
        drop(in_flight);

        tracing::info!(session_id = %self.session_id, "stopped submission");
        let timeline = self.timeline.clone();
        if let Err(error) = self.write_transcript(&timeline, "stop-persist").await {
            tracing::error!(
                session_id = %self.session_id,
                "failed to persist stopped transcript: {error}"
            );
        }
        self.complete_auto_submit();
        Some(SubmissionOutcome::Stopped)
    }

    /// Waits for the next event of the live submission and applies it.
    ///
    /// Returns `None` when idle. Cancel-safe: a finished answer is recorded before
    /// it is persisted, and a dropped call resumes saving it on the next call.
    pub async fn next_update(&mut self) -> Option<TimelineUpdate> {
        if self.finishing.is_none() {
            let in_flight = self.in_flight.as_mut()?;
            let event = in_flight.submission.next_event().await?;
            match event {
                PipelineEvent::Chunk(chunk) => {
                    self.append_chunk(&chunk);
                    return Some(TimelineUpdate::Chunk(chunk));
                }
                PipelineEvent::Failed(message) => {
                    return Some(TimelineUpdate::Settled(self.fail(message)));
                }
                PipelineEvent::Finished => self.record_finished(),
            }
        }
        self.finish().await.map(TimelineUpdate::Settled)
    }

    /// Drives the live submission to its terminal outcome.
    pub async fn run_until_settled(&mut self) -> Option<SubmissionOutcome> {
        while let Some(update) = self.next_update().await {
            if let TimelineUpdate::Settled(outcome) = update {
                return Some(outcome);
            }
        }
        None
    }

    fn ensure_idle(&self, stage: &'static str) -> ControllerResult<()> {
        if self.is_streaming() {
            return SubmissionInFlightSnafu {
                stage,
                session_id: self.session_id,
            }
            .fail();
        }
        Ok(())
    }

    fn start_submission(&mut self, draft: String, model: String) -> ControllerResult<()> {
        self.next_sequence = self.next_sequence.saturating_add(1);
        let target = StreamTarget::new(self.session_id.as_uuid(), self.next_sequence);
        let attachments = self
            .pending_attachments
            .iter()
            .flatten()
            .map(Attachment::image)
            .collect();

        let submission = self.pipeline.start(Submission {
            target,
            timeline: self.timeline.clone(),
            draft,
            attachments,
            model,
        })?;

        self.pending_attachments = None;
        self.input.clear();
        self.in_flight = Some(InFlight {
            submission,
            assistant_id: None,
        });
        Ok(())
    }

    fn append_chunk(&mut self, chunk: &str) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };

        let assistant_id = match in_flight.assistant_id {
            Some(id) => id,
            None => {
                let message = Message::assistant("");
                let id = message.id;
                self.timeline.push(message);
                in_flight.assistant_id = Some(id);
                id
            }
        };

        if let Some(message) = self
            .timeline
            .iter_mut()
            .rev()
            .find(|message| message.id == assistant_id)
        {
            message.push_text(chunk);
        }
    }

    fn record_finished(&mut self) {
        let assistant_id = self
            .in_flight
            .take()
            .and_then(|in_flight| in_flight.assistant_id);
        let assistant = match assistant_id.and_then(|id| self.find_message(id)) {
            Some(message) => message.clone(),
            None => {
                let message = Message::assistant("");
                self.timeline.push(message.clone());
                message
            }
        };
        self.finishing = Some(assistant);
    }

    async fn finish(&mut self) -> Option<SubmissionOutcome> {
        let assistant = self.finishing.clone()?;
        if let Err(error) = self.append_to_stored(&assistant).await {
            tracing::error!(
                session_id = %self.session_id,
                "failed to persist assistant answer: {error}"
            );
        }
        self.finishing = None;

        tracing::info!(
            session_id = %self.session_id,
            answer_len = assistant.text().len(),
            "submission finished"
        );
        self.navigator
            .navigate_replace(&session_route(self.session_id));
        self.complete_auto_submit();
        Some(SubmissionOutcome::Finished(assistant))
    }

    fn fail(&mut self, message: String) -> SubmissionOutcome {
        if let Some(assistant_id) = self
            .in_flight
            .take()
            .and_then(|in_flight| in_flight.assistant_id)
        {
            self.timeline.retain(|entry| entry.id != assistant_id);
        }

        tracing::error!(session_id = %self.session_id, "submission failed: {message}");
        self.navigator.navigate_replace(ENTRY_ROUTE);
        self.complete_auto_submit();
        SubmissionOutcome::Failed(message)
    }

    fn find_message(&self, id: MessageId) -> Option<&Message> {
        self.timeline.iter().rev().find(|message| message.id == id)
    }

    /// Merges the answer with whatever the store already holds for this session.
    ///
    /// Repeating the merge replaces the stored answer instead of adding a copy.
    async fn append_to_stored(&self, assistant: &Message) -> ControllerResult<()> {
        let mut stored = self
            .store
            .get(self.session_id)
            .await
            .context(StorageSnafu {
                stage: "finish-load",
            })?;
        let record = MessageRecord::from(assistant);
        match stored.iter_mut().find(|stored| stored.id == record.id) {
            Some(existing) => *existing = record,
            None => stored.push(record),
        }
        self.store
            .put(self.session_id, stored)
            .await
            .context(StorageSnafu {
                stage: "finish-persist",
            })
    }

    async fn write_transcript(
        &self,
        messages: &[Message],
        stage: &'static str,
    ) -> ControllerResult<()> {
        self.store
            .put(self.session_id, to_records(messages))
            .await
            .context(StorageSnafu { stage })
    }

    fn transition_auto_submit(&mut self, transition: AutoSubmitTransition) {
        if let Err(rejection) = self.auto_submit.advance(transition) {
            tracing::warn!(
                session_id = %self.session_id,
                "ignored auto-submit transition: {rejection:?}"
            );
        }
    }

    fn complete_auto_submit(&mut self) {
        if self.auto_submit.state() == AutoSubmitState::Submitting {
            self.transition_auto_submit(AutoSubmitTransition::Finish);
        }
    }
}

fn normalize_model(model: Option<String>) -> Option<String> {
    model
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
}
