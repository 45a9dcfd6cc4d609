//! Chat-session controller: one conversation's timeline, its persistence, the
//! one-shot deep-link submission, and the streaming answer lifecycle.
mod auto_submit;
mod controller;
mod dedup;
mod error;
mod launch;
mod message;
mod navigation;
mod pipeline;

#[cfg(test)]
mod test_support;

pub use auto_submit::{
    AutoSubmitAction, AutoSubmitCoordinator, AutoSubmitPlan, AutoSubmitRejection,
    AutoSubmitState, AutoSubmitTransition, AutoSubmitTransitionResult,
};
pub use controller::{
    Collaborators, ControllerConfig, DEFAULT_SETTLE_DELAY, RuntimeState, TimelineController,
    TimelineUpdate,
};
pub use dedup::dedupe_user_turns;
pub use error::{ControllerError, ControllerResult};
pub use launch::{LaunchParams, MODEL_PARAM, QUERY_PARAM};
pub use message::{Attachment, IMAGE_ATTACHMENT_CONTENT_TYPE, Message, MessageContent, Role};
pub use navigation::{ENTRY_ROUTE, Navigator, session_route};
pub use palaver_storage::{MessageId, SessionId};
pub use pipeline::{
    ActiveSubmission, PipelineEvent, Submission, SubmissionOutcome, SubmissionPipeline,
};
