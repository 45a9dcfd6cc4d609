use crate::dedup::dedupe_user_turns;
use crate::launch::LaunchParams;
use crate::message::{Message, Role};

/// Progress of the one-shot deep-link submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoSubmitState {
    #[default]
    Idle,
    Seeded,
    Settling,
    Submitting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSubmitTransition {
    Seed,
    Settle,
    Submit,
    Finish,
}

/// Rejection reason for illegal auto-submit transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSubmitRejection {
    pub from: AutoSubmitState,
    pub transition: AutoSubmitTransition,
}

pub type AutoSubmitTransitionResult = Result<AutoSubmitState, AutoSubmitRejection>;

impl AutoSubmitState {
    pub fn apply(self, transition: AutoSubmitTransition) -> AutoSubmitTransitionResult {
        use AutoSubmitState as S;
        use AutoSubmitTransition as T;

        match (self, transition) {
            (S::Idle, T::Seed) => Ok(S::Seeded),
            (S::Idle | S::Seeded | S::Submitting, T::Finish) => Ok(S::Done),
            (S::Seeded, T::Settle) => Ok(S::Settling),
            (S::Settling, T::Submit) => Ok(S::Submitting),
            (from, transition) => Err(AutoSubmitRejection { from, transition }),
        }
    }

    /// True while the deep-link question is being seeded or sent.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Seeded | Self::Settling | Self::Submitting)
    }
}

/// What the controller must do after the coordinator inspected the launch.
#[derive(Debug, Clone, PartialEq)]
pub enum AutoSubmitAction {
    /// Nothing to seed; the coordinator is already done.
    Skip,
    /// Replace the timeline; nothing is sent.
    Seed { timeline: Vec<Message> },
    /// Replace the timeline, persist `persist`, then send `prompt` with `model`.
    Submit {
        timeline: Vec<Message>,
        persist: Vec<Message>,
        prompt: String,
        model: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoSubmitPlan {
    /// Model to select before anything else, when none was selected.
    pub select_model: Option<String>,
    pub action: AutoSubmitAction,
}

/// Decides, at most once per mount, whether a deep-link question is sent.
#[derive(Debug, Default)]
pub struct AutoSubmitCoordinator {
    state: AutoSubmitState,
    triggered: bool,
}

impl AutoSubmitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AutoSubmitState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == AutoSubmitState::Done
    }

    pub fn has_triggered(&self) -> bool {
        self.triggered
    }

    pub fn advance(&mut self, transition: AutoSubmitTransition) -> AutoSubmitTransitionResult {
        let next = self.state.apply(transition)?;
        self.state = next;
        Ok(next)
    }

    fn step(&mut self, transition: AutoSubmitTransition) {
        if let Err(rejection) = self.advance(transition) {
            tracing::warn!(?rejection, "ignored auto-submit transition");
        }
    }

    /// Returns `None` on every call after the first.
    pub fn begin(
        &mut self,
        launch: &LaunchParams,
        selected_model: Option<&str>,
        resumed: &[Message],
    ) -> Option<AutoSubmitPlan> {
        if self.triggered {
            return None;
        }
        self.triggered = true;

        let selected_model = selected_model.filter(|model| !model.trim().is_empty());
        let select_model = match selected_model {
            None => launch.initial_model().map(str::to_string),
            Some(_) => None,
        };

        // Without a deep-link question there is nothing to seed, even when the
        // resumed transcript ends in an unanswered user turn.
        let seeds = match launch.seed_message() {
            Some(seed) => {
                let mut seeds = resumed.to_vec();
                seeds.push(seed);
                seeds
            }
            None => Vec::new(),
        };
        if seeds.is_empty() {
            self.step(AutoSubmitTransition::Finish);
            return Some(AutoSubmitPlan {
                select_model,
                action: AutoSubmitAction::Skip,
            });
        }

        let timeline = dedupe_user_turns(seeds);
        self.step(AutoSubmitTransition::Seed);

        let action = match submission_for(&timeline, launch, selected_model) {
            Some((prompt_index, prompt, model)) => AutoSubmitAction::Submit {
                persist: timeline[..=prompt_index].to_vec(),
                timeline,
                prompt,
                model,
            },
            None => {
                self.step(AutoSubmitTransition::Finish);
                AutoSubmitAction::Seed { timeline }
            }
        };

        Some(AutoSubmitPlan {
            select_model,
            action,
        })
    }
}

/// Index and text of the prompt to send, plus the model to send it with.
fn submission_for(
    timeline: &[Message],
    launch: &LaunchParams,
    selected_model: Option<&str>,
) -> Option<(usize, String, String)> {
    // An answered transcript is never re-asked.
    if timeline.iter().any(|message| message.role == Role::Assistant) {
        return None;
    }

    let prompt_index = timeline
        .iter()
        .rposition(|message| message.role == Role::User)?;
    let prompt = timeline[prompt_index].text();
    if prompt.is_empty() {
        return None;
    }

    let model = launch.initial_model().or(selected_model)?;
    Some((prompt_index, prompt, model.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn launch(query: &str) -> LaunchParams {
        LaunchParams::from_query(query)
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(Message::text).collect()
    }

    #[test]
    fn transitions_follow_the_happy_path_only() {
        let state = AutoSubmitState::Idle
            .apply(AutoSubmitTransition::Seed)
            .and_then(|state| state.apply(AutoSubmitTransition::Settle))
            .and_then(|state| state.apply(AutoSubmitTransition::Submit))
            .and_then(|state| state.apply(AutoSubmitTransition::Finish));
        assert_eq!(state, Ok(AutoSubmitState::Done));

        assert_eq!(
            AutoSubmitState::Idle.apply(AutoSubmitTransition::Submit),
            Err(AutoSubmitRejection {
                from: AutoSubmitState::Idle,
                transition: AutoSubmitTransition::Submit,
            })
        );
        assert!(AutoSubmitState::Done.apply(AutoSubmitTransition::Seed).is_err());
        assert!(AutoSubmitState::Settling.apply(AutoSubmitTransition::Finish).is_err());
    }

    #[test]
    fn empty_launch_and_transcript_finishes_immediately() {
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&LaunchParams::default(), None, &[])
            .expect("first call plans");
        assert_eq!(plan.action, AutoSubmitAction::Skip);
        assert!(coordinator.is_done());
    }

    #[test]
    fn deep_link_with_model_submits_the_question() {
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi&model=m1"), None, &[])
            .expect("first call plans");

        assert_eq!(plan.select_model.as_deref(), Some("m1"));
        match plan.action {
            AutoSubmitAction::Submit {
                timeline,
                persist,
                prompt,
                model,
            } => {
                assert_eq!(texts(&timeline), vec!["hi"]);
                assert_eq!(persist, timeline);
                assert_eq!(prompt, "hi");
                assert_eq!(model, "m1");
            }
            other => panic!("expected submit, got {other:?}"),
        }
        assert_eq!(coordinator.state(), AutoSubmitState::Seeded);
    }

    #[test]
    fn answered_transcript_is_not_resent() {
        let resumed = vec![Message::user("hi"), Message::assistant("hello")];
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi&model=m1"), None, &resumed)
            .expect("first call plans");

        assert_eq!(
            plan.action,
            AutoSubmitAction::Seed {
                timeline: resumed.clone()
            }
        );
        assert!(coordinator.is_done());
    }

    #[test]
    fn missing_model_seeds_without_sending() {
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi"), None, &[])
            .expect("first call plans");
        assert!(matches!(plan.action, AutoSubmitAction::Seed { .. }));
        assert_eq!(plan.select_model, None);
        assert!(coordinator.is_done());
    }

    #[test]
    fn selected_model_is_used_and_kept_when_link_has_none() {
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi"), Some("chosen"), &[])
            .expect("first call plans");
        assert_eq!(plan.select_model, None);
        assert!(matches!(
            plan.action,
            AutoSubmitAction::Submit { ref model, .. } if model == "chosen"
        ));
    }

    #[test]
    fn link_model_wins_for_sending_but_does_not_override_selection() {
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi&model=linked"), Some("chosen"), &[])
            .expect("first call plans");
        assert_eq!(plan.select_model, None);
        assert!(matches!(
            plan.action,
            AutoSubmitAction::Submit { ref model, .. } if model == "linked"
        ));
    }

    #[test]
    fn unanswered_resumed_question_is_sent_once_and_prefix_is_persisted() {
        let resumed = vec![Message::system("be brief"), Message::user("hi")];
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&launch("q=hi"), Some("m1"), &resumed)
            .expect("first call plans");
        match plan.action {
            AutoSubmitAction::Submit {
                timeline, persist, ..
            } => {
                assert_eq!(texts(&timeline), vec!["be brief", "hi"]);
                assert_eq!(persist, resumed);
            }
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn resumed_unanswered_turn_without_link_is_left_alone() {
        let resumed = vec![Message::user("hi")];
        let mut coordinator = AutoSubmitCoordinator::new();
        let plan = coordinator
            .begin(&LaunchParams::default(), Some("m1"), &resumed)
            .expect("first call plans");
        assert_eq!(plan.action, AutoSubmitAction::Skip);
        assert!(coordinator.is_done());
    }

    #[test]
    fn begin_seeds_through_the_transition_table() {
        let mut coordinator = AutoSubmitCoordinator::new();
        coordinator
            .begin(&launch("q=hi&model=m1"), None, &[])
            .expect("first call plans");

        assert_eq!(
            coordinator.advance(AutoSubmitTransition::Seed),
            Err(AutoSubmitRejection {
                from: AutoSubmitState::Seeded,
                transition: AutoSubmitTransition::Seed,
            })
        );
        assert_eq!(
            coordinator.advance(AutoSubmitTransition::Settle),
            Ok(AutoSubmitState::Settling)
        );
        assert_eq!(
            coordinator.advance(AutoSubmitTransition::Submit),
            Ok(AutoSubmitState::Submitting)
        );
        assert_eq!(
            coordinator.advance(AutoSubmitTransition::Finish),
            Ok(AutoSubmitState::Done)
        );
    }

    #[test]
    fn begin_is_one_shot() {
        let mut coordinator = AutoSubmitCoordinator::new();
        assert!(coordinator.begin(&launch("q=hi&model=m1"), None, &[]).is_some());
        assert!(coordinator.begin(&launch("q=hi&model=m1"), None, &[]).is_none());
        assert!(coordinator.has_triggered());
    }
}
