//! Single-session agent loop.
//!
//! ```text
//! Init ─navigate─► Perceiving ─► Deciding ─┬─ Answer ──────────► Terminated
//!                      ▲                   ├─ no action ─┐
//!                      │                   └─ action ─► Executing
//!                      └────────────────────────────────┴─────┘
//! ```
//!
//! Every turn perceives afresh: element indices are only resolved against the
//! view the model was shown in that same turn. The loop never writes
//! `result.json`; it returns a [`LoopOutcome`] and the session runner
//! persists it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::action::{Action, Verdict, parse_response};
use crate::config;
use crate::conversation::{Content, Conversation};
use crate::driver::{PerceivedView, UiDriver};
use crate::session::{SessionDir, TurnRecord};
use crate::vlm::DecisionService;

/// Elements listed in the text part of each user turn
pub const DEFAULT_ELEMENT_LIMIT: usize = 40;

const NO_ACTION_HINT: &str = "Your previous reply contained no valid `Action:` line. \
Reply with `Thought:` followed by exactly one `Action:` line using the listed syntax.";

/// System prompt for the testing agent, with the turn budget filled in.
pub fn system_prompt(max_turns: usize) -> String {
    format!(
        "You are a professional web testing robot. You must complete a test task to verify a website's functionality.

Each turn you receive a screenshot of the page. Every interactive element has a red number label at its top-left corner, and the same elements are listed as text.

Available actions:
1. Click [label] - click an element
2. Type [label]; [content] - type content into an input and submit it
3. Scroll [label or WINDOW]; [up or down] - scroll the page or an element
4. KeyPress [key] - press a key (ArrowUp, ArrowDown, ArrowLeft, ArrowRight, Enter, Space, Escape, Tab, or a single character such as r)
5. Wait - wait 5 seconds
6. GoBack - go back to the previous page
7. ANSWER; [YES/NO/PARTIAL] - give the test verdict

Rules:
- Perform exactly one action per reply
- Check the screenshot carefully and pick the right label
- Do not repeat the same ineffective action
- You must give the verdict with ANSWER within {max_turns} interactions
- For games, use KeyPress to test keyboard controls

Reply format (strict):
Thought: {{your analysis}}
Action: {{the chosen action}}
"
    )
}

fn first_turn_text(task: &str, expected: &str, max_turns: usize) -> String {
    format!(
        "Test task: {task}

Expected result: {expected}

Instructions:
- Operate the page like a real user to test the feature
- Watch how the page changes after each action
- You must answer within {max_turns} interactions

When the test is done, answer with:
- ANSWER; YES - the expected result is fully achieved
- ANSWER; NO - the expected result is not achieved
- ANSWER; PARTIAL - the expected result is partially achieved"
    )
}

const FOLLOW_UP_TEXT: &str =
    "The action has been executed. Observe the current screenshot, analyse the result and decide the next step.";

/// Settle pauses between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub after_navigate: Duration,
    pub after_overlay_removal: Duration,
    /// After click, type and scroll
    pub after_interaction: Duration,
    pub after_key_press: Duration,
    pub after_go_back: Duration,
    pub wait: Duration,
    /// Before every decision request except the first
    pub before_request: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            after_navigate: Duration::from_secs(3),
            after_overlay_removal: Duration::from_millis(300),
            after_interaction: Duration::from_secs(1),
            after_key_press: Duration::from_millis(500),
            after_go_back: Duration::from_secs(2),
            wait: Duration::from_secs(5),
            before_request: Duration::from_secs(2),
        }
    }
}

impl Pacing {
    /// No pauses at all.
    pub fn none() -> Self {
        Self {
            after_navigate: Duration::ZERO,
            after_overlay_removal: Duration::ZERO,
            after_interaction: Duration::ZERO,
            after_key_press: Duration::ZERO,
            after_go_back: Duration::ZERO,
            wait: Duration::ZERO,
            before_request: Duration::ZERO,
        }
    }

    fn after(&self, action: &Action) -> Duration {
        match action {
            Action::Click { .. } | Action::Type { .. } | Action::Scroll { .. } => self.after_interaction,
            Action::KeyPress { .. } => self.after_key_press,
            Action::GoBack => self.after_go_back,
            Action::Wait => self.wait,
            Action::Answer { .. } => Duration::ZERO,
        }
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Turn budget; exhausting it yields `TIMEOUT`
    pub max_turns: usize,
    /// Retained non-system conversation turns
    pub history_limit: usize,
    pub element_limit: usize,
    pub pacing: Pacing,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let cfg = &config::get().agent;
        Self {
            max_turns: cfg.max_turns,
            history_limit: cfg.history_limit,
            element_limit: DEFAULT_ELEMENT_LIMIT,
            pacing: Pacing::default(),
        }
    }
}

impl AgentConfig {
    pub fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub verdict: Verdict,
    pub turns_used: usize,
    pub error: Option<String>,
}

impl LoopOutcome {
    fn judged(verdict: Verdict, turns_used: usize) -> Self {
        Self {
            verdict,
            turns_used,
            error: None,
        }
    }

    fn failed(turns_used: usize, error: String) -> Self {
        Self {
            verdict: Verdict::Error,
            turns_used,
            error: Some(error),
        }
    }
}

enum State {
    Init,
    Perceiving { turn: usize },
    Deciding { turn: usize, view: PerceivedView },
    Executing {
        turn: usize,
        view: PerceivedView,
        action: Action,
        response: String,
    },
    Terminated(LoopOutcome),
}

/// Drives one session to a verdict.
pub struct AgentLoop<'a> {
    driver: &'a mut dyn UiDriver,
    service: &'a dyn DecisionService,
    session: &'a SessionDir,
    config: &'a AgentConfig,
    conversation: Conversation,
    /// Feedback to prepend to the next user turn
    note: Option<String>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        driver: &'a mut dyn UiDriver,
        service: &'a dyn DecisionService,
        session: &'a SessionDir,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            driver,
            service,
            session,
            config,
            conversation: Conversation::new(system_prompt(config.max_turns), config.history_limit),
            note: None,
        }
    }

    pub async fn run(mut self, url: &str, task: &str, expected: &str) -> LoopOutcome {
        let mut state = State::Init;
        loop {
            state = match state {
                State::Init => self.start(url).await,
                State::Perceiving { turn } => self.perceive(turn).await,
                State::Deciding { turn, view } => self.decide(turn, view, task, expected).await,
                State::Executing {
                    turn,
                    view,
                    action,
                    response,
                } => self.execute(turn, &view, action, response).await,
                State::Terminated(outcome) => {
                    info!(
                        session = %self.session.id,
                        verdict = %outcome.verdict,
                        turns = outcome.turns_used,
                        "session finished"
                    );
                    return outcome;
                }
            };
        }
    }

    async fn start(&mut self, url: &str) -> State {
        info!(session = %self.session.id, url, "opening target");
        if let Err(e) = self.driver.navigate(url).await {
            return State::Terminated(LoopOutcome::failed(0, e.to_string()));
        }
        pause(self.config.pacing.after_navigate).await;
        State::Perceiving { turn: 1 }
    }

    async fn perceive(&mut self, turn: usize) -> State {
        if turn > self.config.max_turns {
            warn!(session = %self.session.id, max_turns = self.config.max_turns, "turn budget exhausted");
            return State::Terminated(LoopOutcome::judged(Verdict::Timeout, self.config.max_turns));
        }
        info!(session = %self.session.id, turn, max_turns = self.config.max_turns, "perceiving");
        let view = match self.driver.perceive().await {
            Ok(view) => view,
            Err(e) => return State::Terminated(LoopOutcome::failed(turn, format!("perception failed: {}", e))),
        };
        if let Err(e) = self.session.write_screenshot(turn, &view.screenshot) {
            return State::Terminated(LoopOutcome::failed(turn, e.to_string()));
        }
        State::Deciding { turn, view }
    }

    async fn decide(&mut self, turn: usize, view: PerceivedView, task: &str, expected: &str) -> State {
        let mut text = if turn == 1 {
            first_turn_text(task, expected, self.config.max_turns)
        } else {
            FOLLOW_UP_TEXT.to_string()
        };
        if let Some(note) = self.note.take() {
            text.push_str("\n\n");
            text.push_str(&note);
        }
        text.push_str("\n\n");
        text.push_str(&view.describe(self.config.element_limit));
        self.conversation.push_user(Content::TextWithImage {
            text,
            png: Arc::new(view.screenshot.clone()),
        });

        if turn > 1 {
            pause(self.config.pacing.before_request).await;
        }
        let response = match self.service.complete(&self.conversation).await {
            Ok(response) => response,
            Err(e) => {
                let error = format!("decision service failed: {}", e);
                self.record(turn, None, None, Some(error.clone()));
                return State::Terminated(LoopOutcome::failed(turn, error));
            }
        };
        debug!(session = %self.session.id, turn, response = %response, "model response");
        self.conversation.push_assistant(response.clone());

        match parse_response(&response) {
            None => {
                warn!(session = %self.session.id, turn, "no action in response");
                self.record(turn, Some(response), None, Some("no action".to_string()));
                self.note = Some(NO_ACTION_HINT.to_string());
                State::Perceiving { turn: turn + 1 }
            }
            Some(Action::Answer { judgement }) => {
                let action = Action::Answer { judgement };
                self.record(turn, Some(response), Some(&action), None);
                State::Terminated(LoopOutcome::judged(judgement.into(), turn))
            }
            Some(action) => State::Executing {
                turn,
                view,
                action,
                response,
            },
        }
    }

    async fn execute(&mut self, turn: usize, view: &PerceivedView, action: Action, response: String) -> State {
        info!(session = %self.session.id, turn, action = %action, "executing");
        if let Err(e) = self.driver.remove_overlays().await {
            warn!(session = %self.session.id, error = %e, "could not remove label overlays");
        }
        pause(self.config.pacing.after_overlay_removal).await;

        let target = action.label().map(|label| (label, view.element(label)));
        let failure = match target {
            Some((label, None)) => Some(format!(
                "Action `{}` failed: element [{}] is not on the current page.",
                action, label
            )),
            _ => {
                let element = target.and_then(|(_, element)| element);
                match self.driver.dispatch(&action, element).await {
                    Ok(()) => None,
                    Err(e) => Some(format!("Action `{}` failed: {}.", action, e)),
                }
            }
        };

        match &failure {
            Some(message) => {
                warn!(session = %self.session.id, turn, "{}", message);
                self.note = Some(message.clone());
            }
            None => pause(self.config.pacing.after(&action)).await,
        }
        self.record(turn, Some(response), Some(&action), failure);
        State::Perceiving { turn: turn + 1 }
    }

    fn record(&self, turn: usize, response: Option<String>, action: Option<&Action>, note: Option<String>) {
        let record = TurnRecord {
            turn,
            response,
            action: action.map(|a| a.to_string()),
            note,
        };
        if let Err(e) = self.session.append_turn(&record) {
            warn!(session = %self.session.id, error = %e, "could not append transcript");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_per_action() {
        let pacing = Pacing::default();
        assert_eq!(pacing.after(&Action::Wait), Duration::from_secs(5));
        assert_eq!(pacing.after(&Action::GoBack), Duration::from_secs(2));
        assert_eq!(pacing.after(&Action::Click { label: 1 }), Duration::from_secs(1));
        assert_eq!(
            pacing.after(&Action::KeyPress {
                key: crate::action::Key::Enter
            }),
            Duration::from_millis(500)
        );
        assert_eq!(Pacing::none().after(&Action::Wait), Duration::ZERO);
    }

    #[test]
    fn test_prompts_mention_budget() {
        assert!(system_prompt(15).contains("within 15 interactions"));
        assert!(system_prompt(15).contains("Action: {the chosen action}"));
        let first = first_turn_text("Start the game", "Board appears", 8);
        assert!(first.contains("Test task: Start the game"));
        assert!(first.contains("Expected result: Board appears"));
        assert!(first.contains("within 8 interactions"));
    }
}
