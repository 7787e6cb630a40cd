//! Action grammar for decision-service replies.
//!
//! The agent answers every turn with free text of the form
//!
//! ```text
//! Thought: the start button is labelled 3
//! Action: Click [3]
//! ```
//!
//! [`parse_response`] extracts the `Action:` line and turns it into a typed
//! [`Action`]. Anything that does not match one of the productions yields
//! `None` ("no action"); parsing never fails loudly.
//!
//! | Production | Action |
//! |------------|--------|
//! | `Click [i]` | [`Action::Click`] |
//! | `Type [i]; text` | [`Action::Type`] |
//! | `Scroll [WINDOW\|i]; up\|down` | [`Action::Scroll`] |
//! | `KeyPress key` | [`Action::KeyPress`] |
//! | `Wait` | [`Action::Wait`] |
//! | `GoBack` | [`Action::GoBack`] |
//! | `ANSWER; YES\|NO\|PARTIAL` | [`Action::Answer`] |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static ACTION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s*_#>`-]*action[\s*_`]*:[\s*_`]*(.+?)\s*$").expect("valid regex")
});
static CLICK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^click\s*\[\s*(\d+)\s*\]").expect("valid regex"));
static TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^type\s*\[\s*(\d+)\s*\]\s*;\s*(.+)$").expect("valid regex"));
static SCROLL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^scroll\s*\[?\s*(window|\d+)\s*\]?\s*;\s*\[?\s*(up|down)\b").expect("valid regex")
});
static KEYPRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^keypress\s*\[?\s*([^\s\[\]]+)\s*\]?").expect("valid regex"));
static WAIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^wait\b").expect("valid regex"));
static GO_BACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^go\s*back\b").expect("valid regex"));
static ANSWER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^answer\s*;\s*\[?\s*(yes|no|partial)\b").expect("valid regex")
});

/// Outcome of a session, either rendered by the agent or by the infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Yes,
    No,
    Partial,
    Timeout,
    Error,
    Unknown,
}

impl Verdict {
    pub const ALL: [Verdict; 6] = [
        Verdict::Yes,
        Verdict::No,
        Verdict::Partial,
        Verdict::Timeout,
        Verdict::Error,
        Verdict::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Yes => "YES",
            Verdict::No => "NO",
            Verdict::Partial => "PARTIAL",
            Verdict::Timeout => "TIMEOUT",
            Verdict::Error => "ERROR",
            Verdict::Unknown => "UNKNOWN",
        }
    }

    /// True for YES/NO/PARTIAL, the verdicts only the agent can give.
    pub fn is_judgement(&self) -> bool {
        matches!(self, Verdict::Yes | Verdict::No | Verdict::Partial)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent's final answer on a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Judgement {
    Yes,
    No,
    Partial,
}

impl From<Judgement> for Verdict {
    fn from(judgement: Judgement) -> Self {
        match judgement {
            Judgement::Yes => Verdict::Yes,
            Judgement::No => Verdict::No,
            Judgement::Partial => Verdict::Partial,
        }
    }
}

impl fmt::Display for Judgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Verdict::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// What a scroll applies to: the whole page or one labelled element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollTarget {
    Window,
    Element(usize),
}

/// A keyboard key, normalised against the named-key table.
///
/// Tokens outside the table are kept verbatim so single-character game
/// controls such as `r` or `w` pass straight through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Enter,
    Space,
    Escape,
    Tab,
    Literal(String),
}

impl Key {
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "arrowup" | "up" => Key::ArrowUp,
            "arrowdown" | "down" => Key::ArrowDown,
            "arrowleft" | "left" => Key::ArrowLeft,
            "arrowright" | "right" => Key::ArrowRight,
            "enter" | "return" => Key::Enter,
            "space" | "spacebar" => Key::Space,
            "escape" | "esc" => Key::Escape,
            "tab" => Key::Tab,
            _ => Key::Literal(token.to_string()),
        }
    }

    /// Resolve a literal that spells a named key, e.g. `Literal("up")`.
    pub fn canonical(&self) -> Key {
        match self {
            Key::Literal(token) => Key::from_token(token),
            named => named.clone(),
        }
    }

    fn named(&self) -> Option<&'static str> {
        let name = match self {
            Key::ArrowUp => "ArrowUp",
            Key::ArrowDown => "ArrowDown",
            Key::ArrowLeft => "ArrowLeft",
            Key::ArrowRight => "ArrowRight",
            Key::Enter => "Enter",
            Key::Space => " ",
            Key::Escape => "Escape",
            Key::Tab => "Tab",
            Key::Literal(token) => {
                return match Key::from_token(token) {
                    Key::Literal(_) => None,
                    named => named.named(),
                };
            }
        };
        Some(name)
    }

    /// Key name as understood by the browser's keyboard layout.
    pub fn browser_name(&self) -> &str {
        match self {
            Key::Literal(token) => self.named().unwrap_or(token.as_str()),
            _ => self.named().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.named() {
            Some(" ") => f.write_str("Space"),
            _ => f.write_str(self.browser_name()),
        }
    }
}

/// One UI action chosen by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click { label: usize },
    Type { label: usize, text: String },
    Scroll { target: ScrollTarget, direction: ScrollDirection },
    KeyPress { key: Key },
    Wait,
    GoBack,
    Answer { judgement: Judgement },
}

impl Action {
    /// Element label this action refers to, if any.
    pub fn label(&self) -> Option<usize> {
        match self {
            Action::Click { label } | Action::Type { label, .. } => Some(*label),
            Action::Scroll {
                target: ScrollTarget::Element(label),
                ..
            } => Some(*label),
            _ => None,
        }
    }

    /// Form the parser produces for this action: key aliases resolved and
    /// `Type` text trimmed. Parsing the `Display` output yields this value;
    /// a `Type` with blank text has no textual form and is rejected.
    pub fn canonical(&self) -> Action {
        match self {
            Action::Type { label, text } => Action::Type {
                label: *label,
                text: text.trim().to_string(),
            },
            Action::KeyPress { key } => Action::KeyPress { key: key.canonical() },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { label } => write!(f, "Click [{}]", label),
            Action::Type { label, text } => write!(f, "Type [{}]; {}", label, text.trim()),
            Action::Scroll { target, direction } => {
                let target = match target {
                    ScrollTarget::Window => "WINDOW".to_string(),
                    ScrollTarget::Element(i) => i.to_string(),
                };
                let direction = match direction {
                    ScrollDirection::Up => "up",
                    ScrollDirection::Down => "down",
                };
                write!(f, "Scroll [{}]; {}", target, direction)
            }
            Action::KeyPress { key } => write!(f, "KeyPress {}", key),
            Action::Wait => f.write_str("Wait"),
            Action::GoBack => f.write_str("GoBack"),
            Action::Answer { judgement } => write!(f, "ANSWER; {}", judgement),
        }
    }
}

/// Why an action body did not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized action: {0:?}")]
pub struct ActionParseError(pub String);

impl FromStr for Action {
    type Err = ActionParseError;

    /// Parse a bare action body such as `Type [2]; hello`.
    fn from_str(body: &str) -> Result<Self, Self::Err> {
        let body = body.trim().trim_matches(|c| c == '`' || c == '*').trim();
        let err = || ActionParseError(body.to_string());

        if let Some(caps) = CLICK.captures(body) {
            let label = caps[1].parse().map_err(|_| err())?;
            return Ok(Action::Click { label });
        }
        if let Some(caps) = TYPE.captures(body) {
            let label = caps[1].parse().map_err(|_| err())?;
            let text = caps[2].trim().to_string();
            return Ok(Action::Type { label, text });
        }
        if let Some(caps) = SCROLL.captures(body) {
            let target = if caps[1].eq_ignore_ascii_case("window") {
                ScrollTarget::Window
            } else {
                ScrollTarget::Element(caps[1].parse().map_err(|_| err())?)
            };
            let direction = if caps[2].eq_ignore_ascii_case("up") {
                ScrollDirection::Up
            } else {
                ScrollDirection::Down
            };
            return Ok(Action::Scroll { target, direction });
        }
        if let Some(caps) = KEYPRESS.captures(body) {
            return Ok(Action::KeyPress {
                key: Key::from_token(&caps[1]),
            });
        }
        if WAIT.is_match(body) {
            return Ok(Action::Wait);
        }
        if GO_BACK.is_match(body) {
            return Ok(Action::GoBack);
        }
        if let Some(caps) = ANSWER.captures(body) {
            let judgement = match caps[1].to_ascii_uppercase().as_str() {
                "YES" => Judgement::Yes,
                "NO" => Judgement::No,
                _ => Judgement::Partial,
            };
            return Ok(Action::Answer { judgement });
        }
        Err(err())
    }
}

/// Extract the action from a full decision-service reply.
///
/// The first line labelled `Action:` wins. A reply without any label is
/// accepted only when it is a single bare action line.
pub fn parse_response(text: &str) -> Option<Action> {
    if let Some(caps) = ACTION_LINE.captures(text) {
        return caps[1].parse().ok();
    }
    let trimmed = text.trim();
    if trimmed.lines().count() == 1 {
        return trimmed.parse().ok();
    }
    None
}
