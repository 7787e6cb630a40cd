//! Bounded conversation history exchanged with the decision service.
//!
//! The system turn is pinned and never evicted. Every other turn goes into a
//! fixed-capacity buffer that drops its oldest entry once full, which keeps
//! request size bounded no matter how many turns a session runs.

use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Turn payload. Screenshots are shared so cloning a conversation is cheap.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    TextWithImage { text: String, png: Arc<Vec<u8>> },
}

impl Content {
    pub fn text(&self) -> &str {
        match self {
            Content::Text(text) | Content::TextWithImage { text, .. } => text,
        }
    }

    pub fn image(&self) -> Option<&[u8]> {
        match self {
            Content::Text(_) => None,
            Content::TextWithImage { png, .. } => Some(png.as_slice()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: Content,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::Text(text.into()),
        }
    }

    pub fn user(content: Content) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }
}

/// Conversation for one session: a pinned system turn plus at most
/// `capacity` recent user/assistant turns.
#[derive(Debug, Clone)]
pub struct Conversation {
    system: Turn,
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            system: Turn::system(system_prompt),
            turns: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn system(&self) -> &Turn {
        &self.system
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained non-system turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn, evicting the oldest non-system turns past capacity.
    ///
    /// System turns are not accepted here; the pinned one is set at
    /// construction and a second one is folded in as a user turn.
    pub fn push(&mut self, turn: Turn) {
        let turn = match turn.role {
            Role::System => Turn::user(turn.content),
            _ => turn,
        };
        self.turns.push_back(turn);
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
    }

    pub fn push_user(&mut self, content: Content) {
        self.push(Turn::user(content));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Turn::assistant(text));
    }

    /// All turns in request order, system turn first.
    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        std::iter::once(&self.system).chain(self.turns.iter())
    }
}
