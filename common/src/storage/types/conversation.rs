use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    Normal,
    /// Synthetic turn holding a rolling summary of collapsed history.
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub kind: TurnKind,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            kind: TurnKind::Normal,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            kind: TurnKind::Normal,
        }
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
            kind: TurnKind::Summary,
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::User => write!(f, "User"),
            TurnRole::Assistant => write!(f, "AI"),
            TurnRole::System => write!(f, "System"),
        }
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

// helper function to format a slice of turns for prompt inclusion
pub fn format_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{turn}"))
        .collect::<Vec<String>>()
        .join("\n")
}

/// Per-session conversational context. Owned by the session principal and
/// kept in memory only, keyed by an opaque session token.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub turns: Vec<Turn>,
}

impl ConversationState {
    /// Appends a turn, dropping the oldest normal turns beyond `max_turns`.
    pub fn push_turn(&mut self, turn: Turn, max_turns: usize) {
        self.turns.push(turn);
        while self.turns.len() > max_turns.max(1) {
            self.turns.remove(0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// In-memory session registry. Each session carries its own async mutex so
/// concurrent answers on the same session serialize (or fail fast) without
/// blocking unrelated sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<ConversationState>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `token`, creating it on first use.
    pub fn session(&self, token: &str) -> Arc<tokio::sync::Mutex<ConversationState>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sessions
                .entry(token.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(ConversationState::default()))),
        )
    }

    pub fn remove(&self, token: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_turn_bounds_history() {
        let mut state = ConversationState::default();
        for i in 0..10 {
            state.push_turn(Turn::user(format!("q{i}")), 4);
        }
        assert_eq!(state.turns.len(), 4);
        assert_eq!(state.turns[0].content, "q6");
        assert_eq!(state.turns[3].content, "q9");
    }

    #[test]
    fn format_history_renders_roles() {
        let turns = vec![Turn::user("hello"), Turn::assistant("hi there")];
        assert_eq!(format_history(&turns), "User: hello\nAI: hi there");
    }

    #[tokio::test]
    async fn session_store_returns_same_session_for_token() {
        let store = SessionStore::new();
        let first = store.session("tok-1");
        first.lock().await.push_turn(Turn::user("hello"), 10);

        let second = store.session("tok-1");
        assert_eq!(second.lock().await.turns.len(), 1);

        let other = store.session("tok-2");
        assert!(other.lock().await.is_empty());
    }
}
