use std::sync::Arc;

use tracing::{debug, warn};

use common::storage::types::conversation::{format_history, ConversationState, Turn};
use common::utils::config::AppConfig;
use common::utils::llm::{ChatCompleter, ChatMessage};

const SUMMARIZE_INSTRUCTION: &str = "Summarize the following conversation so a later turn can \
rely on it as context. Keep facts, names, decisions and open questions; \
drop pleasantries. Answer with the summary only.";

#[derive(Debug, Clone, Copy)]
pub struct HistoryPolicy {
    pub max_history_turns: usize,
    pub keep_recent_turns: usize,
    pub max_summary_chars: usize,
}

impl From<&AppConfig> for HistoryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_history_turns: config.max_history_turns,
            keep_recent_turns: config.keep_recent_turns,
            max_summary_chars: config.max_summary_chars,
        }
    }
}

/// Collapses long conversations into a rolling summary turn. When the
/// summarizer call fails the oldest turns are simply dropped.
pub struct HistoryCompressor {
    chat: Arc<dyn ChatCompleter>,
    policy: HistoryPolicy,
}

impl HistoryCompressor {
    pub fn new(chat: Arc<dyn ChatCompleter>, policy: HistoryPolicy) -> Self {
        Self { chat, policy }
    }

    pub async fn compress(&self, state: &mut ConversationState) {
        if state.turns.len() <= self.policy.max_history_turns {
            return;
        }

        let keep = self.policy.keep_recent_turns.min(state.turns.len());
        let split = state.turns.len() - keep;
        let collapsed: Vec<Turn> = state.turns.drain(..split).collect();
        // Existing summary turns are folded into the new summary input.
        let summary_input = format_history(&collapsed);

        let messages = [
            ChatMessage::system(SUMMARIZE_INSTRUCTION),
            ChatMessage::user(summary_input),
        ];
        match self.chat.complete(&messages).await {
            Ok(summary) => {
                let bounded = truncate_chars(summary.trim(), self.policy.max_summary_chars);
                debug!(
                    collapsed = collapsed.len(),
                    summary_chars = bounded.chars().count(),
                    "compressed conversation history"
                );
                state.turns.insert(0, Turn::summary(bounded));
            }
            Err(err) => {
                warn!(error = %err, "history summarization failed, truncating oldest turns");
            }
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
