use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use common::utils::llm::{ChatCompleter, ChatMessage};

const REWRITE_INSTRUCTION: &str = "You rewrite search queries. Produce semantically equivalent \
reformulations of the user's question, one per line, with no numbering, \
no quotes and no commentary. Vary the vocabulary and phrasing while \
preserving the exact meaning.";

/// Expands a question into query variants via a single LLM call. The
/// original question always comes first; failures degrade to no expansion.
pub struct QueryRewriter {
    chat: Arc<dyn ChatCompleter>,
    enabled: bool,
    n_variants: usize,
}

impl QueryRewriter {
    pub fn new(chat: Arc<dyn ChatCompleter>, enabled: bool, n_variants: usize) -> Self {
        Self {
            chat,
            enabled,
            n_variants,
        }
    }

    pub async fn expand(&self, question: &str) -> Vec<String> {
        if !self.enabled || self.n_variants == 0 {
            return vec![question.to_string()];
        }

        let messages = [
            ChatMessage::system(REWRITE_INSTRUCTION),
            ChatMessage::user(format!(
                "Produce {} reformulations of:\n{question}",
                self.n_variants
            )),
        ];

        let response = match self.chat.complete(&messages).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "query rewriting failed, continuing with the original question");
                return vec![question.to_string()];
            }
        };

        let variants = parse_variants(question, &response, self.n_variants);
        debug!(count = variants.len(), "expanded query variants");
        variants
    }
}

/// Original first, then up to `n` case-insensitively deduplicated variants.
fn parse_variants(question: &str, response: &str, n: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(question.trim().to_lowercase());

    let mut variants = vec![question.to_string()];
    for line in response.lines() {
        let candidate = line
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-')
            .trim();
        if candidate.is_empty() {
            continue;
        }
        if variants.len() > n {
            break;
        }
        if seen.insert(candidate.to_lowercase()) {
            variants.push(candidate.to_string());
        }
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::ScriptedChat;

    #[tokio::test]
    async fn original_question_always_comes_first() {
        let chat = Arc::new(ScriptedChat::new([
            "How does Qdrant work?\nWhat is the Qdrant engine?",
        ]));
        let rewriter = QueryRewriter::new(chat, true, 3);

        let variants = rewriter.expand("What is Qdrant?").await;
        assert_eq!(variants[0], "What is Qdrant?");
        assert_eq!(variants.len(), 3);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_case_insensitively() {
        let chat = Arc::new(ScriptedChat::new([
            "what is qdrant?\nWHAT IS QDRANT?\nHow does Qdrant store vectors?",
        ]));
        let rewriter = QueryRewriter::new(chat, true, 3);

        let variants = rewriter.expand("What is Qdrant?").await;
        assert_eq!(
            variants,
            vec![
                "What is Qdrant?".to_string(),
                "How does Qdrant store vectors?".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn numbered_lists_are_unwrapped() {
        let chat = Arc::new(ScriptedChat::new(["1. First variant\n2) Second variant"]));
        let rewriter = QueryRewriter::new(chat, true, 3);

        let variants = rewriter.expand("original").await;
        assert_eq!(variants[1], "First variant");
        assert_eq!(variants[2], "Second variant");
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_original() {
        let chat = Arc::new(ScriptedChat::failing());
        let rewriter = QueryRewriter::new(chat, true, 3);

        let variants = rewriter.expand("What is Qdrant?").await;
        assert_eq!(variants, vec!["What is Qdrant?".to_string()]);
    }

    #[tokio::test]
    async fn disabled_rewriter_makes_no_call() {
        let chat = Arc::new(ScriptedChat::new(["should never be used"]));
        let rewriter = QueryRewriter::new(Arc::clone(&chat) as Arc<dyn ChatCompleter>, false, 3);

        let variants = rewriter.expand("What is Qdrant?").await;
        assert_eq!(variants, vec!["What is Qdrant?".to_string()]);
        assert!(chat.requests().is_empty());
    }
}
