use std::collections::HashMap;

use regex::Regex;

use common::error::AppError;

/// Extracts citation markers from generated answers. The pattern is
/// configuration; its first capture group must be the passage index.
pub struct CitationExtractor {
    pattern: Regex,
}

impl CitationExtractor {
    pub fn new(pattern: &str) -> Result<Self, AppError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AppError::Validation(format!("invalid citation pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Counts citations per context index. Markers pointing at indices the
    /// context never contained are ignored.
    pub fn highlights(
        &self,
        answer: &str,
        index_to_passage: &HashMap<usize, String>,
    ) -> HashMap<usize, usize> {
        let mut highlights: HashMap<usize, usize> = HashMap::new();
        for captures in self.pattern.captures_iter(answer) {
            let Some(index) = captures.get(1).and_then(|m| m.as_str().parse::<usize>().ok())
            else {
                continue;
            };
            if index_to_passage.contains_key(&index) {
                *highlights.entry(index).or_insert(0) += 1;
            }
        }
        highlights
    }
}

/// An answer counts as a refusal when it contains a configured refusal
/// phrase and cites nothing; refusals are never cached.
pub fn is_refusal(answer: &str, refusal_phrases: &[String], citation_count: usize) -> bool {
    if citation_count > 0 {
        return false;
    }
    let lowered = answer.to_lowercase();
    refusal_phrases
        .iter()
        .any(|phrase| lowered.contains(&phrase.to_lowercase()))
}
