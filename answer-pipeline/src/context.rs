use std::collections::HashMap;

use common::storage::vector::ScoredPassage;
use common::utils::config::AppConfig;

use crate::SourceRef;

const TRUNCATION_MARKER: &str = " … [truncated] … ";
const PREVIEW_CHARS: usize = 160;

/// Share of an over-long passage kept at each end when clipping.
const CLIP_SHARE: f32 = 0.48;

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_context_chars: usize,
    pub max_single_content: usize,
}

impl From<&AppConfig> for ContextBudget {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_context_chars: config.max_context_chars,
            max_single_content: config.max_single_content,
        }
    }
}

/// Numbered context block handed to the generator, plus the bookkeeping
/// citation extraction needs to map `[^N]` back to passages.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub block: String,
    pub sources: Vec<SourceRef>,
    pub index_to_passage: HashMap<usize, String>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Walks passages in rank order, clips each to the per-passage cap and
/// stops once the total budget is spent. Retained passages are numbered
/// from 1 in rank order.
pub fn assemble_context(passages: &[ScoredPassage], budget: &ContextBudget) -> AssembledContext {
    let mut assembled = AssembledContext::default();
    let mut total_chars = 0usize;
    let mut index = 0usize;

    for hit in passages {
        let clipped = clip_middle(&hit.passage.text, budget.max_single_content);
        let clipped_chars = clipped.chars().count();
        if total_chars + clipped_chars > budget.max_context_chars {
            break;
        }
        total_chars += clipped_chars;
        index += 1;

        assembled.block.push_str(&format!(
            "[{index}] (source: {})\n{clipped}\n\n",
            hit.passage.source
        ));
        assembled
            .index_to_passage
            .insert(index, hit.passage.id.clone());
        assembled.sources.push(SourceRef {
            index,
            passage_id: hit.passage.id.clone(),
            source: hit.passage.source.clone(),
            score: hit.score,
            preview: hit.passage.preview(PREVIEW_CHARS),
        });
    }

    assembled
}

/// Keeps the head and tail of an over-long text joined by a marker.
pub fn clip_middle(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }

    let keep = (max_chars as f32 * CLIP_SHARE) as usize;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(count - keep).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}
