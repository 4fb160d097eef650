use text_splitter::TextSplitter;

/// Fragments shorter than this merge into a neighbor instead of becoming
/// their own chunk.
const MIN_FRAGMENT_CHARS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub context_prefix_max: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 50,
            context_prefix_max: 100,
        }
    }
}

/// One emitted chunk: `text` is what gets stored and displayed (body plus
/// the overlap prefix carried from the previous chunk), `embedding_text`
/// additionally carries the context prefix for encoding only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub embedding_text: String,
}

/// Splits a document into overlapping passages.
///
/// Paragraphs first; fragments under `MIN_FRAGMENT_CHARS` merge into their
/// neighbor; fragments over `chunk_size` split again on sentence
/// boundaries (hard character boundary as last resort). Each chunk after
/// the first is prefixed with the previous chunk's trailing `overlap`
/// characters.
pub fn chunk(document_text: &str, config: &ChunkerConfig, context_prefix: Option<&str>) -> Vec<Chunk> {
    let bodies = chunk_bodies(document_text, config);

    let prefix: Option<String> = context_prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| truncate_chars(p, config.context_prefix_max));

    let mut chunks = Vec::with_capacity(bodies.len());
    let mut previous: Option<&str> = None;
    for body in &bodies {
        let text = match previous {
            Some(prev) if config.overlap > 0 => {
                format!("{}{body}", tail_chars(prev, config.overlap))
            }
            _ => body.clone(),
        };

        let embedding_text = match &prefix {
            Some(prefix) => format!("{prefix}\n{text}"),
            None => text.clone(),
        };

        chunks.push(Chunk {
            text,
            embedding_text,
        });
        previous = Some(body.as_str());
    }

    chunks
}

/// Paragraph split, small-fragment merge, oversize re-split. Bodies carry
/// no overlap yet.
fn chunk_bodies(document_text: &str, config: &ChunkerConfig) -> Vec<String> {
    let chunk_size = config.chunk_size.max(MIN_FRAGMENT_CHARS);

    let paragraphs: Vec<String> = document_text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect();

    // Merge short fragments into their predecessor (or successor when
    // they lead the document).
    let mut merged: Vec<String> = Vec::with_capacity(paragraphs.len());
    for paragraph in paragraphs {
        if paragraph.chars().count() < MIN_FRAGMENT_CHARS {
            if let Some(last) = merged.last_mut() {
                last.push_str("\n\n");
                last.push_str(&paragraph);
                continue;
            }
        }
        merged.push(paragraph);
    }
    // A short leading fragment with a successor folds forward.
    if merged.len() >= 2 && merged[0].chars().count() < MIN_FRAGMENT_CHARS {
        let head = merged.remove(0);
        merged[0] = format!("{head}\n\n{}", merged[0]);
    }

    let splitter = TextSplitter::new(chunk_size);
    let mut bodies = Vec::new();
    for fragment in merged {
        if fragment.chars().count() <= chunk_size {
            bodies.push(fragment);
        } else {
            // Sentence boundaries where possible, hard cut as fallback.
            bodies.extend(splitter.chunks(&fragment).map(ToString::to_string));
        }
    }
    bodies
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count <= n {
        text.to_string()
    } else {
        text.chars().skip(count - n).collect()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
