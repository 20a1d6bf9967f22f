use common::error::AppError;
use text_splitter::{ChunkConfig, TextSplitter};

/// Chunk sizing. Sizes and offsets are counted in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Most specific first. Empty selects semantic splitting.
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            separators: vec!["\n\n".into(), "\n".into(), "。".into()],
        }
    }
}

impl ChunkingConfig {
    fn validate(&self) -> Result<(), AppError> {
        if self.chunk_size == 0 {
            return Err(AppError::Validation("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A piece of the source text with its character span `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub content: String,
    pub start: usize,
    pub end: usize,
}

/// Split `text` into overlapping spans that together cover the whole input.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Result<Vec<TextSpan>, AppError> {
    config.validate()?;
    if text.is_empty() {
        return Ok(Vec::new());
    }

    if config.separators.iter().all(String::is_empty) {
        return semantic_split(text, config);
    }

    let chars: Vec<char> = text.chars().collect();
    let separators: Vec<Vec<char>> = config
        .separators
        .iter()
        .filter(|sep| !sep.is_empty())
        .map(|sep| sep.chars().collect())
        .collect();

    let mut segments = Vec::new();
    split_ranges(
        &chars,
        0,
        chars.len(),
        &separators,
        config.chunk_size,
        &mut segments,
    );

    Ok(merge_segments(&segments, config.chunk_size, config.chunk_overlap)
        .into_iter()
        .map(|(start, end)| TextSpan {
            content: chars.get(start..end).unwrap_or_default().iter().collect(),
            start,
            end,
        })
        .collect())
}

fn split_ranges(
    chars: &[char],
    start: usize,
    end: usize,
    separators: &[Vec<char>],
    size: usize,
    out: &mut Vec<(usize, usize)>,
) {
    if end - start <= size {
        out.push((start, end));
        return;
    }

    for (position, separator) in separators.iter().enumerate() {
        let pieces = split_on(chars, start, end, separator);
        if pieces.len() > 1 {
            let finer = separators.get(position + 1..).unwrap_or_default();
            for (piece_start, piece_end) in pieces {
                split_ranges(chars, piece_start, piece_end, finer, size, out);
            }
            return;
        }
    }

    // Unsplittable run.
    out.push((start, end));
}

/// Cut `[start, end)` after every occurrence of `separator`; the separator stays
/// with the piece before it.
fn split_on(chars: &[char], start: usize, end: usize, separator: &[char]) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut piece_start = start;
    let mut cursor = start;

    while cursor + separator.len() <= end {
        if chars.get(cursor..cursor + separator.len()) == Some(separator) {
            cursor += separator.len();
            pieces.push((piece_start, cursor));
            piece_start = cursor;
        } else {
            cursor += 1;
        }
    }
    if piece_start < end {
        pieces.push((piece_start, end));
    }
    pieces
}

fn span_len(segments: &[(usize, usize)]) -> usize {
    match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => last.1 - first.0,
        _ => 0,
    }
}

fn merge_segments(segments: &[(usize, usize)], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut current: Vec<(usize, usize)> = Vec::new();

    for &segment in segments {
        let segment_len = segment.1 - segment.0;
        if !current.is_empty() && span_len(&current) + segment_len > size {
            if let (Some(first), Some(last)) = (current.first(), current.last()) {
                chunks.push((first.0, last.1));
            }

            let mut tail = Vec::new();
            let mut tail_len = 0usize;
            for &(start, end) in current.iter().skip(1).rev() {
                let len = end - start;
                if tail_len + len > overlap || tail_len + len + segment_len > size {
                    break;
                }
                tail_len += len;
                tail.push((start, end));
            }
            tail.reverse();
            current = tail;
        }
        current.push(segment);
    }

    if let (Some(first), Some(last)) = (current.first(), current.last()) {
        chunks.push((first.0, last.1));
    }
    chunks
}

fn semantic_split(text: &str, config: &ChunkingConfig) -> Result<Vec<TextSpan>, AppError> {
    let chunk_config = ChunkConfig::new(config.chunk_size)
        .with_overlap(config.chunk_overlap)
        .map_err(|err| AppError::Validation(err.to_string()))?
        .with_trim(false);
    let splitter = TextSplitter::new(chunk_config);

    let mut spans = Vec::new();
    let mut last_byte = 0usize;
    let mut last_char = 0usize;
    for (byte_offset, chunk) in splitter.chunk_indices(text) {
        let advanced = text
            .get(last_byte..byte_offset)
            .map_or(0, |skipped| skipped.chars().count());
        let start = last_char + advanced;
        let end = start + chunk.chars().count();
        last_byte = byte_offset;
        last_char = start;
        spans.push(TextSpan {
            content: chunk.to_string(),
            start,
            end,
        });
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(text: &str, spans: &[TextSpan], size: usize) {
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(spans.first().map(|s| s.start), Some(0));
        assert_eq!(spans.last().map(|s| s.end), Some(chars.len()));
        for span in spans {
            assert!(span.end - span.start <= size, "span too long: {span:?}");
            let expected: String = chars[span.start..span.end].iter().collect();
            assert_eq!(span.content, expected);
        }
        for pair in spans.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between spans");
            assert!(pair[1].start > pair[0].start, "no forward progress");
        }
    }

    fn sample_text() -> String {
        (0..30)
            .map(|i| format!("Sentence number {i} talks about ingestion.\n"))
            .collect::<Vec<_>>()
            .join("")
    }

    #[test]
    fn separator_split_respects_size_and_covers_text() {
        let text = sample_text();
        let config = ChunkingConfig {
            chunk_size: 120,
            chunk_overlap: 50,
            separators: vec!["\n\n".into(), "\n".into(), " ".into()],
        };
        let spans = split_text(&text, &config).expect("split");
        assert!(spans.len() > 1);
        assert_covers(&text, &spans, 120);

        for pair in spans.windows(2) {
            let overlap = pair[0].end - pair[1].start;
            assert!(overlap <= 50);
            assert!(overlap > 0, "expected overlapping line");
        }
    }

    #[test]
    fn short_text_is_single_span() {
        let spans = split_text("hello world", &ChunkingConfig::default()).expect("split");
        assert_eq!(
            spans,
            vec![TextSpan {
                content: "hello world".into(),
                start: 0,
                end: 11,
            }]
        );
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "第一句话。第二句话。第三句话。";
        let config = ChunkingConfig {
            chunk_size: 6,
            chunk_overlap: 0,
            separators: vec!["。".into()],
        };
        let spans = split_text(text, &config).expect("split");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].start, 5);
        assert_eq!(spans[1].content, "第二句话。");
        assert_covers(text, &spans, 6);
    }

    #[test]
    fn unsplittable_run_is_kept_whole() {
        let text = "a".repeat(30);
        let config = ChunkingConfig {
            chunk_size: 10,
            chunk_overlap: 2,
            separators: vec!["\n".into()],
        };
        let spans = split_text(&text, &config).expect("split");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end, 30);
    }

    #[test]
    fn empty_separators_use_semantic_split() {
        let text = sample_text();
        let config = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 20,
            separators: Vec::new(),
        };
        let spans = split_text(&text, &config).expect("split");
        assert!(spans.len() > 1);
        assert_covers(&text, &spans, 100);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        let config = ChunkingConfig {
            chunk_size: 10,
            chunk_overlap: 10,
            separators: Vec::new(),
        };
        assert!(matches!(
            split_text("text", &config),
            Err(AppError::Validation(_))
        ));
    }
}
