use async_trait::async_trait;
use bytes::Bytes;
use common::{error::AppError, storage::types::chunk::ImageInfo, utils::config::AppConfig};
use tracing::debug;

use crate::{
    chunking::{split_text, ChunkingConfig},
    utils::url_text_retrieval::{extract_text_from_html, extract_text_from_url},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
    pub enable_multimodal: bool,
}

impl ReadConfig {
    pub fn from_app_config(config: &AppConfig, enable_multimodal: bool) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            separators: config.chunk_separators.clone(),
            enable_multimodal,
        }
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            separators: self.separators.clone(),
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        let chunking = ChunkingConfig::default();
        Self {
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
            separators: chunking.separators,
            enable_multimodal: false,
        }
    }
}

/// One chunk as produced by a reader. `images` positions are relative to `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    pub content: String,
    pub seq: usize,
    pub start: usize,
    pub end: usize,
    pub images: Vec<ImageInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDocument {
    pub title: String,
    pub chunks: Vec<ParsedChunk>,
}

/// Turns raw sources into chunks.
#[async_trait]
pub trait DocumentReader: Send + Sync {
    async fn read_from_url(
        &self,
        url: &str,
        title: &str,
        config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError>;

    async fn read_from_file(
        &self,
        content: Bytes,
        file_name: &str,
        file_type: &str,
        config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError>;
}

/// Reads text-like formats in process. URLs go through readability.
pub struct LocalDocumentReader {
    http: reqwest::Client,
    allow_private: bool,
}

impl LocalDocumentReader {
    pub fn new(allow_private: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            allow_private,
        }
    }
}

#[async_trait]
impl DocumentReader for LocalDocumentReader {
    async fn read_from_url(
        &self,
        url: &str,
        title: &str,
        config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError> {
        let page = extract_text_from_url(&self.http, url, self.allow_private).await?;
        let title = if title.is_empty() { page.title } else { title.to_string() };
        parse_text(title, &page.text, config)
    }

    async fn read_from_file(
        &self,
        content: Bytes,
        file_name: &str,
        file_type: &str,
        config: &ReadConfig,
    ) -> Result<ParsedDocument, AppError> {
        let file_type = file_type.trim_start_matches('.').to_ascii_lowercase();
        let text = String::from_utf8(content.to_vec())
            .map_err(|_| AppError::Validation(format!("{file_name} is not valid UTF-8 text")))?;

        let text = match file_type.as_str() {
            "txt" | "text" | "md" | "markdown" | "csv" | "json" | "log" => text,
            "html" | "htm" => extract_text_from_html(text, None)?.text,
            other => {
                return Err(AppError::Validation(format!(
                    "unsupported file type: {other}"
                )))
            }
        };

        debug!(file_name, file_type, chars = text.chars().count(), "read file");
        parse_text(file_name.to_string(), &text, config)
    }
}

/// Chunk plain text and, when multimodal is on, attach markdown images to the
/// chunk whose span contains them.
pub fn parse_text(
    title: String,
    text: &str,
    config: &ReadConfig,
) -> Result<ParsedDocument, AppError> {
    let spans = split_text(text, &config.chunking())?;
    let images = if config.enable_multimodal {
        find_markdown_images(text)
    } else {
        Vec::new()
    };

    let chunks = spans
        .into_iter()
        .enumerate()
        .map(|(seq, span)| {
            let images = images
                .iter()
                .filter(|image| image.start_pos >= span.start && image.start_pos < span.end)
                .map(|image| ImageInfo {
                    start_pos: image.start_pos - span.start,
                    end_pos: image.end_pos.min(span.end) - span.start,
                    ..image.clone()
                })
                .collect();
            ParsedChunk {
                content: span.content,
                seq,
                start: span.start,
                end: span.end,
                images,
            }
        })
        .collect();

    Ok(ParsedDocument { title, chunks })
}

/// Locate `![caption](url)` references. Positions are character offsets into `text`.
pub fn find_markdown_images(text: &str) -> Vec<ImageInfo> {
    let chars: Vec<char> = text.chars().collect();
    let mut images = Vec::new();
    let mut cursor = 0usize;

    while cursor + 1 < chars.len() {
        if chars.get(cursor) != Some(&'!') || chars.get(cursor + 1) != Some(&'[') {
            cursor += 1;
            continue;
        }
        let start = cursor;
        let Some(close_bracket) = position_from(&chars, cursor + 2, ']') else {
            break;
        };
        if chars.get(close_bracket + 1) != Some(&'(') {
            cursor = close_bracket + 1;
            continue;
        }
        let Some(close_paren) = position_from(&chars, close_bracket + 2, ')') else {
            break;
        };

        let caption: String = chars
            .get(start + 2..close_bracket)
            .unwrap_or_default()
            .iter()
            .collect();
        let url: String = chars
            .get(close_bracket + 2..close_paren)
            .unwrap_or_default()
            .iter()
            .collect();
        let url = url.split_whitespace().next().unwrap_or_default().to_string();

        if !url.is_empty() {
            images.push(ImageInfo {
                url: url.clone(),
                original_url: url,
                start_pos: start,
                end_pos: close_paren + 1,
                caption: caption.trim().to_string(),
                ocr_text: String::new(),
            });
        }
        cursor = close_paren + 1;
    }

    images
}

fn position_from(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars
        .get(from..)?
        .iter()
        .position(|c| *c == needle)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_markdown_images_with_char_offsets() {
        let text = "Intro ✓ ![Flow chart](https://cdn.example.com/a.png \"t\") tail ![](x.png)";
        let images = find_markdown_images(text);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].caption, "Flow chart");
        assert_eq!(images[0].url, "https://cdn.example.com/a.png");
        assert_eq!(images[0].start_pos, 8);
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(chars[images[0].end_pos - 1], ')');
        assert_eq!(images[1].caption, "");
    }

    #[test]
    fn parse_text_attaches_images_relative_to_chunk() {
        let text = "First paragraph.\n\nSecond has ![diagram](img.png) inside.";
        let config = ReadConfig {
            chunk_size: 20,
            chunk_overlap: 0,
            separators: vec!["\n\n".into(), " ".into()],
            enable_multimodal: true,
        };
        let doc = parse_text("doc".into(), text, &config).expect("parse");
        let holder = doc
            .chunks
            .iter()
            .find(|chunk| !chunk.images.is_empty())
            .expect("chunk with image");
        let image = &holder.images[0];
        let local: String = holder
            .content
            .chars()
            .skip(image.start_pos)
            .take(2)
            .collect();
        assert_eq!(local, "![");
    }

    #[tokio::test]
    async fn rejects_binary_formats() {
        let reader = LocalDocumentReader::new(false);
        let err = reader
            .read_from_file(Bytes::from_static(b"%PDF"), "a.pdf", "pdf", &ReadConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn reads_markdown_files() {
        let reader = LocalDocumentReader::new(false);
        let doc = reader
            .read_from_file(
                Bytes::from_static("# Title\n\nBody text.".as_bytes()),
                "notes.md",
                ".MD",
                &ReadConfig::default(),
            )
            .await
            .expect("read");
        assert_eq!(doc.title, "notes.md");
        assert_eq!(doc.chunks.len(), 1);
        assert_eq!(doc.chunks[0].end, 19);
    }
}
