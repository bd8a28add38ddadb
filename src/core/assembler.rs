use crate::domain::model::{Article, ImageReference, Segment, Turn};
use crate::domain::ports::Storage;
use crate::utils::error::Result;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

const MAX_FILE_STEM_CHARS: usize = 120;

/// 將 HTML 回覆轉為 Markdown；純文字回覆原樣返回
pub fn normalize_response(response: &str) -> String {
    let trimmed = response.trim();
    if !looks_like_html(trimmed) {
        return trimmed.to_string();
    }

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "button", "svg", "noscript"])
        .build();

    match converter.convert(trimmed) {
        Ok(markdown) => markdown.trim().to_string(),
        Err(e) => {
            tracing::warn!("HTML to Markdown conversion failed, keeping raw text: {}", e);
            trimmed.to_string()
        }
    }
}

static MARKDOWN_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\([\\`*_{}\[\]()#+\-.!>~|])").expect("markdown escape pattern")
});

/// Reply text as a reader sees it: HTML converted and Markdown escapes removed.
/// Truncation checks run on this rather than on the raw page markup.
pub fn plain_text(response: &str) -> String {
    MARKDOWN_ESCAPE
        .replace_all(&normalize_response(response), "$1")
        .into_owned()
}

fn looks_like_html(text: &str) -> bool {
    const BLOCK_TAGS: &[&str] = &["<p", "<div", "<h1", "<h2", "<h3", "<ul", "<ol", "<li", "<br", "<span", "<pre"];
    let lower = text.to_ascii_lowercase();
    lower.starts_with('<') && BLOCK_TAGS.iter().any(|tag| lower.contains(tag))
}

/// Concatenates normalised turn responses in order, separated by a blank line.
pub fn join_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| normalize_response(&turn.response))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 由標題產生穩定且不會碰撞的檔名
///
/// Keeps letters, digits, spaces, `-` and `_`. When anything had to be
/// dropped, a short hash of the raw title is appended so two titles that
/// sanitize to the same text still get different files.
pub fn output_file_name(title: &str) -> String {
    let raw = title.trim();
    let sanitized: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let stem: String = sanitized.chars().take(MAX_FILE_STEM_CHARS).collect();

    if !stem.is_empty() && stem == raw {
        return format!("{}.md", stem);
    }

    let digest = Sha256::digest(raw.as_bytes());
    let short = format!("{:x}", digest);
    let short = &short[..8];
    if stem.is_empty() {
        format!("untitled-{}.md", short)
    } else {
        format!("{}-{}.md", stem, short)
    }
}

pub struct ArticleAssembler<S: Storage> {
    storage: S,
}

impl<S: Storage> ArticleAssembler<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Builds the article from the session turns, placing each image
    /// reference at the position of its placeholder.
    pub fn assemble(&self, title: &str, turns: &[Turn], images: &[ImageReference]) -> Article {
        let body = strip_leading_title(&join_turns(turns), title);
        let mut segments = Vec::new();
        let mut cursor = 0;

        for image in images {
            let Some(offset) = body[cursor..].find(image.placeholder.as_str()) else {
                tracing::warn!(
                    "Image placeholder for {} not found in '{}'",
                    image.source,
                    title
                );
                continue;
            };
            let start = cursor + offset;
            if start > cursor {
                segments.push(Segment::Text(body[cursor..start].to_string()));
            }
            segments.push(Segment::Image {
                alt: image.alt.clone(),
                target: image.target(),
            });
            cursor = start + image.placeholder.len();
        }
        if cursor < body.len() {
            segments.push(Segment::Text(body[cursor..].to_string()));
        }

        Article {
            title: title.trim().to_string(),
            segments,
            output_path: output_file_name(title),
        }
    }

    /// 寫入文章；同一標題重新處理時會覆寫同一個檔案
    pub async fn write(&self, article: &Article) -> Result<String> {
        let markdown = article.to_markdown();
        self.storage
            .write_file(&article.output_path, markdown.as_bytes())
            .await?;
        tracing::info!(
            "📝 Saved '{}' ({} chars, {} image(s)) to {}",
            article.title,
            markdown.chars().count(),
            article.image_count(),
            article.output_path
        );
        Ok(article.output_path.clone())
    }
}

/// Drops a leading `# Heading` equal to the title; the article adds its own.
fn strip_leading_title(body: &str, title: &str) -> String {
    let trimmed = body.trim_start();
    if let Some(rest) = trimmed.strip_prefix("# ") {
        let (first_line, remainder) = rest.split_once('\n').unwrap_or((rest, ""));
        if first_line.trim().eq_ignore_ascii_case(title.trim()) {
            return remainder.trim_start().to_string();
        }
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ImageResolution;
    use crate::utils::error::WriterError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemoryStorage {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl Storage for MemoryStorage {
        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| {
                    WriterError::IoError(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("File not found: {}", path),
                    ))
                })
        }

        async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), data.to_vec());
            Ok(())
        }
    }

    fn turn(response: &str) -> Turn {
        Turn {
            prompt: "p".to_string(),
            response: response.to_string(),
        }
    }

    #[test]
    fn test_file_names_are_stable_and_distinct() {
        assert_eq!(output_file_name("How to Bake Bread"), "How to Bake Bread.md");
        assert_eq!(output_file_name("如何烤麵包"), "如何烤麵包.md");

        let slash = output_file_name("A/B Testing");
        let plain = output_file_name("AB Testing");
        assert!(slash.starts_with("AB Testing-"));
        assert_ne!(slash, plain);
        assert_eq!(slash, output_file_name("A/B Testing"));

        assert!(output_file_name("???").starts_with("untitled-"));
        assert!(!output_file_name("../../etc/passwd").contains('/'));
    }

    #[test]
    fn test_html_responses_become_markdown() {
        let md = normalize_response("<h2>Proofing</h2><p>Let it <strong>rise</strong>.</p>");
        assert!(md.contains("Proofing"));
        assert!(md.contains("**rise**"));
        assert!(!md.contains("<p>"));

        assert_eq!(normalize_response("  plain text  "), "plain text");
    }

    #[test]
    fn test_plain_text_drops_markup_and_escapes() {
        assert_eq!(plain_text("<p>Knead the dough until it</p>"), "Knead the dough until it");
        assert!(plain_text("<p>Part one. [to be continued]</p>").ends_with("[to be continued]"));
        assert_eq!(plain_text("already *plain* text."), "already *plain* text.");
    }

    #[test]
    fn test_assemble_places_images_at_placeholders() {
        let assembler = ArticleAssembler::new(MemoryStorage::default());
        let turns = vec![turn("# How to Bake Bread\n\nMix.\n\n![loaf](x.png)\n\nBake."), turn("Cool it.")];
        let images = vec![ImageReference {
            source: "x.png".to_string(),
            placeholder: "![loaf](x.png)".to_string(),
            alt: "loaf".to_string(),
            resolution: ImageResolution::Uploaded {
                url: "https://cdn.example.com/1.png".to_string(),
            },
        }];

        let article = assembler.assemble("How to Bake Bread", &turns, &images);

        assert_eq!(article.output_path, "How to Bake Bread.md");
        assert_eq!(article.segments.len(), 3);
        assert_eq!(
            article.to_markdown(),
            "# How to Bake Bread\n\nMix.\n\n![loaf](https://cdn.example.com/1.png)\n\nBake.\n\nCool it.\n"
        );
    }

    #[tokio::test]
    async fn test_write_overwrites_same_file() {
        let storage = MemoryStorage::default();
        let assembler = ArticleAssembler::new(storage.clone());

        let first = assembler.assemble("Rye", &[turn("v1.")], &[]);
        let second = assembler.assemble("Rye", &[turn("v2.")], &[]);
        assembler.write(&first).await.unwrap();
        let path = assembler.write(&second).await.unwrap();

        let files = storage.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files.get(&path).unwrap(), b"# Rye\n\nv2.\n");
    }
}
