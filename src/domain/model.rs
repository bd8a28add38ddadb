use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TitleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TitleStatus::Pending => "pending",
            TitleStatus::InProgress => "in_progress",
            TitleStatus::Done => "done",
            TitleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TitleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// 一個待產生文章的標題，身分是它在標題清單中的位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleEntry {
    pub index: usize,
    pub text: String,
    pub status: TitleStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub note: String,
}

impl TitleEntry {
    pub fn pending(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            status: TitleStatus::Pending,
            attempt_count: 0,
            note: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub prompt: String,
    pub response: String,
}

/// One title's chat session. Fresh per title, shared by its continuation turns.
#[derive(Debug, Clone)]
pub struct Session {
    pub platform: String,
    pub model: String,
    pub base_url: String,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn new(platform: &str, model: &str, base_url: &str) -> Self {
        Self {
            platform: platform.to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            turns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResolution {
    Uploaded { url: String },
    /// Already hosted under the public base URL; left untouched.
    Kept,
    Broken { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub source: String,
    /// Exact text matched in the response.
    pub placeholder: String,
    pub alt: String,
    pub resolution: ImageResolution,
}

pub const BROKEN_IMAGE_SCHEME: &str = "broken-image:";

impl ImageReference {
    pub fn target(&self) -> String {
        match &self.resolution {
            ImageResolution::Uploaded { url } => url.clone(),
            ImageResolution::Kept => self.source.clone(),
            ImageResolution::Broken { .. } => format!("{}{}", BROKEN_IMAGE_SCHEME, self.source),
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.resolution, ImageResolution::Broken { .. })
    }

    pub fn to_markdown(&self) -> String {
        format!("![{}]({})", self.alt, self.target())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Image { alt: String, target: String },
}

#[derive(Debug, Clone)]
pub struct Article {
    pub title: String,
    pub segments: Vec<Segment>,
    pub output_path: String,
}

impl Article {
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.title);
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Image { alt, target } => {
                    out.push_str(&format!("![{}]({})", alt, target));
                }
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    pub fn image_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Image { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_reference_target() {
        let reference = ImageReference {
            source: "https://img.example.com/a.png".to_string(),
            placeholder: "![a](https://img.example.com/a.png)".to_string(),
            alt: "a".to_string(),
            resolution: ImageResolution::Broken {
                reason: "404".to_string(),
            },
        };
        assert_eq!(
            reference.to_markdown(),
            "![a](broken-image:https://img.example.com/a.png)"
        );
        assert!(reference.is_broken());
    }

    #[test]
    fn test_article_markdown_has_header() {
        let article = Article {
            title: "Sourdough".to_string(),
            segments: vec![
                Segment::Text("Intro.\n\n".to_string()),
                Segment::Image {
                    alt: "loaf".to_string(),
                    target: "https://cdn.example.com/x.png".to_string(),
                },
            ],
            output_path: "Sourdough.md".to_string(),
        };
        let md = article.to_markdown();
        assert!(md.starts_with("# Sourdough\n\nIntro."));
        assert!(md.contains("![loaf](https://cdn.example.com/x.png)"));
        assert_eq!(article.image_count(), 1);
    }
}
