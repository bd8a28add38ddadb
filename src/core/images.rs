use crate::domain::model::{ImageReference, ImageResolution, BROKEN_IMAGE_SCHEME};
use crate::domain::ports::ObjectStore;
use crate::utils::error::{Result, WriterError};
use base64::Engine;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use regex::Regex;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    // <angle-bracketed> targets may hold spaces; bare targets may hold one level of parentheses
    Regex::new(
        r#"!\[([^\]]*)\]\(\s*(?:<([^<>\n]+)>|((?:[^()\s]|\([^()\s]*\))+))(?:\s+"[^"]*")?\s*\)"#,
    )
    .expect("markdown image pattern")
});

static HTML_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["'][^>]*>"#).expect("img tag pattern")
});

static HTML_ALT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\balt\s*=\s*["']([^"']*)["']"#).expect("alt attribute pattern")
});

#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub enabled: bool,
    pub max_images: usize,
    /// 從底部裁掉的像素（去除浮水印）
    pub crop_bottom_px: u32,
    /// width / height; center-cropped when set
    pub aspect_ratio: Option<f32>,
    pub max_width: Option<u32>,
    pub fetch_timeout: Duration,
    pub referer: Option<String>,
    /// Sources under these prefixes are already hosted and left alone.
    pub keep_prefixes: Vec<String>,
}

impl ImagePolicy {
    fn transforms(&self) -> bool {
        self.crop_bottom_px > 0 || self.aspect_ratio.is_some() || self.max_width.is_some()
    }
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_images: 20,
            crop_bottom_px: 0,
            aspect_ratio: None,
            max_width: None,
            fetch_timeout: Duration::from_secs(30),
            referer: None,
            keep_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageReport {
    pub rewritten_text: String,
    pub references: Vec<ImageReference>,
}

impl ImageReport {
    pub fn failures(&self) -> Vec<&ImageReference> {
        self.references.iter().filter(|r| r.is_broken()).collect()
    }

    pub fn uploaded(&self) -> usize {
        self.references
            .iter()
            .filter(|r| matches!(r.resolution, ImageResolution::Uploaded { .. }))
            .count()
    }

    /// Note stored on the title entry when some images could not be processed.
    pub fn failure_note(&self) -> Option<String> {
        let failures = self.failures();
        if failures.is_empty() {
            return None;
        }
        Some(format!(
            "{} of {} image(s) failed",
            failures.len(),
            self.references.len()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    start: usize,
    end: usize,
    source: String,
    alt: String,
}

/// Finds Markdown `![alt](src)` images and HTML `<img src>` tags, in text order.
fn scan_placeholders(text: &str) -> Vec<Placeholder> {
    let mut found: Vec<Placeholder> = MARKDOWN_IMAGE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Placeholder {
                start: whole.start(),
                end: whole.end(),
                alt: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                source: caps.get(2).or_else(|| caps.get(3))?.as_str().to_string(),
            })
        })
        .collect();

    found.extend(HTML_IMAGE.captures_iter(text).filter_map(|caps| {
        let whole = caps.get(0)?;
        let alt = HTML_ALT
            .captures(whole.as_str())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Some(Placeholder {
            start: whole.start(),
            end: whole.end(),
            alt,
            source: caps.get(1)?.as_str().to_string(),
        })
    }));

    found.sort_by_key(|p| p.start);
    let mut result: Vec<Placeholder> = Vec::with_capacity(found.len());
    for placeholder in found {
        if result.last().map(|prev| placeholder.start < prev.end).unwrap_or(false) {
            continue;
        }
        result.push(placeholder);
    }
    result
}

/// 下載、裁切並上傳回覆中的圖片，把連結換成上傳後的網址
///
/// A failing image never aborts the article: its placeholder becomes a
/// `broken-image:` link and the failure is reported in the [`ImageReport`].
pub struct ImagePipeline<U: ObjectStore> {
    store: U,
    policy: ImagePolicy,
    client: reqwest::Client,
    base_dir: Option<PathBuf>,
}

impl<U: ObjectStore> ImagePipeline<U> {
    pub fn new(store: U, policy: ImagePolicy) -> Self {
        Self {
            store,
            policy,
            client: reqwest::Client::new(),
            base_dir: None,
        }
    }

    /// Directory relative local image paths are resolved against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub async fn process(&self, text: &str) -> ImageReport {
        let placeholders = scan_placeholders(text);
        let mut rewritten = String::with_capacity(text.len());
        let mut references = Vec::with_capacity(placeholders.len());
        let mut resolved: HashMap<String, ImageResolution> = HashMap::new();
        let mut cursor = 0;
        let total = placeholders.len();
        let mut handled = 0usize;

        for (i, placeholder) in placeholders.into_iter().enumerate() {
            let resolution = if let Some(done) = resolved.get(&placeholder.source) {
                done.clone()
            } else {
                let resolution = if self.is_kept(&placeholder.source) {
                    ImageResolution::Kept
                } else if handled >= self.policy.max_images {
                    ImageResolution::Broken {
                        reason: "image limit reached".to_string(),
                    }
                } else {
                    handled += 1;
                    tracing::info!("[Image {}/{}] processing {}", i + 1, total, placeholder.source);
                    match self.resolve(&placeholder.source).await {
                        Ok(url) => ImageResolution::Uploaded { url },
                        Err(e) => {
                            tracing::warn!("Image {} left broken: {}", placeholder.source, e);
                            ImageResolution::Broken {
                                reason: e.to_string(),
                            }
                        }
                    }
                };
                resolved.insert(placeholder.source.clone(), resolution.clone());
                resolution
            };

            let reference = ImageReference {
                source: placeholder.source,
                placeholder: text[placeholder.start..placeholder.end].to_string(),
                alt: placeholder.alt,
                resolution,
            };
            rewritten.push_str(&text[cursor..placeholder.start]);
            rewritten.push_str(&reference.to_markdown());
            cursor = placeholder.end;
            references.push(reference);
        }
        rewritten.push_str(&text[cursor..]);

        ImageReport {
            rewritten_text: rewritten,
            references,
        }
    }

    fn is_kept(&self, source: &str) -> bool {
        !self.policy.enabled
            || self
                .policy
                .keep_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && source.starts_with(prefix.as_str()))
    }

    async fn resolve(&self, source: &str) -> Result<String> {
        if source.starts_with(BROKEN_IMAGE_SCHEME) {
            return Err(image_error(source, "previously failed image"));
        }
        let bytes = self.fetch(source).await?;
        let (bytes, content_type) = self.transform(source, bytes)?;
        self.store
            .upload(&bytes, &content_type)
            .await
            .map_err(|e| match e {
                WriterError::UploadError { .. } => e,
                other => WriterError::UploadError {
                    message: other.to_string(),
                },
            })
    }

    async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        if let Some(data) = source.strip_prefix("data:") {
            let (meta, payload) = data
                .split_once(',')
                .ok_or_else(|| image_error(source, "malformed data URI"))?;
            if !meta.ends_with(";base64") {
                return Err(image_error(source, "only base64 data URIs are supported"));
            }
            return base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| image_error(source, &format!("invalid base64: {}", e)));
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            let mut request = self.client.get(source).timeout(self.policy.fetch_timeout);
            if let Some(referer) = &self.policy.referer {
                request = request.header(reqwest::header::REFERER, referer);
            }
            let response = request
                .send()
                .await
                .map_err(|e| image_error(source, &e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(image_error(source, &format!("HTTP {}", status)));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| image_error(source, &e.to_string()))?;
            return Ok(bytes.to_vec());
        }

        let path = self.local_path(source);
        tokio::fs::read(&path)
            .await
            .map_err(|e| image_error(source, &format!("{}: {}", path.display(), e)))
    }

    fn local_path(&self, source: &str) -> PathBuf {
        let raw = Path::new(source.strip_prefix("file://").unwrap_or(source));
        match &self.base_dir {
            Some(base) if raw.is_relative() => base.join(raw),
            _ => raw.to_path_buf(),
        }
    }

    /// 依設定裁切 / 縮放，回傳位元組與 content type
    fn transform(&self, source: &str, bytes: Vec<u8>) -> Result<(Vec<u8>, String)> {
        let format = image::guess_format(&bytes).ok();

        if !self.policy.transforms() {
            let content_type = format
                .map(|f| f.to_mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            return Ok((bytes, content_type));
        }

        let mut img = image::load_from_memory(&bytes)
            .map_err(|e| image_error(source, &format!("cannot decode image: {}", e)))?;

        let crop = self.policy.crop_bottom_px;
        if crop > 0 && img.height() > crop.saturating_mul(2) {
            img = img.crop_imm(0, 0, img.width(), img.height() - crop);
        }

        if let Some(ratio) = self.policy.aspect_ratio.filter(|r| *r > 0.0) {
            img = crop_to_ratio(img, ratio);
        }

        if let Some(max_width) = self.policy.max_width {
            if img.width() > max_width {
                img = img.resize(max_width, img.height(), FilterType::Triangle);
            }
        }

        let (encoded, out_format) = match format {
            Some(ImageFormat::Jpeg) => (DynamicImage::ImageRgb8(img.to_rgb8()), ImageFormat::Jpeg),
            _ => (img, ImageFormat::Png),
        };

        let mut out = Cursor::new(Vec::new());
        encoded
            .write_to(&mut out, out_format)
            .map_err(|e| image_error(source, &format!("cannot encode image: {}", e)))?;
        Ok((out.into_inner(), out_format.to_mime_type().to_string()))
    }
}

fn crop_to_ratio(img: DynamicImage, ratio: f32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return img;
    }
    let current = width as f32 / height as f32;
    if (current - ratio).abs() < 0.01 {
        return img;
    }
    if current > ratio {
        let new_width = ((height as f32 * ratio).round() as u32).clamp(1, width);
        img.crop_imm((width - new_width) / 2, 0, new_width, height)
    } else {
        let new_height = ((width as f32 / ratio).round() as u32).clamp(1, height);
        img.crop_imm(0, (height - new_height) / 2, width, new_height)
    }
}

fn image_error(source: &str, message: &str) -> WriterError {
    WriterError::ImageError {
        source_ref: source.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use image::GenericImageView;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockStore {
        uploads: Arc<Mutex<Vec<(Vec<u8>, String)>>>,
        fail: bool,
    }

    impl MockStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn uploads(&self) -> Vec<(Vec<u8>, String)> {
            self.uploads.lock().unwrap().clone()
        }
    }

    impl ObjectStore for MockStore {
        async fn upload(&self, data: &[u8], content_type: &str) -> Result<String> {
            if self.fail {
                return Err(WriterError::UploadError {
                    message: "bucket unavailable".to_string(),
                });
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push((data.to_vec(), content_type.to_string()));
            Ok(format!("https://cdn.example.com/img/{}.png", uploads.len()))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_scan_finds_markdown_and_html_in_order() {
        let text = r#"Intro <img class="x" src="https://a.example/1.jpg" alt="one"> then ![two](https://a.example/2.png "caption") end"#;
        let found = scan_placeholders(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].source, "https://a.example/1.jpg");
        assert_eq!(found[0].alt, "one");
        assert_eq!(found[1].source, "https://a.example/2.png");
        assert_eq!(found[1].alt, "two");
    }

    #[test]
    fn test_scan_handles_spaces_and_parentheses_in_targets() {
        let text = "![a](<images/path with spaces.png>) and \
                    ![w](https://en.wikipedia.org/wiki/Bread_(food).png) done.";
        let found = scan_placeholders(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].source, "images/path with spaces.png");
        assert_eq!(found[0].alt, "a");
        assert_eq!(found[1].source, "https://en.wikipedia.org/wiki/Bread_(food).png");
        assert_eq!(&text[found[1].end..], " done.");
    }

    #[tokio::test]
    async fn test_text_without_images_is_unchanged() {
        let pipeline = ImagePipeline::new(MockStore::default(), ImagePolicy::default());
        let report = pipeline.process("Just words [and a link](https://x.example).").await;
        assert_eq!(report.rewritten_text, "Just words [and a link](https://x.example).");
        assert!(report.references.is_empty());
        assert!(report.failure_note().is_none());
    }

    #[tokio::test]
    async fn test_downloads_crops_and_uploads() {
        let server = MockServer::start();
        let image_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/bread.png")
                .header("referer", "https://www.toutiao.com/");
            then.status(200)
                .header("Content-Type", "image/png")
                .body(png(40, 200));
        });

        let store = MockStore::default();
        let policy = ImagePolicy {
            crop_bottom_px: 80,
            referer: Some("https://www.toutiao.com/".to_string()),
            ..Default::default()
        };
        let pipeline = ImagePipeline::new(store.clone(), policy);
        let text = format!("Knead well.\n\n![loaf]({})\n", server.url("/bread.png"));
        let report = pipeline.process(&text).await;

        image_mock.assert();
        assert_eq!(
            report.rewritten_text,
            "Knead well.\n\n![loaf](https://cdn.example.com/img/1.png)\n"
        );
        assert_eq!(report.uploaded(), 1);

        let uploads = store.uploads();
        assert_eq!(uploads[0].1, "image/png");
        let cropped = image::load_from_memory(&uploads[0].0).unwrap();
        assert_eq!(cropped.dimensions(), (40, 120));
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_broken_marker() {
        let pipeline = ImagePipeline::new(MockStore::failing(), ImagePolicy::default());
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), png(10, 10)).unwrap();
        let pipeline = pipeline.with_base_dir(dir.path());

        let report = pipeline.process("See ![crumb](a.png) here.").await;

        assert_eq!(
            report.rewritten_text,
            "See ![crumb](broken-image:a.png) here."
        );
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failure_note().unwrap(), "1 of 1 image(s) failed");
    }

    #[tokio::test]
    async fn test_missing_remote_image_is_broken() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gone.jpg");
            then.status(404);
        });
        let store = MockStore::default();
        let pipeline = ImagePipeline::new(store.clone(), ImagePolicy::default());
        let report = pipeline
            .process(&format!("<img src=\"{}\">", server.url("/gone.jpg")))
            .await;

        assert!(report.rewritten_text.starts_with("![](broken-image:http"));
        assert!(store.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_data_uri_and_duplicate_sources_upload_once() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png(4, 4));
        let source = format!("data:image/png;base64,{}", encoded);
        let text = format!("![a]({0}) and again ![b]({0})", source);

        let store = MockStore::default();
        let pipeline = ImagePipeline::new(store.clone(), ImagePolicy::default());
        let report = pipeline.process(&text).await;

        assert_eq!(store.uploads().len(), 1);
        assert_eq!(
            report.rewritten_text,
            "![a](https://cdn.example.com/img/1.png) and again ![b](https://cdn.example.com/img/1.png)"
        );
    }

    #[tokio::test]
    async fn test_hosted_images_are_kept() {
        let store = MockStore::default();
        let policy = ImagePolicy {
            keep_prefixes: vec!["https://cdn.example.com/".to_string()],
            ..Default::default()
        };
        let pipeline = ImagePipeline::new(store.clone(), policy);
        let text = "![x](https://cdn.example.com/img/9.png)";
        let report = pipeline.process(text).await;

        assert_eq!(report.rewritten_text, text);
        assert_eq!(report.references[0].resolution, ImageResolution::Kept);
        assert!(store.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_image_limit_marks_extra_images_broken() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), png(4, 4)).unwrap();
        std::fs::write(dir.path().join("b.png"), png(4, 4)).unwrap();
        let policy = ImagePolicy {
            max_images: 1,
            ..Default::default()
        };
        let pipeline = ImagePipeline::new(MockStore::default(), policy).with_base_dir(dir.path());
        let report = pipeline.process("![](a.png) ![](b.png)").await;

        assert_eq!(report.uploaded(), 1);
        assert_eq!(report.failures().len(), 1);
        assert!(report.rewritten_text.ends_with("![](broken-image:b.png)"));
    }

    #[test]
    fn test_crop_to_ratio_centers() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(300, 100));
        let cropped = crop_to_ratio(img, 1.5);
        assert_eq!(cropped.dimensions(), (150, 100));

        let tall = DynamicImage::ImageRgb8(image::RgbImage::new(100, 300));
        assert_eq!(crop_to_ratio(tall, 1.0).dimensions(), (100, 100));
    }
}
