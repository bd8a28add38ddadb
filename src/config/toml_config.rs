use crate::core::images::ImagePolicy;
use crate::core::policy::{
    default_failure_rules, FailureKind, FailureRule, PlatformProfile, PollPolicy, RetryPolicy,
    TruncationPolicy,
};
use crate::utils::error::{Result, WriterError};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub platforms: HashMap<String, PlatformConfig>,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub webdriver: WebDriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub platform: String,
    pub model: String,
    pub catalog_path: String,
    pub titles_path: String,
    pub output_path: String,
    pub progress_path: Option<String>,
    /// Failed titles are not retried once they reach this many attempts.
    pub max_title_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub poll_interval_ms: Option<u64>,
    pub max_wait_secs: Option<u64>,
    pub stable_polls: Option<u32>,
    pub max_turns: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub prompt_template: Option<String>,
    pub continuation_prompt: Option<String>,
    pub truncation: Option<TruncationConfig>,
    pub failure_rules: Option<Vec<FailureRuleConfig>>,
    pub response_rules: Option<Vec<FailureRuleConfig>>,
    pub selectors: Option<SelectorConfig>,
    pub session: Option<SessionConfig>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// 模型層級覆寫：提示詞措辭可能因模型而異
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub prompt_template: Option<String>,
    pub continuation_prompt: Option<String>,
    pub truncation: Option<TruncationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TruncationConfig {
    pub min_chars: Option<usize>,
    pub require_terminal_punctuation: Option<bool>,
    pub continuation_markers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRuleConfig {
    pub pattern: String,
    pub kind: String,
    pub reason: Option<String>,
}

/// XPath selectors for the chat page elements
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub chat_input: Option<String>,
    pub send_button: Option<String>,
    pub stop_button: Option<String>,
    pub last_response: Option<String>,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagesConfig {
    pub enabled: Option<bool>,
    pub max_images: Option<usize>,
    pub crop_bottom_px: Option<u32>,
    pub aspect_ratio: Option<f32>,
    pub max_width: Option<u32>,
    pub fetch_timeout_secs: Option<u64>,
    pub referer: Option<String>,
    pub keep_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    pub backend: Option<String>,
    pub local_dir: Option<String>,
    pub public_base_url: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub s3_region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebDriverConfig {
    pub endpoint: Option<String>,
    pub headless: Option<bool>,
    /// Browser profile directory; keeps the platform login between runs.
    pub user_data_dir: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl WriterConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| WriterError::ConfigError {
            message: format!(
                "Cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ),
        })?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| WriterError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${S3_BUCKET})
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| WriterError::ConfigError {
            message: format!("Invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn progress_path(&self) -> PathBuf {
        match &self.run.progress_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.run.output_path).join("progress.csv"),
        }
    }

    pub fn platform(&self) -> Option<&PlatformConfig> {
        self.platforms.get(&self.run.platform)
    }

    pub fn selectors(&self) -> SelectorConfig {
        self.platform()
            .and_then(|p| p.selectors.clone())
            .unwrap_or_default()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let session = self.effective_session();
        let defaults = PollPolicy::default();
        PollPolicy {
            interval: session
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            max_wait: session
                .max_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wait),
            stable_polls: session.stable_polls.unwrap_or(defaults.stable_polls),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let session = self.effective_session();
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: session.max_attempts.unwrap_or(defaults.max_attempts),
            retry_delay: session
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        }
    }

    /// Global `[session]` values overridden by `[platforms.<name>.session]`.
    fn effective_session(&self) -> SessionConfig {
        let global = self.session.clone();
        let Some(local) = self.platform().and_then(|p| p.session.clone()) else {
            return global;
        };
        SessionConfig {
            poll_interval_ms: local.poll_interval_ms.or(global.poll_interval_ms),
            max_wait_secs: local.max_wait_secs.or(global.max_wait_secs),
            stable_polls: local.stable_polls.or(global.stable_polls),
            max_turns: local.max_turns.or(global.max_turns),
            max_attempts: local.max_attempts.or(global.max_attempts),
            retry_delay_secs: local.retry_delay_secs.or(global.retry_delay_secs),
        }
    }

    /// 合併全域、平台與模型設定，產生執行期使用的平台設定檔
    pub fn profile(&self) -> Result<PlatformProfile> {
        let mut profile = PlatformProfile::new(&self.run.platform, &self.run.model);
        profile.poll = self.poll_policy();
        profile.retry = self.retry_policy();
        if let Some(max_turns) = self.effective_session().max_turns {
            profile.max_turns = max_turns;
        }

        let Some(platform) = self.platform() else {
            return Ok(profile);
        };
        let model = platform.models.get(&self.run.model);

        if let Some(template) = model
            .and_then(|m| m.prompt_template.clone())
            .or_else(|| platform.prompt_template.clone())
        {
            profile.prompt_template = template;
        }
        if let Some(prompt) = model
            .and_then(|m| m.continuation_prompt.clone())
            .or_else(|| platform.continuation_prompt.clone())
        {
            profile.continuation_prompt = prompt;
        }

        let truncation = merge_truncation(
            platform.truncation.as_ref(),
            model.and_then(|m| m.truncation.as_ref()),
        );
        let defaults = TruncationPolicy::default();
        profile.truncation = TruncationPolicy::from_patterns(
            truncation.min_chars.unwrap_or(defaults.min_chars),
            truncation
                .require_terminal_punctuation
                .unwrap_or(defaults.require_terminal_punctuation),
            &truncation.continuation_markers.unwrap_or_default(),
        )?;

        if let Some(rules) = &platform.failure_rules {
            profile.notice_rules = compile_rules(rules)?;
        } else {
            profile.notice_rules = default_failure_rules();
        }
        if let Some(rules) = &platform.response_rules {
            profile.response_rules = compile_rules(rules)?;
        }

        Ok(profile)
    }

    pub fn image_policy(&self) -> ImagePolicy {
        let images = &self.images;
        let defaults = ImagePolicy::default();
        let mut keep_prefixes = images.keep_prefixes.clone().unwrap_or_default();
        if let Some(base) = &self.upload.public_base_url {
            keep_prefixes.push(base.clone());
        }
        ImagePolicy {
            enabled: images.enabled.unwrap_or(defaults.enabled),
            max_images: images.max_images.unwrap_or(defaults.max_images),
            crop_bottom_px: images.crop_bottom_px.unwrap_or(defaults.crop_bottom_px),
            aspect_ratio: images.aspect_ratio,
            max_width: images.max_width,
            fetch_timeout: images
                .fetch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            referer: images.referer.clone(),
            keep_prefixes,
        }
    }

    pub fn upload_backend(&self) -> &str {
        self.upload.backend.as_deref().unwrap_or("local")
    }

    pub fn webdriver_endpoint(&self) -> &str {
        self.webdriver
            .endpoint
            .as_deref()
            .unwrap_or("http://localhost:9515")
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("run.platform", &self.run.platform)?;
        validation::validate_non_empty_string("run.model", &self.run.model)?;
        validation::validate_path("run.catalog_path", &self.run.catalog_path)?;
        validation::validate_path("run.titles_path", &self.run.titles_path)?;
        validation::validate_file_extension("run.titles_path", &self.run.titles_path, &["csv", "txt"])?;
        validation::validate_path("run.output_path", &self.run.output_path)?;

        let poll = self.poll_policy();
        if poll.interval.is_zero() {
            return Err(WriterError::InvalidConfigValueError {
                field: "session.poll_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "Poll interval must be positive".to_string(),
            });
        }
        validation::validate_positive_number("session.stable_polls", poll.stable_polls as usize, 1)?;
        validation::validate_positive_number(
            "session.max_attempts",
            self.retry_policy().max_attempts as usize,
            1,
        )?;
        if let Some(max_turns) = self.effective_session().max_turns {
            validation::validate_range("session.max_turns", max_turns, 1, 50)?;
        }

        if let Some(ratio) = self.images.aspect_ratio {
            validation::validate_range("images.aspect_ratio", ratio, 0.1, 10.0)?;
        }
        if let Some(width) = self.images.max_width {
            validation::validate_positive_number("images.max_width", width as usize, 16)?;
        }

        match self.upload_backend() {
            "local" => {
                let base = self.upload.public_base_url.as_deref().ok_or_else(|| {
                    WriterError::MissingConfigError {
                        field: "upload.public_base_url".to_string(),
                    }
                })?;
                validation::validate_url("upload.public_base_url", base)?;
            }
            "s3" => {
                let bucket = self.upload.s3_bucket.as_deref().ok_or_else(|| {
                    WriterError::MissingConfigError {
                        field: "upload.s3_bucket".to_string(),
                    }
                })?;
                validation::validate_non_empty_string("upload.s3_bucket", bucket)?;
                if let Some(base) = &self.upload.public_base_url {
                    validation::validate_url("upload.public_base_url", base)?;
                }
            }
            other => {
                return Err(WriterError::InvalidConfigValueError {
                    field: "upload.backend".to_string(),
                    value: other.to_string(),
                    reason: "Supported backends: local, s3".to_string(),
                })
            }
        }

        validation::validate_url("webdriver.endpoint", self.webdriver_endpoint())?;

        // 正規表達式在這裡就編譯一次，錯誤能在開始前回報
        self.profile().map(|_| ())
    }
}

fn merge_truncation(
    platform: Option<&TruncationConfig>,
    model: Option<&TruncationConfig>,
) -> TruncationConfig {
    let platform = platform.cloned().unwrap_or_default();
    let Some(model) = model else {
        return platform;
    };
    TruncationConfig {
        min_chars: model.min_chars.or(platform.min_chars),
        require_terminal_punctuation: model
            .require_terminal_punctuation
            .or(platform.require_terminal_punctuation),
        continuation_markers: model
            .continuation_markers
            .clone()
            .or(platform.continuation_markers),
    }
}

fn compile_rules(rules: &[FailureRuleConfig]) -> Result<Vec<FailureRule>> {
    rules
        .iter()
        .map(|rule| {
            let kind: FailureKind = rule.kind.parse()?;
            let reason = rule.reason.clone().unwrap_or_else(|| rule.pattern.clone());
            FailureRule::new(&rule.pattern, kind, &reason)
        })
        .collect()
}

impl Validate for WriterConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[run]
platform = "poe"
model = "gpt-4.1"
catalog_path = "model_config.json"
titles_path = "titles.csv"
output_path = "./articles"

[upload]
public_base_url = "https://cdn.example.com/img"
"#;

    #[test]
    fn test_parse_basic_config_with_defaults() {
        let config = WriterConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.run.platform, "poe");
        assert_eq!(config.upload_backend(), "local");
        assert_eq!(config.progress_path(), Path::new("./articles").join("progress.csv"));
        assert_eq!(config.poll_policy(), PollPolicy::default());
        assert!(config.validate().is_ok());

        let profile = config.profile().unwrap();
        assert_eq!(profile.max_turns, 5);
        assert!(!profile.notice_rules.is_empty());
    }

    #[test]
    fn test_platform_and_model_overrides() {
        let content = format!(
            r#"{}
[session]
max_turns = 4
poll_interval_ms = 500

[platforms.poe]
prompt_template = "Platform prompt for {{title}}"
continuation_prompt = "continue"

[platforms.poe.session]
max_turns = 3

[platforms.poe.truncation]
min_chars = 800
continuation_markers = ["(?i)continue\\?"]

[platforms.poe.models."gpt-4.1"]
prompt_template = "Model prompt for {{title}}"

[platforms.poe.models."gpt-4.1".truncation]
require_terminal_punctuation = false
"#,
            BASIC
        );

        let config = WriterConfig::from_toml_str(&content).unwrap();
        let profile = config.profile().unwrap();

        assert_eq!(profile.render_prompt("Rye"), "Model prompt for Rye");
        assert_eq!(profile.continuation_prompt, "continue");
        assert_eq!(profile.max_turns, 3);
        assert_eq!(profile.poll.interval, Duration::from_millis(500));
        assert_eq!(profile.truncation.min_chars, 800);
        assert!(!profile.truncation.require_terminal_punctuation);
        assert_eq!(profile.truncation.continuation_markers.len(), 1);
    }

    #[test]
    fn test_custom_failure_rules() {
        let content = format!(
            r#"{}
[[platforms.poe.failure_rules]]
pattern = "(?i)daily limit"
kind = "permanent"
reason = "daily limit"
"#,
            BASIC
        );
        let config = WriterConfig::from_toml_str(&content).unwrap();
        let profile = config.profile().unwrap();
        assert_eq!(profile.notice_rules.len(), 1);
        assert_eq!(profile.notice_rules[0].kind, FailureKind::Permanent);
    }

    #[test]
    fn test_invalid_rule_kind_fails_validation() {
        let content = format!(
            r#"{}
[[platforms.poe.failure_rules]]
pattern = "oops"
kind = "sometimes"
"#,
            BASIC
        );
        let config = WriterConfig::from_toml_str(&content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_backend_requires_public_url() {
        let content = BASIC.replace("public_base_url = \"https://cdn.example.com/img\"", "");
        let config = WriterConfig::from_toml_str(&content).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, WriterError::MissingConfigError { .. }));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("AUTO_WRITER_TEST_MODEL", "claude-sonnet");
        let content = BASIC.replace("gpt-4.1", "${AUTO_WRITER_TEST_MODEL}");
        let config = WriterConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.run.model, "claude-sonnet");
        std::env::remove_var("AUTO_WRITER_TEST_MODEL");
    }

    #[test]
    fn test_public_base_url_is_kept_prefix() {
        let config = WriterConfig::from_toml_str(BASIC).unwrap();
        let policy = config.image_policy();
        assert!(policy
            .keep_prefixes
            .contains(&"https://cdn.example.com/img".to_string()));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();

        let config = WriterConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.run.model, "gpt-4.1");
    }
}
