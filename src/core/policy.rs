//! Per-platform heuristics used by the session driver: prompt rendering,
//! response polling, truncation detection and page-anomaly classification.

use crate::utils::error::{Result, SessionError, WriterError};
use regex::Regex;
use std::time::Duration;

pub const TITLE_PLACEHOLDER: &str = "{title}";

pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Write a complete, well-structured long-form article in Markdown titled \"{title}\".";

pub const DEFAULT_CONTINUATION_PROMPT: &str =
    "Your previous answer was cut off. Continue exactly where you stopped, without repeating anything.";

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Consecutive identical reads required before a reply counts as finished.
    pub stable_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(300),
            stable_polls: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Fresh-session attempts per title, including the first one.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// 判斷回覆是否被截斷、需要再送「繼續」提示
#[derive(Debug, Clone)]
pub struct TruncationPolicy {
    /// Minimum accumulated characters across all turns.
    pub min_chars: usize,
    pub require_terminal_punctuation: bool,
    pub continuation_markers: Vec<Regex>,
}

const TERMINATORS: &[char] = &[
    '.', '!', '?', '。', '！', '？', '…', '"', '\'', '”', '’', '」', '』', ')', '）', ']', '】',
    '*', '`', '>', '|', '~',
];

impl TruncationPolicy {
    pub fn from_patterns(
        min_chars: usize,
        require_terminal_punctuation: bool,
        patterns: &[String],
    ) -> Result<Self> {
        let continuation_markers = patterns
            .iter()
            .map(|p| compile(p, "truncation.continuation_markers"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            min_chars,
            require_terminal_punctuation,
            continuation_markers,
        })
    }

    /// `latest` is the newest reply; `total_chars` counts every turn so far.
    pub fn is_truncated(&self, latest: &str, total_chars: usize) -> bool {
        if self
            .continuation_markers
            .iter()
            .any(|marker| marker.is_match(latest))
        {
            return true;
        }

        if total_chars < self.min_chars {
            return true;
        }

        if self.require_terminal_punctuation {
            return match latest.trim_end().chars().last() {
                Some(last) => !TERMINATORS.contains(&last),
                None => true,
            };
        }

        false
    }
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        Self {
            min_chars: 0,
            require_terminal_punctuation: true,
            continuation_markers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
    Auth,
}

impl std::str::FromStr for FailureKind {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "auth" => Ok(FailureKind::Auth),
            other => Err(WriterError::InvalidConfigValueError {
                field: "failure_rules.kind".to_string(),
                value: other.to_string(),
                reason: "Expected one of: transient, permanent, auth".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureRule {
    pub pattern: Regex,
    pub kind: FailureKind,
    pub reason: String,
}

impl FailureRule {
    pub fn new(pattern: &str, kind: FailureKind, reason: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern, "failure_rules.pattern")?,
            kind,
            reason: reason.to_string(),
        })
    }

    fn to_error(&self) -> SessionError {
        match self.kind {
            FailureKind::Transient => SessionError::PageAnomaly {
                reason: self.reason.clone(),
                transient: true,
            },
            FailureKind::Permanent => SessionError::Platform {
                reason: self.reason.clone(),
            },
            FailureKind::Auth => SessionError::Auth {
                reason: self.reason.clone(),
            },
        }
    }
}

/// Rules applied when a platform profile does not list its own.
pub fn default_failure_rules() -> Vec<FailureRule> {
    let rules: [(&str, FailureKind, &str); 5] = [
        (
            r"(?i)(log ?in|sign ?in) (to continue|required)|请先登录|請先登入",
            FailureKind::Auth,
            "login wall",
        ),
        (
            r"(?i)(unauthori[sz]ed|session expired)",
            FailureKind::Auth,
            "authentication expired",
        ),
        (
            r"(?i)(rate limit|too many requests|请求过于频繁)",
            FailureKind::Transient,
            "rate limited",
        ),
        (
            r"(?i)(something went wrong|network error|网络错误)",
            FailureKind::Transient,
            "transient page error",
        ),
        (
            r"(?i)(usage limit reached|out of (points|credits)|额度已用完)",
            FailureKind::Permanent,
            "platform quota exhausted",
        ),
    ];

    rules
        .iter()
        .filter_map(|(pattern, kind, reason)| FailureRule::new(pattern, *kind, reason).ok())
        .collect()
}

/// 平台 + 模型的完整行為設定
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    pub platform: String,
    pub model: String,
    pub prompt_template: String,
    pub continuation_prompt: String,
    pub truncation: TruncationPolicy,
    /// Matched against page notices only.
    pub notice_rules: Vec<FailureRule>,
    /// Matched against the reply text as well; keep these specific.
    pub response_rules: Vec<FailureRule>,
    pub poll: PollPolicy,
    pub retry: RetryPolicy,
    pub max_turns: usize,
}

impl PlatformProfile {
    pub fn new(platform: &str, model: &str) -> Self {
        Self {
            platform: platform.to_string(),
            model: model.to_string(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
            truncation: TruncationPolicy::default(),
            notice_rules: default_failure_rules(),
            response_rules: Vec::new(),
            poll: PollPolicy::default(),
            retry: RetryPolicy::default(),
            max_turns: 5,
        }
    }

    pub fn render_prompt(&self, title: &str) -> String {
        if self.prompt_template.contains(TITLE_PLACEHOLDER) {
            self.prompt_template.replace(TITLE_PLACEHOLDER, title)
        } else {
            format!("{}\n\nTitle: {}", self.prompt_template.trim_end(), title)
        }
    }

    pub fn render_continuation(&self, title: &str) -> String {
        self.continuation_prompt.replace(TITLE_PLACEHOLDER, title)
    }

    /// 依序檢查頁面提示與回覆內容，命中規則即回傳對應的失敗
    pub fn classify(&self, notice: Option<&str>, response: Option<&str>) -> Option<SessionError> {
        if let Some(notice) = notice.filter(|n| !n.trim().is_empty()) {
            if let Some(rule) = self
                .notice_rules
                .iter()
                .chain(self.response_rules.iter())
                .find(|rule| rule.pattern.is_match(notice))
            {
                return Some(rule.to_error());
            }
        }

        let response = response?;
        self.response_rules
            .iter()
            .find(|rule| rule.pattern.is_match(response))
            .map(FailureRule::to_error)
    }
}

fn compile(pattern: &str, field: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| WriterError::InvalidConfigValueError {
        field: field.to_string(),
        value: pattern.to_string(),
        reason: format!("Invalid regular expression: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_sentence_is_not_truncated() {
        let policy = TruncationPolicy::default();
        assert!(!policy.is_truncated("Bread needs time to rise.", 25));
        assert!(!policy.is_truncated("麵包需要時間發酵。", 9));
    }

    #[test]
    fn test_mid_sentence_is_truncated() {
        let policy = TruncationPolicy::default();
        assert!(policy.is_truncated("Knead the dough until it becomes", 32));
        assert!(policy.is_truncated("   ", 0));
    }

    #[test]
    fn test_terminal_punctuation_can_be_disabled() {
        let policy = TruncationPolicy {
            require_terminal_punctuation: false,
            ..Default::default()
        };
        assert!(!policy.is_truncated("Knead the dough until it becomes", 32));
    }

    #[test]
    fn test_continuation_marker_wins_over_punctuation() {
        let policy =
            TruncationPolicy::from_patterns(0, true, &[r"(?i)\[to be continued\]".to_string()])
                .unwrap();
        assert!(policy.is_truncated("First half.\n\n[To be continued]", 30));
    }

    #[test]
    fn test_min_chars_uses_accumulated_length() {
        let policy = TruncationPolicy {
            min_chars: 800,
            ..Default::default()
        };
        assert!(policy.is_truncated("Short but complete.", 400));
        assert!(!policy.is_truncated("Short but complete.", 900));
    }

    #[test]
    fn test_bad_marker_pattern_names_the_field() {
        let err = TruncationPolicy::from_patterns(0, true, &["(unclosed".to_string()]).unwrap_err();
        match err {
            WriterError::InvalidConfigValueError { field, value, .. } => {
                assert_eq!(field, "truncation.continuation_markers");
                assert_eq!(value, "(unclosed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_render_prompt() {
        let mut profile = PlatformProfile::new("poe", "gpt-4.1");
        profile.prompt_template = "Write about {title} in depth.".to_string();
        assert_eq!(
            profile.render_prompt("How to Bake Bread"),
            "Write about How to Bake Bread in depth."
        );

        profile.prompt_template = "Write an article.".to_string();
        assert_eq!(
            profile.render_prompt("Rye"),
            "Write an article.\n\nTitle: Rye"
        );
    }

    #[test]
    fn test_classify_notices() {
        let profile = PlatformProfile::new("poe", "gpt-4.1");

        let err = profile
            .classify(Some("Please log in to continue"), None)
            .unwrap();
        assert!(matches!(err, SessionError::Auth { .. }));

        let err = profile
            .classify(Some("Too many requests, slow down"), None)
            .unwrap();
        assert!(err.is_transient());

        assert!(profile
            .classify(None, Some("Rate limiting in bakeries is rare."))
            .is_none());
    }

    #[test]
    fn test_response_rules_match_reply_text() {
        let mut profile = PlatformProfile::new("monica", "claude");
        profile.response_rules =
            vec![FailureRule::new(r"^I can't help with that", FailureKind::Permanent, "refused").unwrap()];
        let err = profile
            .classify(None, Some("I can't help with that request."))
            .unwrap();
        assert_eq!(
            err,
            SessionError::Platform {
                reason: "refused".to_string()
            }
        );
    }
}
