use crate::config::toml_config::{SelectorConfig, WriterConfig};
use crate::domain::ports::{BrowserDriver, SessionHandle};
use crate::utils::error::{Result, WriterError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const SUBMIT_SCRIPT: &str = r#"
const [inputXp, sendXp, text] = arguments;
const find = (xp) => xp
  ? document.evaluate(xp, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue
  : null;
const input = find(inputXp);
if (!input) return 'missing-input';
input.focus();
if (input.tagName === 'TEXTAREA' || input.tagName === 'INPUT') {
  const proto = input.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  Object.getOwnPropertyDescriptor(proto, 'value').set.call(input, text);
} else {
  input.textContent = text;
}
input.dispatchEvent(new Event('input', { bubbles: true }));
const send = find(sendXp);
if (send && !send.disabled) {
  send.click();
  return 'clicked';
}
input.dispatchEvent(new KeyboardEvent('keydown', { key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true }));
return 'enter';
"#;

const LAST_RESPONSE_SCRIPT: &str = r#"
const nodes = document.evaluate(arguments[0], document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
if (nodes.snapshotLength === 0) return null;
const last = nodes.snapshotItem(nodes.snapshotLength - 1);
return last.innerHTML || last.innerText || last.textContent || '';
"#;

const EXISTS_SCRIPT: &str = r#"
return document.evaluate(arguments[0], document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue !== null;
"#;

const NOTICE_SCRIPT: &str = r#"
const node = document.evaluate(arguments[0], document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
if (!node) return null;
const text = (node.innerText || node.textContent || '').trim();
return text.length > 0 ? text : null;
"#;

/// 平台頁面元素的 XPath
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSelectors {
    pub chat_input: String,
    /// Without a send button the prompt is submitted with Enter.
    pub send_button: Option<String>,
    pub stop_button: Option<String>,
    pub last_response: String,
    pub notice: Option<String>,
}

impl PageSelectors {
    pub fn from_config(platform: &str, config: &SelectorConfig) -> Result<Self> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| WriterError::MissingConfigError {
                    field: format!("platforms.{}.selectors.{}", platform, name),
                })
        };

        Ok(Self {
            chat_input: required(&config.chat_input, "chat_input")?,
            send_button: config.send_button.clone(),
            stop_button: config.stop_button.clone(),
            last_response: required(&config.last_response, "last_response")?,
            notice: config.notice.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    value: Value,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// W3C WebDriver 客戶端，連線到已在執行的 chromedriver
#[derive(Debug, Clone)]
pub struct WebDriverBrowser {
    client: Client,
    endpoint: String,
    selectors: PageSelectors,
    headless: bool,
    user_data_dir: Option<String>,
}

impl WebDriverBrowser {
    pub fn new(endpoint: &str, selectors: PageSelectors, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            selectors,
            headless: false,
            user_data_dir: None,
        })
    }

    pub fn from_config(config: &WriterConfig) -> Result<Self> {
        let selectors = PageSelectors::from_config(&config.run.platform, &config.selectors())?;
        let timeout = Duration::from_secs(config.webdriver.request_timeout_secs.unwrap_or(30));
        Ok(Self::new(config.webdriver_endpoint(), selectors, timeout)?
            .headless(config.webdriver.headless.unwrap_or(false))
            .user_data_dir(config.webdriver.user_data_dir.clone()))
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn user_data_dir(mut self, dir: Option<String>) -> Self {
        self.user_data_dir = dir;
        self
    }

    pub fn selectors(&self) -> &PageSelectors {
        &self.selectors
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--window-size=1366,900".to_string()];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(dir) = &self.user_data_dir {
            args.push(format!("--user-data-dir={}", dir));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("WebDriver {} -> {}", what, status);

        let body: WireResponse = response.json().await?;
        if status.is_success() {
            return Ok(body.value);
        }

        let error = body.value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        let message = body.value.get("message").and_then(Value::as_str).unwrap_or_default();
        Err(WriterError::ProcessingError {
            message: format!("WebDriver {} failed ({}): {} {}", what, status, error, message),
        })
    }

    async fn execute(&self, session: &SessionHandle, script: &str, args: Value) -> Result<Value> {
        let url = format!("{}/session/{}/execute/sync", self.endpoint, session.id);
        self.send(
            self.client.post(url).json(&json!({ "script": script, "args": args })),
            "execute",
        )
        .await
    }

    async fn element_exists(&self, session: &SessionHandle, xpath: &str) -> Result<bool> {
        let value = self.execute(session, EXISTS_SCRIPT, json!([xpath])).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    async fn open_session(&self, url: &str) -> Result<SessionHandle> {
        let value = self
            .send(
                self.client
                    .post(format!("{}/session", self.endpoint))
                    .json(&self.capabilities()),
                "new session",
            )
            .await?;
        let created: NewSession = serde_json::from_value(value)?;
        let handle = SessionHandle::new(created.session_id);
        tracing::info!("🌐 Browser session {} opened, navigating to {}", handle.id, url);

        let navigate = self.send(
            self.client
                .post(format!("{}/session/{}/url", self.endpoint, handle.id))
                .json(&json!({ "url": url })),
            "navigate",
        );
        if let Err(e) = navigate.await {
            if let Err(close_err) = self.close_session(handle).await {
                tracing::warn!("Failed to close session after navigation error: {}", close_err);
            }
            return Err(e);
        }
        Ok(handle)
    }

    async fn submit_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let args = json!([self.selectors.chat_input, self.selectors.send_button, text]);
        let outcome = self.execute(session, SUBMIT_SCRIPT, args).await?;
        match outcome.as_str() {
            Some("missing-input") => Err(WriterError::ProcessingError {
                message: format!("Chat input not found: {}", self.selectors.chat_input),
            }),
            Some(how) => {
                tracing::debug!("Prompt submitted ({}), {} chars", how, text.chars().count());
                Ok(())
            }
            None => Err(WriterError::ProcessingError {
                message: format!("Unexpected submit result: {}", outcome),
            }),
        }
    }

    async fn read_latest_response(&self, session: &SessionHandle) -> Result<Option<String>> {
        let value = self
            .execute(session, LAST_RESPONSE_SCRIPT, json!([self.selectors.last_response]))
            .await?;
        // blank text is returned as-is
        Ok(value.as_str().map(str::to_string))
    }

    async fn close_session(&self, session: SessionHandle) -> Result<()> {
        self.send(
            self.client
                .delete(format!("{}/session/{}", self.endpoint, session.id)),
            "delete session",
        )
        .await?;
        tracing::debug!("Browser session {} closed", session.id);
        Ok(())
    }

    async fn is_generating(&self, session: &SessionHandle) -> Result<bool> {
        match &self.selectors.stop_button {
            Some(xpath) => self.element_exists(session, xpath).await,
            None => Ok(false),
        }
    }

    async fn read_page_notice(&self, session: &SessionHandle) -> Result<Option<String>> {
        let Some(xpath) = &self.selectors.notice else {
            return Ok(None);
        };
        let value = self.execute(session, NOTICE_SCRIPT, json!([xpath])).await?;
        Ok(value.as_str().map(str::to_string))
    }
}
