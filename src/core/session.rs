use crate::core::assembler::plain_text;
use crate::core::policy::PlatformProfile;
use crate::domain::model::{Session, Turn};
use crate::domain::ports::{BrowserDriver, SessionHandle};
use crate::utils::error::{SessionError, WriterError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prompting,
    AwaitingResponse,
    ResponseReceived,
    Continuing,
    Complete,
    Failed(SessionError),
}

/// 成功結束的會話，附帶嘗試次數與狀態轉移紀錄
#[derive(Debug, Clone)]
pub struct SessionRun {
    pub session: Session,
    pub attempts: u32,
    /// States visited by the successful attempt, in order.
    pub trace: Vec<SessionState>,
}

/// Drives one title through prompt → response → continuation cycles.
///
/// Each attempt opens a fresh browser session; transient failures restart
/// from `Idle` with the initial prompt instead of resuming mid-turn.
pub struct SessionDriver<B: BrowserDriver> {
    browser: B,
    profile: PlatformProfile,
    base_url: String,
    cancel: CancellationToken,
}

impl<B: BrowserDriver> SessionDriver<B> {
    pub fn new(browser: B, profile: PlatformProfile, base_url: String) -> Self {
        Self {
            browser,
            profile,
            base_url,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, title: &str) -> SessionResult<SessionRun> {
        let retry = &self.profile.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut trace = Vec::new();
            match self.attempt(title, &mut trace).await {
                Ok(session) => {
                    tracing::info!(
                        "✅ '{}' complete after {} turn(s), attempt {}",
                        title,
                        session.turns.len(),
                        attempt
                    );
                    return Ok(SessionRun {
                        session,
                        attempts: attempt,
                        trace,
                    });
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        "Attempt {}/{} for '{}' failed: {}. Restarting session in {:?}",
                        attempt,
                        retry.max_attempts,
                        title,
                        e,
                        delay
                    );
                    self.pause(delay).await?;
                }
                Err(e) => {
                    tracing::error!("❌ Session for '{}' failed: {}", title, e);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, title: &str, trace: &mut Vec<SessionState>) -> SessionResult<Session> {
        self.enter(trace, SessionState::Idle);
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let handle = self
            .browser
            .open_session(&self.base_url)
            .await
            .map_err(driver_error)?;

        let result = self.converse(&handle, title, trace).await;

        if let Err(e) = self.browser.close_session(handle).await {
            tracing::warn!("Failed to close browser session: {}", e);
        }

        if let Err(e) = &result {
            self.enter(trace, SessionState::Failed(e.clone()));
        }
        result
    }

    async fn converse(
        &self,
        handle: &SessionHandle,
        title: &str,
        trace: &mut Vec<SessionState>,
    ) -> SessionResult<Session> {
        let mut session = Session::new(&self.profile.platform, &self.profile.model, &self.base_url);
        let mut prompt = self.profile.render_prompt(title);
        let mut article_chars = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            self.enter(trace, SessionState::Prompting);
            self.browser
                .submit_text(handle, &prompt)
                .await
                .map_err(driver_error)?;

            self.enter(trace, SessionState::AwaitingResponse);
            let previous = session.turns.last().map(|t| t.response.as_str());
            let response = self.await_response(handle, previous).await?;

            self.enter(trace, SessionState::ResponseReceived);
            tracing::debug!(
                "Turn {} for '{}': {} chars",
                session.turns.len() + 1,
                title,
                response.chars().count()
            );
            let latest = plain_text(&response);
            article_chars += latest.chars().count();
            session.turns.push(Turn { prompt, response });

            if !self.profile.truncation.is_truncated(&latest, article_chars) {
                self.enter(trace, SessionState::Complete);
                return Ok(session);
            }

            if session.turns.len() >= self.profile.max_turns {
                return Err(SessionError::MaxTurns {
                    turns: session.turns.len(),
                });
            }

            self.enter(trace, SessionState::Continuing);
            prompt = self.profile.render_continuation(title);
        }
    }

    /// 輪詢直到回覆穩定；超過 max_wait 視為逾時
    async fn await_response(
        &self,
        handle: &SessionHandle,
        previous: Option<&str>,
    ) -> SessionResult<String> {
        let poll = &self.profile.poll;
        let started = Instant::now();
        let mut last_seen: Option<String> = None;
        let mut stable = 0u32;
        let mut saw_empty = false;

        loop {
            let notice = self
                .browser
                .read_page_notice(handle)
                .await
                .map_err(driver_error)?;
            let generating = self
                .browser
                .is_generating(handle)
                .await
                .map_err(driver_error)?;
            let text = self
                .browser
                .read_latest_response(handle)
                .await
                .map_err(driver_error)?;

            if let Some(err) = self.profile.classify(notice.as_deref(), text.as_deref()) {
                return Err(err);
            }

            let fresh = text.filter(|t| Some(t.as_str()) != previous);
            match fresh {
                Some(t) if !generating && !t.trim().is_empty() => {
                    if last_seen.as_deref() == Some(t.as_str()) {
                        stable += 1;
                    } else {
                        last_seen = Some(t);
                        stable = 1;
                    }
                    if stable >= poll.stable_polls {
                        return Ok(last_seen.unwrap_or_default());
                    }
                }
                Some(t) if !generating => {
                    saw_empty = t.trim().is_empty();
                    stable = 0;
                }
                _ => stable = 0,
            }

            if started.elapsed() >= poll.max_wait {
                return Err(if saw_empty {
                    SessionError::EmptyResponse
                } else {
                    SessionError::Timeout {
                        waited_secs: started.elapsed().as_secs(),
                    }
                });
            }

            self.pause(poll.interval).await?;
        }
    }

    async fn pause(&self, duration: Duration) -> SessionResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn enter(&self, trace: &mut Vec<SessionState>, state: SessionState) {
        tracing::debug!("session state -> {:?}", state);
        trace.push(state);
    }
}

fn driver_error(e: WriterError) -> SessionError {
    match e {
        WriterError::Session(inner) => inner,
        other => SessionError::Driver {
            message: other.to_string(),
        },
    }
}
