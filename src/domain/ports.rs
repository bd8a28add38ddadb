use crate::utils::error::Result;
use async_trait::async_trait;

/// Opaque handle to one open browser chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// 瀏覽器自動化能力：開啟頁面、輸入文字、讀取最新回覆
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self, url: &str) -> Result<SessionHandle>;

    async fn submit_text(&self, session: &SessionHandle, text: &str) -> Result<()>;

    /// `None` while the page has not rendered any reply yet.
    async fn read_latest_response(&self, session: &SessionHandle) -> Result<Option<String>>;

    async fn close_session(&self, session: SessionHandle) -> Result<()>;

    /// Whether the page still shows a "stop generating" control.
    async fn is_generating(&self, _session: &SessionHandle) -> Result<bool> {
        Ok(false)
    }

    /// Text of any banner/alert the page currently shows (errors, login walls, limits).
    async fn read_page_notice(&self, _session: &SessionHandle) -> Result<Option<String>> {
        Ok(None)
    }
}

/// 上傳位元組並回傳公開 URL
pub trait ObjectStore: Send + Sync {
    fn upload(
        &self,
        data: &[u8],
        content_type: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    /// Either the whole file is written or the call fails; never a partial file.
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
