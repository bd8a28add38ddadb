use crate::config::{PlatformCatalog, WriterConfig};
use crate::core::assembler::{join_turns, ArticleAssembler};
use crate::core::images::ImagePipeline;
use crate::core::policy::PlatformProfile;
use crate::core::progress::{ProgressStore, ProgressSummary};
use crate::core::session::SessionDriver;
use crate::domain::model::{TitleEntry, TitleStatus};
use crate::domain::ports::{BrowserDriver, ObjectStore, Storage};
use crate::utils::error::{Result, WriterError};
use crate::utils::monitor::SystemMonitor;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleOutcome {
    pub index: usize,
    pub title: String,
    pub status: TitleStatus,
    pub note: String,
    pub output_path: Option<String>,
}

/// 一次批次執行的結果
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<TitleOutcome>,
    /// Store-wide counts after the run.
    pub summary: ProgressSummary,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TitleStatus::Done)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TitleStatus::Failed)
            .count()
    }
}

/// 開跑前的準備結果
#[derive(Debug)]
pub struct PreparedBatch {
    pub profile: PlatformProfile,
    pub base_url: String,
    pub store: ProgressStore,
}

/// Resolves the platform and model first; the progress file is only loaded
/// (and possibly rewritten) once the pair is known to exist.
pub fn prepare(config: &WriterConfig, catalog: &PlatformCatalog) -> Result<PreparedBatch> {
    let profile = config.profile()?;
    let base_url = catalog.resolve(&profile.platform, &profile.model)?;
    tracing::info!(
        "Platform {} / model {} -> {}",
        profile.platform,
        profile.model,
        base_url
    );

    let store = ProgressStore::load(Path::new(&config.run.titles_path), &config.progress_path())?
        .with_max_attempts(config.run.max_title_attempts);
    Ok(PreparedBatch {
        profile,
        base_url,
        store,
    })
}

/// 逐一處理待辦標題：會話 → 圖片 → 組裝 → 寫檔 → 更新進度
///
/// A single title's failure is recorded and the batch moves on; only
/// persistence failures stop the run.
pub struct BatchRunner<B: BrowserDriver, U: ObjectStore, S: Storage> {
    session: SessionDriver<B>,
    images: ImagePipeline<U>,
    assembler: ArticleAssembler<S>,
    cancel: CancellationToken,
    monitor: SystemMonitor,
}

impl<B: BrowserDriver, U: ObjectStore, S: Storage> BatchRunner<B, U, S> {
    pub fn new(
        session: SessionDriver<B>,
        images: ImagePipeline<U>,
        assembler: ArticleAssembler<S>,
    ) -> Self {
        Self {
            session,
            images,
            assembler,
            cancel: CancellationToken::new(),
            monitor: SystemMonitor::new(false),
        }
    }

    /// The same token must be handed to the session driver for in-title cancellation.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = SystemMonitor::new(enabled);
        self
    }

    pub async fn run(&self, store: &mut ProgressStore) -> Result<BatchReport> {
        let start = store.summary();
        tracing::info!(
            "🚀 Starting batch: {} title(s), {} done, {} pending, {} failed",
            start.total(),
            start.done,
            start.pending,
            start.failed
        );

        let mut report = BatchReport::default();
        loop {
            if self.cancel.is_cancelled() {
                tracing::warn!("Stop requested; not starting further titles");
                report.cancelled = true;
                break;
            }

            let Some(entry) = store.claim_next()? else {
                break;
            };

            let outcome = self.process_title(&entry).await;
            store.mark(entry.index, outcome.status, &outcome.note)?;
            self.monitor
                .log_stats(&format!("Title #{} {}", entry.index, outcome.status));
            report.outcomes.push(outcome);
        }

        report.summary = store.summary();
        tracing::info!(
            "🏁 Batch finished at {}: {} done, {} failed this run ({} done / {} total overall)",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            report.succeeded(),
            report.failed(),
            report.summary.done,
            report.summary.total()
        );
        self.monitor.log_final_stats();
        Ok(report)
    }

    async fn process_title(&self, entry: &TitleEntry) -> TitleOutcome {
        tracing::info!(
            "--- Title #{} (attempt {}): {} ---",
            entry.index,
            entry.attempt_count,
            entry.text
        );

        match self.generate(entry).await {
            Ok((output_path, note)) => TitleOutcome {
                index: entry.index,
                title: entry.text.clone(),
                status: TitleStatus::Done,
                note,
                output_path: Some(output_path),
            },
            Err(e) => {
                tracing::error!(
                    "❌ Title #{} '{}' failed: {} ({})",
                    entry.index,
                    entry.text,
                    e,
                    e.recovery_suggestion()
                );
                TitleOutcome {
                    index: entry.index,
                    title: entry.text.clone(),
                    status: TitleStatus::Failed,
                    note: e.to_string(),
                    output_path: None,
                }
            }
        }
    }

    async fn generate(&self, entry: &TitleEntry) -> Result<(String, String)> {
        let run = self.session.run(&entry.text).await.map_err(WriterError::from)?;
        let turns = &run.session.turns;

        let report = self.images.process(&join_turns(turns)).await;
        let note = report.failure_note().unwrap_or_default();
        if !note.is_empty() {
            tracing::warn!("'{}': {}", entry.text, note);
        }

        let article = self.assembler.assemble(&entry.text, turns, &report.references);
        let output_path = self.assembler.write(&article).await?;
        Ok((output_path, note))
    }
}
