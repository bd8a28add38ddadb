use crate::domain::model::{TitleEntry, TitleStatus};
use crate::utils::error::{Result, WriterError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Status values in a title sheet that mean "already written".
const DONE_MARKERS: &[&str] = &["done", "文章已创作", "文章已創作"];
const HEADER_NAMES: &[&str] = &["title", "Title", "TITLE", "标题", "標題"];

#[derive(Debug, Serialize, Deserialize)]
struct ProgressRecord {
    index: usize,
    text: String,
    status: TitleStatus,
    attempt_count: u32,
    #[serde(default)]
    note: String,
}

impl From<&TitleEntry> for ProgressRecord {
    fn from(entry: &TitleEntry) -> Self {
        Self {
            index: entry.index,
            text: entry.text.clone(),
            status: entry.status,
            attempt_count: entry.attempt_count,
            note: entry.note.clone(),
        }
    }
}

impl From<ProgressRecord> for TitleEntry {
    fn from(record: ProgressRecord) -> Self {
        Self {
            index: record.index,
            text: record.text,
            status: record.status,
            attempt_count: record.attempt_count,
            note: record.note,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl ProgressSummary {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// 讀取標題來源：`.txt` 每行一個標題；`.csv` 第一欄為標題，第二欄可選為狀態
pub fn load_titles(source: &Path) -> Result<Vec<TitleEntry>> {
    let is_csv = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let raw = std::fs::read(source)?;
    let content = String::from_utf8_lossy(&raw);
    let content = content.trim_start_matches('\u{feff}');

    if !is_csv {
        return Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(index, line)| TitleEntry::pending(index, line))
            .collect());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut titles = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let Some(text) = record.get(0).map(str::trim).filter(|t| !t.is_empty()) else {
            continue;
        };
        if row == 0 && HEADER_NAMES.contains(&text) {
            continue;
        }

        let mut entry = TitleEntry::pending(titles.len(), text);
        if let Some(status) = record.get(1).map(str::trim) {
            if DONE_MARKERS.contains(&status) {
                entry.status = TitleStatus::Done;
                entry.note = "marked done in title source".to_string();
            }
        }
        titles.push(entry);
    }

    Ok(titles)
}

/// 每個標題的處理進度，每次狀態變更後立即寫回磁碟
///
/// Writes go to a temporary file in the same directory which is fsynced and
/// renamed over the progress file, so an interrupted run leaves either the
/// previous or the new checkpoint on disk, never a torn one.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    entries: Vec<TitleEntry>,
    /// Indices claimed during this run; failed ones are not retried until the next run.
    attempted: HashSet<usize>,
    max_attempts: Option<u32>,
}

impl ProgressStore {
    /// Loads titles from `source`, overlaying any checkpoint already at `progress_path`.
    pub fn load(source: &Path, progress_path: &Path) -> Result<Self> {
        let titles = load_titles(source)?;
        let mut merged: BTreeMap<usize, TitleEntry> = BTreeMap::new();

        if progress_path.exists() {
            for record in Self::read_records(progress_path)? {
                let entry: TitleEntry = record.into();
                merged.insert(entry.index, entry);
            }
            tracing::info!(
                "Resuming from checkpoint {} ({} entries)",
                progress_path.display(),
                merged.len()
            );
        }

        for title in titles {
            match merged.get(&title.index) {
                Some(existing) if existing.text != title.text => {
                    tracing::warn!(
                        "Title #{} changed in source ('{}' -> '{}'); keeping checkpointed entry",
                        title.index,
                        existing.text,
                        title.text
                    );
                }
                Some(_) => {}
                None => {
                    merged.insert(title.index, title);
                }
            }
        }

        let mut entries: Vec<TitleEntry> = merged.into_values().collect();
        for entry in entries.iter_mut() {
            if entry.status == TitleStatus::InProgress {
                tracing::warn!(
                    "Title #{} '{}' was interrupted mid-run; requeueing",
                    entry.index,
                    entry.text
                );
                entry.status = TitleStatus::Pending;
            }
        }

        Ok(Self::from_entries(progress_path, entries))
    }

    pub fn from_entries(path: &Path, entries: Vec<TitleEntry>) -> Self {
        Self {
            path: path.to_path_buf(),
            entries,
            attempted: HashSet::new(),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn read_records(path: &Path) -> Result<Vec<ProgressRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records: Vec<ProgressRecord> = Vec::new();
        for record in reader.deserialize() {
            records.push(record?);
        }
        Ok(records)
    }

    pub fn entries(&self) -> &[TitleEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&TitleEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    fn is_claimable(&self, entry: &TitleEntry) -> bool {
        match entry.status {
            TitleStatus::Pending => true,
            TitleStatus::Failed => {
                !self.attempted.contains(&entry.index)
                    && self
                        .max_attempts
                        .map(|max| entry.attempt_count < max)
                        .unwrap_or(true)
            }
            TitleStatus::InProgress | TitleStatus::Done => false,
        }
    }

    pub fn next_pending(&self) -> Option<&TitleEntry> {
        self.entries.iter().find(|e| self.is_claimable(e))
    }

    /// Compare-and-set claim: only a claimable entry moves to `in_progress`.
    pub fn claim(&mut self, index: usize) -> Result<bool> {
        if let Some(busy) = self
            .entries
            .iter()
            .find(|e| e.status == TitleStatus::InProgress)
        {
            return Err(WriterError::ProcessingError {
                message: format!("title #{} is already in progress", busy.index),
            });
        }

        let Some(position) = self.entries.iter().position(|e| e.index == index) else {
            return Ok(false);
        };
        if !self.is_claimable(&self.entries[position]) {
            return Ok(false);
        }

        let entry = &mut self.entries[position];
        entry.status = TitleStatus::InProgress;
        entry.attempt_count += 1;
        entry.note.clear();
        self.attempted.insert(index);
        self.persist()?;
        Ok(true)
    }

    pub fn claim_next(&mut self) -> Result<Option<TitleEntry>> {
        let Some(index) = self.next_pending().map(|e| e.index) else {
            return Ok(None);
        };
        if !self.claim(index)? {
            return Ok(None);
        }
        Ok(self.get(index).cloned())
    }

    /// 更新狀態並立即持久化；已完成的標題不可再變更
    pub fn mark(&mut self, index: usize, status: TitleStatus, note: &str) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.index == index)
            .ok_or_else(|| WriterError::ProcessingError {
                message: format!("unknown title index {}", index),
            })?;

        if entry.status == TitleStatus::Done && status != TitleStatus::Done {
            return Err(WriterError::ProcessingError {
                message: format!("title #{} is already done", index),
            });
        }

        tracing::debug!(
            "Title #{} status {} -> {}",
            index,
            entry.status,
            status
        );
        entry.status = status;
        entry.note = note.to_string();
        self.persist()
    }

    pub fn persist(&self) -> Result<()> {
        self.write_checkpoint().map_err(|e| WriterError::PersistenceError {
            message: format!("{}: {}", self.path.display(), e),
        })
    }

    fn write_checkpoint(&self) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for entry in &self.entries {
            writer.serialize(ProgressRecord::from(entry))?;
        }
        let data = writer.into_inner().map_err(|e| WriterError::ProcessingError {
            message: e.to_string(),
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary::default();
        for entry in &self.entries {
            match entry.status {
                TitleStatus::Pending => summary.pending += 1,
                TitleStatus::InProgress => summary.in_progress += 1,
                TitleStatus::Done => summary.done += 1,
                TitleStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
