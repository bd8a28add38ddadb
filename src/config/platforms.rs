use crate::utils::error::{Result, WriterError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// platform -> (model -> base_url)
pub type PlatformTable = BTreeMap<String, BTreeMap<String, String>>;

/// 平台/模型對應網址表，例如：
///
/// ```json
/// { "poe": { "gpt-4.1": "https://poe.com/GPT-4.1" } }
/// ```
///
/// The pipeline only reads it; `reload` re-reads the backing file when the
/// surrounding application edits it.
#[derive(Debug, Clone)]
pub struct PlatformCatalog {
    table: PlatformTable,
    source: Option<PathBuf>,
}

impl PlatformCatalog {
    pub fn from_table(table: PlatformTable) -> Self {
        Self {
            table,
            source: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = Self::read_table(&path)?;
        Ok(Self {
            table,
            source: Some(path),
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let table = serde_json::from_str(content).map_err(|e| WriterError::ConfigError {
            message: format!("Invalid platform/model table: {}", e),
        })?;
        Ok(Self::from_table(table))
    }

    fn read_table(path: &Path) -> Result<PlatformTable> {
        let content = std::fs::read_to_string(path).map_err(|e| WriterError::ConfigError {
            message: format!("Cannot read platform/model table {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| WriterError::ConfigError {
            message: format!("Invalid platform/model table {}: {}", path.display(), e),
        })
    }

    /// Re-reads the backing file. On error the previous table is kept.
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let table = Self::read_table(path)?;
        tracing::info!(
            "Reloaded platform table from {} ({} platforms)",
            path.display(),
            table.len()
        );
        self.table = table;
        Ok(())
    }

    pub fn resolve(&self, platform: &str, model: &str) -> Result<String> {
        let models = self
            .table
            .get(platform)
            .ok_or_else(|| WriterError::ConfigError {
                message: format!(
                    "Unknown platform '{}'. Known platforms: {}",
                    platform,
                    self.platforms().join(", ")
                ),
            })?;

        match models.get(model) {
            Some(url) if !url.trim().is_empty() => Ok(url.clone()),
            Some(_) => Err(WriterError::ConfigError {
                message: format!("Platform '{}' model '{}' has an empty URL", platform, model),
            }),
            None => Err(WriterError::ConfigError {
                message: format!(
                    "Unknown model '{}' for platform '{}'. Known models: {}",
                    model,
                    platform,
                    models.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            }),
        }
    }

    pub fn platforms(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    pub fn models(&self, platform: &str) -> Vec<String> {
        self.table
            .get(platform)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABLE: &str = r#"{
        "poe": {"gpt-4.1": "https://poe.com/GPT-4.1", "claude": "https://poe.com/Claude"},
        "monica": {"gpt-4o": "https://monica.im/home/chat/gpt-4o"}
    }"#;

    #[test]
    fn test_resolve_known_pair() {
        let catalog = PlatformCatalog::from_json_str(TABLE).unwrap();
        assert_eq!(
            catalog.resolve("poe", "gpt-4.1").unwrap(),
            "https://poe.com/GPT-4.1"
        );
        assert_eq!(catalog.platforms(), vec!["monica", "poe"]);
        assert_eq!(catalog.models("poe"), vec!["claude", "gpt-4.1"]);
    }

    #[test]
    fn test_resolve_missing_pair_is_config_error() {
        let catalog = PlatformCatalog::from_json_str(TABLE).unwrap();
        let err = catalog.resolve("poe", "o3").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Unknown model 'o3'"));
        assert!(catalog.resolve("chatgpt", "gpt-4.1").is_err());
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"poe": {"gpt-4.1": "https://poe.com/old"}}"#)
            .unwrap();
        let mut catalog = PlatformCatalog::from_file(file.path()).unwrap();
        assert_eq!(catalog.resolve("poe", "gpt-4.1").unwrap(), "https://poe.com/old");

        std::fs::write(
            file.path(),
            r#"{"poe": {"gpt-4.1": "https://poe.com/new"}}"#,
        )
        .unwrap();
        catalog.reload().unwrap();
        assert_eq!(catalog.resolve("poe", "gpt-4.1").unwrap(), "https://poe.com/new");
    }

    #[test]
    fn test_failed_reload_keeps_previous_table() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"poe": {"gpt-4.1": "https://poe.com/a"}}"#)
            .unwrap();
        let mut catalog = PlatformCatalog::from_file(file.path()).unwrap();

        std::fs::write(file.path(), "not json").unwrap();
        assert!(catalog.reload().is_err());
        assert_eq!(catalog.resolve("poe", "gpt-4.1").unwrap(), "https://poe.com/a");
    }
}
