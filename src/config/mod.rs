pub mod platforms;
pub mod toml_config;

#[cfg(feature = "cli")]
use clap::Parser;

pub use platforms::PlatformCatalog;
pub use toml_config::WriterConfig;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "auto-writer")]
#[command(about = "Generate long-form articles by scripting a chat web app, resumably")]
pub struct CliConfig {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "auto-writer.toml")]
    pub config: String,

    /// Override run.platform
    #[arg(long)]
    pub platform: Option<String>,

    /// Override run.model
    #[arg(long)]
    pub model: Option<String>,

    /// Override run.titles_path
    #[arg(long)]
    pub titles: Option<String>,

    /// Override run.output_path
    #[arg(long)]
    pub output: Option<String>,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[arg(long, help = "Log CPU/memory usage after each title")]
    pub monitor: bool,

    /// Show what would be processed without opening a browser
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    /// 套用命令列覆蓋設定
    pub fn apply_overrides(&self, config: &mut WriterConfig) {
        if let Some(platform) = &self.platform {
            config.run.platform = platform.clone();
        }
        if let Some(model) = &self.model {
            config.run.model = model.clone();
        }
        if let Some(titles) = &self.titles {
            config.run.titles_path = titles.clone();
        }
        if let Some(output) = &self.output {
            config.run.output_path = output.clone();
        }
    }
}
