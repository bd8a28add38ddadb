use auto_writer::core::assembler::ArticleAssembler;
use auto_writer::core::images::ImagePipeline;
use auto_writer::core::runner::{prepare, PreparedBatch};
use auto_writer::core::session::SessionDriver;
use auto_writer::domain::ports::ObjectStore;
use auto_writer::utils::error::{ErrorSeverity, WriterError};
use auto_writer::utils::{logger, validation::Validate};
use auto_writer::{
    BatchReport, BatchRunner, CliConfig, LocalObjectStore, LocalStorage, PlatformCatalog,
    ProgressStore, WebDriverBrowser, WriterConfig,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting auto-writer CLI");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    match run(&cli).await {
        Ok(Some(report)) => print_report(&report),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(
                "❌ Batch aborted: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}

async fn run(cli: &CliConfig) -> auto_writer::Result<Option<BatchReport>> {
    let mut config = WriterConfig::from_file(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    // 先確認平台與模型存在，任何進度檔變動都在這之後
    let catalog = PlatformCatalog::from_file(&config.run.catalog_path)?;
    let PreparedBatch {
        profile,
        base_url,
        mut store,
    } = prepare(&config, &catalog)?;

    if cli.dry_run {
        let summary = store.summary();
        println!(
            "🔎 Dry run: {} title(s), {} done, {} pending, {} failed",
            summary.total(),
            summary.done,
            summary.pending,
            summary.failed
        );
        for entry in store.entries() {
            println!("  #{:<4} {:<12} {}", entry.index, entry.status, entry.text);
        }
        return Ok(None);
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⏹️ Ctrl-C received; finishing the current title then stopping");
            signal_token.cancel();
        }
    });

    if cli.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    let browser = WebDriverBrowser::from_config(&config)?;
    let session = SessionDriver::new(browser, profile, base_url).with_cancellation(cancel.clone());

    let report = match config.upload_backend() {
        "local" => {
            let dir = config
                .upload
                .local_dir
                .clone()
                .unwrap_or_else(|| format!("{}/images", config.run.output_path));
            let public_base_url = config.upload.public_base_url.clone().unwrap_or_default();
            let object_store = LocalObjectStore::new(dir, &public_base_url);
            run_batch(&config, cli, session, object_store, cancel, &mut store).await?
        }
        #[cfg(feature = "s3")]
        "s3" => {
            let upload = &config.upload;
            let object_store = auto_writer::S3ObjectStore::from_env(
                upload.s3_bucket.as_deref().unwrap_or_default(),
                upload.s3_prefix.as_deref(),
                upload.s3_region.as_deref(),
                upload.public_base_url.as_deref(),
            )
            .await;
            run_batch(&config, cli, session, object_store, cancel, &mut store).await?
        }
        other => {
            return Err(WriterError::InvalidConfigValueError {
                field: "upload.backend".to_string(),
                value: other.to_string(),
                reason: "this build does not include that backend (enable the `s3` feature)"
                    .to_string(),
            })
        }
    };

    Ok(Some(report))
}

async fn run_batch<U: ObjectStore>(
    config: &WriterConfig,
    cli: &CliConfig,
    session: SessionDriver<WebDriverBrowser>,
    object_store: U,
    cancel: CancellationToken,
    store: &mut ProgressStore,
) -> auto_writer::Result<BatchReport> {
    let images = ImagePipeline::new(object_store, config.image_policy())
        .with_base_dir(&config.run.output_path);
    let assembler = ArticleAssembler::new(LocalStorage::new(&config.run.output_path));

    BatchRunner::new(session, images, assembler)
        .with_cancellation(cancel)
        .with_monitoring(cli.monitor)
        .run(store)
        .await
}

fn print_report(report: &BatchReport) {
    println!("\n📋 Run report");
    for outcome in &report.outcomes {
        let icon = match outcome.status {
            auto_writer::core::TitleStatus::Done => "✅",
            _ => "❌",
        };
        match &outcome.output_path {
            Some(path) if outcome.note.is_empty() => {
                println!("{} #{} {} -> {}", icon, outcome.index, outcome.title, path)
            }
            Some(path) => println!(
                "{} #{} {} -> {} ({})",
                icon, outcome.index, outcome.title, path, outcome.note
            ),
            None => println!("{} #{} {}: {}", icon, outcome.index, outcome.title, outcome.note),
        }
    }

    let summary = &report.summary;
    println!(
        "\n📊 {} done, {} failed this run | overall: {}/{} done, {} pending, {} failed",
        report.succeeded(),
        report.failed(),
        summary.done,
        summary.total(),
        summary.pending,
        summary.failed
    );
    if report.cancelled {
        println!("⏹️ Stopped early; re-run to continue with the remaining titles");
    } else if summary.failed > 0 {
        println!("💡 Re-run the same command to retry failed titles");
    }
}
