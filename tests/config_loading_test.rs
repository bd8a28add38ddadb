use auto_writer::adapters::webdriver::WebDriverBrowser;
use auto_writer::utils::validation::Validate;
use auto_writer::{PlatformCatalog, WriterConfig, WriterError};
use std::path::PathBuf;

fn repo_file(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(name)
}

#[test]
fn test_example_config_is_valid() -> anyhow::Result<()> {
    std::env::set_var("IMAGE_BASE_URL", "https://img.example.com/articles");
    let config = WriterConfig::from_file(repo_file("auto-writer.example.toml"))?;
    config.validate()?;

    assert_eq!(config.upload.public_base_url.as_deref(), Some("https://img.example.com/articles"));

    let profile = config.profile()?;
    assert_eq!(profile.truncation.min_chars, 1500);
    assert_eq!(profile.truncation.continuation_markers.len(), 2);
    assert!(profile.render_prompt("如何烤面包").contains("「如何烤面包」"));
    assert_eq!(profile.continuation_prompt, "继续");

    let policy = config.image_policy();
    assert_eq!(policy.crop_bottom_px, 80);
    assert!(policy
        .keep_prefixes
        .contains(&"https://img.example.com/articles".to_string()));

    let browser = WebDriverBrowser::from_config(&config)?;
    assert!(browser.selectors().notice.is_some());
    Ok(())
}

#[test]
fn test_model_override_and_second_platform() -> anyhow::Result<()> {
    let mut config = WriterConfig::from_file(repo_file("auto-writer.example.toml"))?;

    config.run.model = "claude-sonnet-4".to_string();
    let profile = config.profile()?;
    assert_eq!(profile.continuation_prompt, "Please continue exactly where you stopped.");

    config.run.platform = "monica".to_string();
    config.run.model = "gpt-4.1".to_string();
    let profile = config.profile()?;
    assert_eq!(profile.notice_rules.len(), 1);
    assert!(WebDriverBrowser::from_config(&config)?.selectors().notice.is_none());
    Ok(())
}

#[test]
fn test_example_catalog_resolves_configured_pairs() -> anyhow::Result<()> {
    let catalog = PlatformCatalog::from_file(repo_file("model_config.example.json"))?;

    assert_eq!(catalog.resolve("poe", "gpt-4.1")?, "https://poe.com/GPT-4.1");
    assert!(catalog.resolve("monica", "gpt-4.1")?.starts_with("https://monica.im/"));
    assert!(matches!(
        catalog.resolve("monica", "claude-sonnet-4"),
        Err(WriterError::ConfigError { .. })
    ));
    Ok(())
}

#[test]
fn test_missing_selectors_are_reported_by_field() {
    let config = WriterConfig::from_toml_str(
        r#"
[run]
platform = "deepseek"
model = "chat"
catalog_path = "model_config.json"
titles_path = "titles.txt"
output_path = "out"

[upload]
public_base_url = "https://cdn.example.com"
"#,
    )
    .unwrap();

    match WebDriverBrowser::from_config(&config) {
        Err(WriterError::MissingConfigError { field }) => {
            assert_eq!(field, "platforms.deepseek.selectors.chat_input")
        }
        other => panic!("expected missing selector, got {:?}", other.map(|_| ())),
    }
}
