pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::{PlatformCatalog, WriterConfig};

#[cfg(feature = "s3")]
pub use adapters::object_store::S3ObjectStore;
pub use adapters::{
    object_store::LocalObjectStore, storage::LocalStorage, webdriver::WebDriverBrowser,
};

pub use core::progress::ProgressStore;
pub use core::{BatchReport, BatchRunner};
pub use utils::error::{Result, SessionError, WriterError};
