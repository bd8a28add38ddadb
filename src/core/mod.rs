pub mod assembler;
pub mod images;
pub mod policy;
pub mod progress;
pub mod runner;
pub mod session;

pub use crate::domain::model::{Article, TitleEntry, TitleStatus};
pub use crate::domain::ports::{BrowserDriver, ObjectStore, Storage};
pub use crate::utils::error::Result;
pub use runner::{BatchReport, BatchRunner, TitleOutcome};
