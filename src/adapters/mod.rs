// Adapters: concrete implementations of the domain ports (browser, object storage, file output)

pub mod object_store;
pub mod storage;
pub mod webdriver;
