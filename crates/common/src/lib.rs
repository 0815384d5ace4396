//! crmqa Common Library
//!
//! Task types, the error taxonomy and the SQLite task store shared by the
//! crmqa daemon.

pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// crmqa version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default demo CRM the scenarios run against
pub const DEFAULT_TARGET_URL: &str = "https://qacrmdemo.netlify.app";

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".crmqa")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
