//! Mocks and fixtures shared by the weft crates' tests.

pub mod fixtures;
mod handlers;
mod sinks;

pub use handlers::{CostlyHandler, CountingHandler, EchoHandler, FailingHandler, FlakyHandler, SlowHandler};
pub use sinks::{Delivery, RecordingNotifier, RecordingSink};

use std::path::PathBuf;

use tempfile::TempDir;
use weft_core::config::AppConfig;

/// Parse an `AppConfig` from inline TOML, panicking on bad input.
pub fn config_from_toml(toml_src: &str) -> AppConfig {
    toml::from_str(toml_src).expect("test config must parse")
}

/// Write `contents` to `weft.toml` in a fresh temp dir.
///
/// Keep the returned `TempDir` alive for as long as the file is needed.
pub fn config_file(contents: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("weft.toml");
    std::fs::write(&path, contents).expect("write config");
    (dir, path)
}
