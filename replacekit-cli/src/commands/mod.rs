pub mod init_config;
pub mod parse;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Read a rule document, accepting `-` for stdin
pub fn read_document(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        return std::io::read_to_string(std::io::stdin()).context("Failed to read rules from stdin");
    }
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read rule document: {}", path.display()))
}
