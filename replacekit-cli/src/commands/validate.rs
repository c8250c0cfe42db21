use anyhow::Result;
use std::path::PathBuf;

use replacekit::rules::validate_with;
use replacekit::ReplaceConfig;

use super::read_document;
use crate::output::format_validation;

pub fn run(rules: PathBuf, config: &ReplaceConfig, format: &crate::OutputFormat) -> Result<()> {
    let document = read_document(&rules)?;
    let result = validate_with(&document, &config.validation);

    match format {
        crate::OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        crate::OutputFormat::Text => {
            print!("{}", format_validation(&result));
        }
    }

    if !result.invalid_rules.is_empty() {
        tracing::warn!("{} rule(s) failed validation", result.invalid_rules.len());
    }
    Ok(())
}
