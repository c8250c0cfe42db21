use anyhow::Result;
use std::path::PathBuf;

use super::read_document;
use crate::output::format_rule;

pub fn run(rules: PathBuf, format: &crate::OutputFormat) -> Result<()> {
    let document = read_document(&rules)?;
    let parsed = replacekit::parse(&document);

    match format {
        crate::OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        crate::OutputFormat::Text => {
            println!("Parsed {} rule(s):", parsed.rules.len());
            for (index, rule) in parsed.rules.iter().enumerate() {
                println!("  {}", format_rule(index, rule));
            }

            if !parsed.issues.is_empty() {
                println!("\nMalformed lines:");
                for issue in &parsed.issues {
                    println!("  line {}: {} ({})", issue.line, issue.message, issue.content);
                }
            }

            let stats = &parsed.statistics;
            println!(
                "\n{} line(s): {} rule, {} comment, {} empty, {} malformed",
                stats.total_lines,
                stats.rule_lines,
                stats.comment_lines,
                stats.empty_lines,
                stats.malformed_lines
            );
        }
    }

    Ok(())
}
