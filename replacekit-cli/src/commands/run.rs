use anyhow::{bail, Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replacekit::{
    BatchReport, BatchService, DirectorySessionFiles, ProgressEvent, ProgressSnapshot,
    ReplaceConfig, ReplaceError, ReplacementEngine, SessionFiles,
};

use super::read_document;
use crate::output::{format_report, generate_preview, FilePreview};

pub async fn run(
    rules: PathBuf,
    root: PathBuf,
    session: String,
    preview: bool,
    config: ReplaceConfig,
    format: &crate::OutputFormat,
) -> Result<()> {
    let document = read_document(&rules)?;
    let files = Arc::new(DirectorySessionFiles::new(root));

    if preview {
        return run_preview(files, &session, &document, &config, format).await;
    }

    let service = BatchService::new(files, config);
    let started = service.start_replace(&session, &document).await?;
    if started.rules_rejected > 0 {
        eprintln!(
            "⚠️  {} rule(s) failed validation and were skipped (see `replacekit validate`)",
            started.rules_rejected
        );
    }

    let bar = match format {
        crate::OutputFormat::Json => ProgressBar::hidden(),
        crate::OutputFormat::Text => {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        }
    };

    let start = Instant::now();
    let last = follow_progress(&service, &started.task_id, &bar).await?;
    bar.finish_with_message(format!("{} in {:?}", last.status, start.elapsed()));

    let report = wait_for_report(&service, &session).await?;
    match format {
        crate::OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        crate::OutputFormat::Text => {
            print!("{}", format_report(&report));
        }
    }

    Ok(())
}

/// Drive the progress bar until the task is terminal; Ctrl-C requests cancellation
async fn follow_progress(
    service: &BatchService,
    task_id: &str,
    bar: &ProgressBar,
) -> Result<ProgressSnapshot> {
    let mut stream = service.stream_progress(task_id);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(ProgressEvent::Update(snapshot)) => show(bar, &snapshot),
                Some(ProgressEvent::Final(snapshot)) => {
                    show(bar, &snapshot);
                    return Ok(snapshot);
                }
                Some(_) => continue,
                None => bail!("progress stream for task {} ended early", task_id),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                bar.set_message("cancelling after in-flight files…");
                service.cancel(task_id)?;
            }
        }
    }
}

fn show(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    bar.set_length(snapshot.total_files as u64);
    bar.set_position(snapshot.processed_files as u64);
    if let Some(file) = &snapshot.current_file {
        bar.set_message(file.clone());
    }
}

async fn wait_for_report(service: &BatchService, session: &str) -> Result<BatchReport> {
    loop {
        match service.get_report(session) {
            Err(ReplaceError::NotReady(_)) => tokio::time::sleep(Duration::from_millis(20)).await,
            other => return other.context("Failed to build report"),
        }
    }
}

async fn run_preview(
    files: Arc<DirectorySessionFiles>,
    session: &str,
    document: &str,
    config: &ReplaceConfig,
    format: &crate::OutputFormat,
) -> Result<()> {
    let validation = replacekit::rules::validate_with(document, &config.validation);
    if validation.valid_rules.is_empty() {
        bail!(
            "No valid rules in document ({} rejected)",
            validation.invalid_rules.len()
        );
    }

    let paths = files
        .list_files(session, &config.orchestrator.extensions)
        .await?;
    let engine = ReplacementEngine::new(&config.engine, &config.validation);
    let rules = Arc::new(validation.valid_rules);

    let mut previews = Vec::new();
    for path in paths {
        let content = match files.read_file(session, &path).await {
            Ok(content) => content,
            Err(e) => {
                eprintln!("⚠️  Skipping {}: {}", path, e);
                continue;
            }
        };

        let engine = engine.clone();
        let rules = rules.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.preview(&content.text, &rules))
            .await
            .context("Preview worker failed")?;

        let total = outcome.outcome.total_replacements();
        if total > 0 {
            previews.push(FilePreview::new(path, outcome.changes, total));
        }
    }

    match format {
        crate::OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&previews)?);
        }
        crate::OutputFormat::Text => {
            if previews.is_empty() {
                println!("No matches found.");
            } else {
                println!("{}", generate_preview(&previews));
                println!("\n💡 Run without --preview to apply changes");
            }
        }
    }

    Ok(())
}
