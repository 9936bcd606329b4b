//! The `search` subcommand.

use std::{collections::HashSet, sync::Arc, time::Duration};

use clap::Args;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::io::{OutputFormat, write_output},
    batch::{BatchRunner, Pacer, RunOutcome},
    errors::{CapacityError, ValidationError},
    extract::OcrOpts,
    filter::{FilterConfig, FilterMode},
    images::SourceImage,
    prelude::*,
    rate_limit::RateLimit,
    store::{MAX_RECORDS, PreviewFiles, RecordStatus, RecordStore, SharedStore},
    ui::{ProgressConfig, Ui},
};

/// Prefix for images copied by `--export-dir`.
const EXPORT_PREFIX: &str = "match_";

/// Search command line arguments.
#[derive(Debug, Args)]
pub struct SearchOpts {
    /// Images to search. Files that aren't images are skipped.
    #[clap(value_name = "IMAGE", required = true)]
    pub images: Vec<PathBuf>,

    /// Comma-separated keywords, matched case-insensitively. With no keywords,
    /// every successfully processed image matches.
    #[clap(short = 'k', long, default_value = "")]
    pub keywords: String,

    /// Keep images containing any keyword, or images containing none.
    #[clap(long, value_enum, default_value_t)]
    pub mode: FilterMode,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    /// Pause between OCR requests, in milliseconds.
    #[clap(long, default_value_t = 500)]
    pub delay_ms: u64,

    /// Also limit OCR requests to this rate. Use values like "10/s",
    /// "300/m" or "5000/h".
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Retry failed images up to this many times.
    #[clap(long, default_value_t = 0)]
    pub retry_failed: u32,

    /// Copy matching images that were read into this directory, prefixed
    /// with "match_".
    #[clap(long)]
    pub export_dir: Option<PathBuf>,

    /// Only include matching images in the report.
    #[clap(long)]
    pub matches_only: bool,

    /// Report format.
    #[clap(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Where to write the report. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Exit status after a second Ctrl-C, as if killed by SIGINT.
const FORCED_EXIT_CODE: i32 = 130;

/// The `search` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_search(ui: Ui, opts: &SearchOpts) -> Result<()> {
    // The first Ctrl-C stops the batch after the image currently being read.
    // A second one exits at once, without a report.
    let cancel = CancellationToken::new();
    let interrupt_watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupted, stopping after the current image. Press Ctrl-C again to quit now");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Interrupted twice, exiting without a report");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    });
    let result = search(ui, opts, &cancel).await;
    interrupt_watcher.abort();
    result
}

/// Run a search until it finishes or `cancel` fires, then write the report.
async fn search(ui: Ui, opts: &SearchOpts, cancel: &CancellationToken) -> Result<()> {
    // Build our client first, so configuration errors show up before we do
    // any work.
    let client = Arc::new(opts.ocr.create_client()?);
    let filter = FilterConfig::parse(&opts.keywords, opts.mode);
    debug!(keywords = ?filter.keywords(), mode = ?filter.mode(), "Parsed filter");

    let (sources, too_large) = load_images(&opts.images).await?;
    for rejected in &too_large {
        ui.display_message("⚠️", &format!("Skipped {rejected}"));
    }
    let mut store = RecordStore::new(Box::new(PreviewFiles::new()?));
    let added = store.add(sources)?;
    for rejected in &added.rejected {
        ui.display_message("⚠️", &format!("Skipped {rejected}"));
    }
    debug!(added = added.added.len(), "Added images");

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Reading images",
            done_msg: "Read images",
        },
        store.len() as u64,
    );
    let store = SharedStore::new(store);
    let runner = BatchRunner::new(
        store.clone(),
        client,
        Pacer::new(
            Duration::from_millis(opts.delay_ms),
            opts.rate_limit.as_ref(),
        ),
    )
    .with_progress_bar(pb.clone());

    let mut outcome = runner.run(cancel).await;
    debug!(summary = ?outcome.summary(), "First pass finished");
    for attempt in 1..=opts.retry_failed {
        if outcome.is_cancelled() || store.lock().counts().failed == 0 {
            break;
        }
        outcome = runner.retry_failed(cancel).await;
        debug!(attempt, summary = ?outcome.summary(), "Retry pass finished");
    }
    pb.finish_using_style();

    // Work out which records match, and release the store lock before doing
    // any more I/O. Only records with text are exported, so an interrupted
    // run never exports images it didn't read.
    let (reports, matches, counts) = {
        let store = store.lock();
        let reports = store
            .records()
            .iter()
            .map(|record| record.to_report(filter.is_visible(record)))
            .filter(|report| report.visible || !opts.matches_only)
            .collect::<Vec<_>>();
        let matches = filter
            .visible(store.records())
            .into_iter()
            .filter(|record| record.status() == RecordStatus::Done)
            .map(|record| record.source().clone())
            .collect::<Vec<_>>();
        (reports, matches, store.counts())
    };

    if let Some(export_dir) = &opts.export_dir {
        export_matches(export_dir, &matches).await?;
    }
    write_output(opts.output_path.as_deref(), opts.format, &reports).await?;

    info!(
        processed = counts.processed(),
        total = counts.total,
        failed = counts.failed,
        matched = matches.len(),
        "Search finished"
    );
    if let RunOutcome::Cancelled(_) = outcome {
        return Err(anyhow!(
            "Interrupted after {} of {} images",
            counts.processed(),
            counts.total
        ));
    }
    Ok(())
}

/// Load every image in `paths`. Batches too large for the store are refused
/// before anything is read, and files too large to accept are skipped
/// without being read.
async fn load_images(paths: &[PathBuf]) -> Result<(Vec<SourceImage>, Vec<ValidationError>)> {
    if paths.len() > MAX_RECORDS {
        return Err(CapacityError {
            existing: 0,
            incoming: paths.len(),
            max: MAX_RECORDS,
        }
        .into());
    }
    let loaded = try_join_all(paths.iter().map(|path| SourceImage::load_within_limit(path))).await?;
    let mut sources = Vec::with_capacity(loaded.len());
    let mut rejected = Vec::new();
    for result in loaded {
        match result {
            Ok(source) => sources.push(source),
            Err(err) => {
                warn!("Skipping input: {err}");
                rejected.push(err);
            }
        }
    }
    Ok((sources, rejected))
}

/// Copy matching images into `dir`, prefixed with [`EXPORT_PREFIX`].
#[instrument(level = "debug", skip_all, fields(dir = %dir.display()))]
async fn export_matches(dir: &Path, matches: &[SourceImage]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create export directory {:?}", dir))?;
    let mut used = HashSet::new();
    for source in matches {
        let file_name = unique_export_name(&source.name, &mut used);
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &source.data)
            .await
            .with_context(|| format!("Failed to export image to {:?}", path))?;
    }
    debug!(count = matches.len(), "Exported matching images");
    Ok(())
}

/// Build `match_<name>`, adding a counter if two inputs share a name.
fn unique_export_name(name: &str, used: &mut HashSet<String>) -> String {
    let candidate = format!("{EXPORT_PREFIX}{name}");
    if used.insert(candidate.clone()) {
        return candidate;
    }
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, extension)) => (stem, format!(".{extension}")),
        None => (name, String::new()),
    };
    (2..)
        .map(|n| format!("{EXPORT_PREFIX}{stem}_{n}{extension}"))
        .find(|candidate| used.insert(candidate.clone()))
        .unwrap_or(candidate)
}
