use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod background;
mod batch;
mod cmd;
mod data_url;
mod errors;
mod extract;
mod filter;
mod images;
mod prelude;
mod rate_limit;
mod store;
mod ui;

/// Search photos by the text in them, and other small photo chores.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - PHOTOBOX_OCR_URL: Base URL of the OCR service used by `search`.
  - PHOTOBOX_SERVICE_URL: Base URL of the background service used by
    `replace-bg`.
  - RUST_LOG: Logging filter, for example "photobox=debug".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a batch of images and filter them by keyword.
    Search(cmd::search::SearchOpts),
    /// Re-encode an image at a lower quality or size.
    Compress(cmd::compress::CompressOpts),
    /// Resize an image to new dimensions.
    Resize(cmd::resize::ResizeOpts),
    /// Replace the background of a portrait with a solid color.
    ReplaceBg(cmd::background::ReplaceBgOpts),
    /// Print schemas for report and service formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Search(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
            Cmd::Compress(_) | Cmd::Resize(_) | Cmd::ReplaceBg(_) => false,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Keep progress bars out of the way of a report on stdout.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Search(opts) => cmd::search::cmd_search(ui, opts).await,
        Cmd::Compress(opts) => cmd::compress::cmd_compress(ui, opts).await,
        Cmd::Resize(opts) => cmd::resize::cmd_resize(ui, opts).await,
        Cmd::ReplaceBg(opts) => cmd::background::cmd_replace_bg(ui, opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
