//! The `replace-bg` subcommand.

use std::time::Duration;

use clap::Args;

use crate::{
    background::{BackgroundClient, HexColor},
    images::SourceImage,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Background replacement command line arguments.
#[derive(Debug, Args)]
pub struct ReplaceBgOpts {
    /// The portrait to process.
    pub input: PathBuf,

    /// Where to write the result. Always a PNG.
    #[clap(short = 'o', long = "out")]
    pub output_path: PathBuf,

    /// New background color, like "#FFF" or "#438EDB".
    #[clap(long)]
    pub color: HexColor,

    /// Base URL of the background service. Requests are sent to
    /// `<URL>/remove-background`.
    #[clap(long, env = "PHOTOBOX_SERVICE_URL")]
    pub service_url: String,

    /// Request timeout, in seconds.
    #[clap(long, default_value_t = 120)]
    pub timeout: u64,
}

/// The `replace-bg` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input.display()))]
pub async fn cmd_replace_bg(ui: Ui, opts: &ReplaceBgOpts) -> Result<()> {
    let client =
        BackgroundClient::new(&opts.service_url, Some(Duration::from_secs(opts.timeout)))?;
    let source = SourceImage::load(&opts.input).await?;

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🎨",
        msg: "Replacing background",
        done_msg: "Replaced background",
    });
    let png = client.replace_background(&source, &opts.color).await;
    spinner.finish_using_style();
    let png = png?;

    tokio::fs::write(&opts.output_path, &png)
        .await
        .with_context(|| format!("Failed to write image to {:?}", opts.output_path))?;
    Ok(())
}
