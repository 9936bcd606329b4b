//! The `resize` subcommand.

use clap::{ArgGroup, Args};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    images::{ResizeOptions, SourceImage, resize},
    prelude::*,
    ui::Ui,
};

/// Resize command line arguments.
#[derive(Debug, Args)]
#[clap(group(ArgGroup::new("size").required(true).multiple(true).args(["width", "height"])))]
pub struct ResizeOpts {
    /// The image to resize.
    pub input: PathBuf,

    /// Where to write the resized image. Always a JPEG.
    #[clap(short = 'o', long = "out")]
    pub output_path: PathBuf,

    /// Target width in pixels.
    #[clap(long)]
    pub width: Option<u32>,

    /// Target height in pixels.
    #[clap(long)]
    pub height: Option<u32>,

    /// Stretch to exactly `--width` and `--height` instead of keeping the
    /// aspect ratio. A missing dimension keeps its original size.
    #[clap(long)]
    pub no_keep_aspect: bool,
}

/// The `resize` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input.display()))]
pub async fn cmd_resize(ui: Ui, opts: &ResizeOpts) -> Result<()> {
    let options = ResizeOptions {
        width: opts.width,
        height: opts.height,
        keep_aspect: !opts.no_keep_aspect,
    };
    let source = SourceImage::load(&opts.input).await?;
    let resized = spawn_blocking_propagating_panics(move || resize(&source, &options)).await?;
    tokio::fs::write(&opts.output_path, &resized.image.data)
        .await
        .with_context(|| format!("Failed to write image to {:?}", opts.output_path))?;

    ui.display_message(
        "📐",
        &format!(
            "Resized {}×{} → {}×{}",
            resized.original_width,
            resized.original_height,
            resized.image.width,
            resized.image.height,
        ),
    );
    Ok(())
}
