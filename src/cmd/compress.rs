//! The `compress` subcommand.

use clap::Args;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    images::{CompressOptions, EncodeFormat, SourceImage, compress, format_file_size},
    prelude::*,
    ui::Ui,
};

/// Compress command line arguments.
#[derive(Debug, Args)]
pub struct CompressOpts {
    /// The image to compress.
    pub input: PathBuf,

    /// Where to write the compressed image.
    #[clap(short = 'o', long = "out")]
    pub output_path: PathBuf,

    /// JPEG quality, from 0.1 to 1.0.
    #[clap(long, default_value_t = 0.8)]
    pub quality: f32,

    /// Shrink the image to at most this many pixels wide.
    #[clap(long)]
    pub max_width: Option<u32>,

    /// Shrink the image to at most this many pixels high.
    #[clap(long)]
    pub max_height: Option<u32>,

    /// Output format. Defaults to the format implied by the output path, or
    /// JPEG.
    #[clap(long, value_enum)]
    pub format: Option<EncodeFormat>,
}

impl CompressOpts {
    fn to_options(&self) -> CompressOptions {
        CompressOptions {
            quality: self.quality,
            max_width: self.max_width,
            max_height: self.max_height,
            format: self
                .format
                .or_else(|| EncodeFormat::from_path(&self.output_path))
                .unwrap_or_default(),
        }
    }
}

/// The `compress` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input.display()))]
pub async fn cmd_compress(ui: Ui, opts: &CompressOpts) -> Result<()> {
    let options = opts.to_options();
    options.validate()?;

    // Give extensionless output paths the right extension.
    let output_path = match opts.output_path.extension() {
        Some(_) => opts.output_path.clone(),
        None => opts.output_path.with_extension(options.format.extension()),
    };

    let source = SourceImage::load(&opts.input).await?;
    let report =
        spawn_blocking_propagating_panics(move || compress(&source, &options)).await?;
    tokio::fs::write(&output_path, &report.data)
        .await
        .with_context(|| format!("Failed to write image to {:?}", output_path))?;

    debug!(
        compressed_size = report.compressed_size,
        format = ?report.format,
        "Compressed image"
    );
    ui.display_message(
        "🗜️",
        &format!(
            "{} → {} ({}% smaller), {}×{} → {}×{}",
            format_file_size(report.original_size),
            format_file_size(report.compressed_size),
            report.compression_ratio,
            report.original_width,
            report.original_height,
            report.width,
            report.height,
        ),
    );
    Ok(())
}
