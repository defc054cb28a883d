//! GST style embedding diagnostic.
//!
//! Builds a randomly initialized style encoder from a config (defaults if
//! none is given), runs a synthetic spectrogram batch through it and prints
//! a one-line JSON summary to stdout:
//!
//! ```json
//! {"shape":[2,256],"norms":[1.93,1.93],"token_weights":[[0.1,...],...]}
//! ```
//!
//! `token_weights` holds each head's distribution over the style tokens for
//! the first example. Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use gst_rs::{GstConfig, StyleEncoder};

#[derive(Parser, Debug)]
#[command(
    name = "gst-embed",
    about = "Run a synthetic spectrogram through a GST style encoder",
    long_about = "Builds a randomly initialized Global Style Token encoder and reports\n\
                  the style embedding shape, norms and token attention weights."
)]
struct Args {
    /// JSON config file. Missing fields use the reference hyperparameters.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Batch size.
    #[arg(long, short = 'b', default_value_t = 2)]
    batch: usize,

    /// Frames per example.
    #[arg(long, short = 't', default_value_t = 200)]
    frames: usize,

    /// Fill the spectrogram with a constant instead of N(0, 1) noise.
    #[arg(long)]
    fill: Option<f32>,

    /// Comma-separated valid lengths, one per example.
    #[arg(long, value_delimiter = ',')]
    lengths: Option<Vec<usize>>,

    /// Normalize with batch statistics instead of running statistics.
    #[arg(long)]
    train: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.batch == 0 || args.frames == 0 {
        anyhow::bail!(
            "batch and frames must be positive, got batch={} frames={}",
            args.batch,
            args.frames
        );
    }

    let cfg = match &args.config {
        Some(path) => GstConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?,
        None => GstConfig::default(),
    };

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let gst = StyleEncoder::new(&cfg, vb)?;

    let shape = (args.batch, args.frames, cfg.n_mel_channels);
    let mel = match args.fill {
        Some(value) => (Tensor::ones(shape, DType::F32, &device)? * value as f64)?,
        None => Tensor::randn(0f32, 1.0, shape, &device)?,
    };

    let lengths = args.lengths.as_deref();
    let reference = gst.encoder().forward_t(&mel, lengths, args.train)?;
    let (embed, weights) = gst.style_tokens().tokenize_with_weights(&reference)?;

    let norms: Vec<f32> = embed.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
    let token_weights: Vec<Vec<f32>> = weights.i(0)?.to_vec2()?;

    let summary = serde_json::json!({
        "shape": embed.dims(),
        "norms": norms,
        "token_weights": token_weights,
    });
    println!("{summary}");

    Ok(())
}
