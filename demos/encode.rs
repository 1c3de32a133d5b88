//! Build an encoder and run it on random features.
//!
//! Usage:
//!
//! ```text
//! cargo run --example encode -- gru --batch 4 --time 50
//! cargo run --example encode -- vgg-blstm --config vgg.json
//! RUST_LOG=debug cargo run --example encode -- vgg-blstm
//! ```

use acoustic_encoders::{
    Encoder, GruEncoder, GruEncoderConfig, KeepProbs, ParamStore, VggBlstmEncoder,
    VggBlstmEncoderConfig,
};
use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use rand::Rng;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Gru,
    VggBlstm,
}

#[derive(Parser, Debug)]
#[command(name = "encode", about = "Run a CTC acoustic encoder on random input")]
struct Args {
    /// Which encoder to build.
    #[arg(value_enum)]
    kind: Kind,

    /// JSON config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 2)]
    batch: usize,

    #[arg(long, default_value_t = 20)]
    time: usize,

    /// Seed for the parameter initializers.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Keep probability applied to input, hidden and output dropout.
    #[arg(long, default_value_t = 1.0)]
    keep_prob: f64,
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
    if args.batch == 0 || args.time == 0 {
        anyhow::bail!("batch and time must be positive");
    }

    let device = Device::cuda_if_available(0)?;
    let store = ParamStore::new(&device, DType::F32, args.seed);
    let keep = KeepProbs::new(args.keep_prob, args.keep_prob, args.keep_prob);
    let config = args.config.as_ref().map(std::fs::read_to_string).transpose()?;

    let mut rng = rand::rng();
    let lengths: Vec<u32> = (0..args.batch)
        .map(|_| rng.random_range(1..=args.time) as u32)
        .collect();
    let seq_len = Tensor::new(lengths.as_slice(), &device)?;
    tracing::info!(?lengths, "sequence lengths");

    let logits = match args.kind {
        Kind::Gru => {
            let cfg = match &config {
                Some(json) => GruEncoderConfig::from_json_str(json)?,
                None => GruEncoderConfig::default(),
            };
            let encoder = GruEncoder::new(&cfg, &store)?;
            let inputs =
                Tensor::randn(0f32, 1.0, (args.batch, args.time, cfg.input_size), &device)?;
            encoder.encode(&inputs, &seq_len, keep)?.logits
        }
        Kind::VggBlstm => {
            let cfg = match &config {
                Some(json) => VggBlstmEncoderConfig::from_json_str(json)?,
                None => VggBlstmEncoderConfig::default(),
            };
            let encoder = VggBlstmEncoder::new(&cfg, &store)?;
            let inputs = Tensor::randn(
                0f32,
                1.0,
                (args.batch, args.time, cfg.spliced_input_size()),
                &device,
            )?;
            encoder.encode(&inputs, &seq_len, keep)?.logits
        }
    };

    tracing::info!(params = store.len(), "done");
    println!("logits shape: {:?}", logits.dims());
    Ok(())
}
