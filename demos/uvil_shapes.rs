//! Build a UViL model and print the tensor shapes of every phase

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_uvil::{UViL, UViLConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON model config, overrides the size flags below.
    #[arg(long)]
    config: Option<String>,

    /// Input image side length.
    #[arg(long, default_value_t = 64)]
    size: usize,

    #[arg(long, default_value_t = 1)]
    channels: usize,

    #[arg(long, default_value_t = 32)]
    embed_dim: usize,

    #[arg(long, default_value_t = 2)]
    num_stages: usize,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let config: UViLConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => UViLConfig {
            input_shape: (args.channels, args.size, args.size),
            num_classes: args.num_classes,
            embed_dim: args.embed_dim,
            num_stages: args.num_stages,
            ..UViLConfig::default()
        },
    };
    println!("{}", serde_json::to_string_pretty(&config)?);

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = UViL::new(config.clone(), vb)?;
    let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    println!("parameters: {num_params}");

    let (c, h, w) = config.input_shape;
    let x = Tensor::randn(0f32, 1.0, (args.batch, c, h, w), &device)?;
    println!("input: {:?}", x.dims());

    let start = std::time::Instant::now();
    let (bottleneck, skips) = model.forward_encoder(&x)?;
    for (i, skip) in skips.iter().enumerate() {
        println!("skip {i}: {:?}", skip.dims());
    }
    println!("bottleneck: {:?}", bottleneck.dims());

    let decoded = model.forward_decoder(&bottleneck, skips)?;
    println!("decoder: {:?}", decoded.dims());

    let logits = model.final_4x_upsample(&decoded)?;
    println!("logits: {:?}", logits.dims());
    println!("forward time: {:?}", start.elapsed());
    Ok(())
}
