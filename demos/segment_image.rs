//! Run UViL on an image and write the predicted class map

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_uvil::{UViL, UViLConfig};
use clap::Parser;
use image::{ImageBuffer, Luma};

/// Select the compute device
fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        println!("Running on CPU, build with `--features cuda` or `--features metal` to use a GPU");
        Ok(Device::Cpu)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Model weights in safetensors format, random init when omitted.
    #[arg(long)]
    model: Option<PathBuf>,

    /// JSON model config, the 4 stage 224x224 model when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,

    /// Input image to segment.
    image: PathBuf,

    /// Output class map.
    #[arg(long, default_value = "class_map.png")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let device = device(args.cpu)?;

    let config: UViLConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => UViLConfig::uvil_t(args.num_classes),
    };

    let varmap = VarMap::new();
    let model = match &args.model {
        Some(path) => {
            println!("Loading weights from {}", path.display());
            let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, &device)?;
            let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
            UViL::load(config.clone(), vb)?
        }
        None => {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            UViL::new(config.clone(), vb)?
        }
    };

    let (c, h, w) = config.input_shape;
    if c != 1 && c != 3 {
        anyhow::bail!("images can feed 1 or 3 channels, config asks for {c}")
    }
    let img = image::open(&args.image)?.resize_exact(
        w as u32,
        h as u32,
        image::imageops::FilterType::Triangle,
    );
    let data: Vec<f32> = if c == 1 {
        img.to_luma8().into_raw().into_iter().map(|p| p as f32 / 255.0).collect()
    } else {
        // HWC -> CHW
        let rgb = img.to_rgb8();
        let mut data = vec![0f32; 3 * h * w];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = y as usize * w + x as usize;
            for ch in 0..3 {
                data[ch * h * w + idx] = pixel[ch] as f32 / 255.0;
            }
        }
        data
    };
    let input = Tensor::from_vec(data, (1, c, h, w), &device)?;

    let start = std::time::Instant::now();
    let logits = model.forward(&input)?;
    let classes = logits.argmax(1)?.squeeze(0)?;
    println!("Inference time: {:?}", start.elapsed());

    let (oh, ow) = classes.dims2()?;
    // spread the class ids over the gray range
    let scale = 255 / (config.num_classes.max(2) - 1) as u32;
    let pixels: Vec<u8> = classes
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|class| (class * scale).min(255) as u8)
        .collect();
    let mask: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_raw(ow as u32, oh as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("class map does not fit a {ow}x{oh} image"))?;
    mask.save(&args.output)?;
    println!("Saved class map to {}", args.output.display());

    Ok(())
}
