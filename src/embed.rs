//! Patch and positional embeddings for the ViL encoder

use candle_core::{bail, Device, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::config::PatchEmbedInit;

/// Strided convolution producing a channel-last token grid
#[derive(Debug)]
enum PatchProj {
    Conv1d(Conv1d),
    Conv2d(Conv2d),
}

/// Patch Embedding layer
///
/// `[B, C, *resolution]` -> `[B, *seqlens, dim]`
#[derive(Debug)]
pub struct VitPatchEmbed {
    proj: PatchProj,
    patch_size: usize,
    stride: usize,
    seqlens: Vec<usize>,
    num_patches: usize,
    span: tracing::Span,
}

impl VitPatchEmbed {
    pub fn new(
        dim: usize,
        num_channels: usize,
        resolution: &[usize],
        patch_size: usize,
        stride: Option<usize>,
        init: PatchEmbedInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stride = stride.unwrap_or(patch_size);
        if patch_size == 0 || stride == 0 {
            bail!("patch_size and stride must be positive")
        }
        for (i, &r) in resolution.iter().enumerate() {
            if r < patch_size || r % patch_size != 0 {
                bail!(
                    "resolution[{i}] % patch_size != 0 (resolution={resolution:?} patch_size={patch_size})"
                )
            }
        }
        let seqlens: Vec<usize> = resolution
            .iter()
            .map(|&r| (r - patch_size) / stride + 1)
            .collect();
        let num_patches = seqlens.iter().product();

        let vb = vb.pp("proj");
        let proj = match resolution.len() {
            1 => {
                let cfg = Conv1dConfig {
                    stride,
                    ..Default::default()
                };
                let conv = match init {
                    PatchEmbedInit::Torch => {
                        candle_nn::conv1d(num_channels, dim, patch_size, cfg, vb)?
                    }
                    PatchEmbedInit::XavierUniform => {
                        let (weight, bias) =
                            xavier_kernel(&[dim, num_channels, patch_size], vb)?;
                        Conv1d::new(weight, Some(bias), cfg)
                    }
                };
                PatchProj::Conv1d(conv)
            }
            2 => {
                let cfg = Conv2dConfig {
                    stride,
                    ..Default::default()
                };
                let conv = match init {
                    PatchEmbedInit::Torch => {
                        candle_nn::conv2d(num_channels, dim, patch_size, cfg, vb)?
                    }
                    PatchEmbedInit::XavierUniform => {
                        let (weight, bias) =
                            xavier_kernel(&[dim, num_channels, patch_size, patch_size], vb)?;
                        Conv2d::new(weight, Some(bias), cfg)
                    }
                };
                PatchProj::Conv2d(conv)
            }
            n => bail!("patch embedding for {n}d inputs is not implemented"),
        };

        let span = tracing::span!(tracing::Level::TRACE, "patch-embed");
        Ok(Self {
            proj,
            patch_size,
            stride,
            seqlens,
            num_patches,
            span,
        })
    }

    /// Token grid size per spatial axis
    pub fn seqlens(&self) -> &[usize] {
        &self.seqlens
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// Xavier-uniform init over the kernel viewed as `[out, in * prod(kernel)]`, zero bias.
fn xavier_kernel(shape: &[usize], vb: VarBuilder) -> Result<(Tensor, Tensor)> {
    let fan_out = shape[0];
    let fan_in: usize = shape[1..].iter().product();
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let weight = vb.get_with_hints(
        shape,
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(fan_out, "bias", Init::Const(0.0))?;
    Ok((weight, bias))
}

impl Module for VitPatchEmbed {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let spatial = &x.dims()[2.min(x.rank())..];
        if spatial.len() != self.seqlens.len() || spatial.iter().any(|d| d % self.patch_size != 0) {
            bail!(
                "x.shape={:?} incompatible with patch_size={}",
                x.dims(),
                self.patch_size
            )
        }
        match &self.proj {
            PatchProj::Conv1d(conv) => conv.forward(x)?.transpose(1, 2),
            PatchProj::Conv2d(conv) => conv.forward(x)?.permute((0, 2, 3, 1)),
        }
    }
}

/// PyTorch bicubic convolution coefficient
const CUBIC_A: f64 = -0.75;

fn cubic_weights(t: f64) -> [f64; 4] {
    let near = |x: f64| ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0;
    let far = |x: f64| ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A;
    [far(t + 1.0), near(t), near(1.0 - t), far(2.0 - t)]
}

/// `[out, in]` matrix resampling one axis bicubically (half-pixel centers,
/// border-clamped taps).
fn bicubic_matrix(in_size: usize, out_size: usize, device: &Device) -> Result<Tensor> {
    let scale = in_size as f64 / out_size as f64;
    let mut m = vec![0f32; out_size * in_size];
    for o in 0..out_size {
        let src = (o as f64 + 0.5) * scale - 0.5;
        let base = src.floor();
        let weights = cubic_weights(src - base);
        for (k, wk) in weights.iter().enumerate() {
            let idx = (base as i64 - 1 + k as i64).clamp(0, in_size as i64 - 1) as usize;
            m[o * in_size + idx] += *wk as f32;
        }
    }
    Tensor::from_vec(m, (out_size, in_size), device)
}

/// Resizes a `[1, H, W, dim]` positional embedding to `[1, h, w, dim]` with
/// bicubic interpolation.
pub fn interpolate_sincos(embed: &Tensor, seqlens: (usize, usize)) -> Result<Tensor> {
    let (one, h, w, dim) = embed.dims4()?;
    if one != 1 {
        bail!("expected a single positional embedding, got batch {one}")
    }
    let (new_h, new_w) = seqlens;
    let device = embed.device();
    let dtype = embed.dtype();
    let rows = bicubic_matrix(h, new_h, device)?.to_dtype(dtype)?;
    let cols = bicubic_matrix(w, new_w, device)?.to_dtype(dtype)?;

    // rows: [new_h, h] @ [h, w * dim]
    let x = rows.matmul(&embed.reshape((h, w * dim))?)?;
    // cols: [new_w, w] @ [w, new_h * dim]
    let x = x.reshape((new_h, w, dim))?.transpose(0, 1)?.contiguous()?;
    let x = cols.matmul(&x.reshape((w, new_h * dim))?)?;
    x.reshape((new_w, new_h, dim))?
        .transpose(0, 1)?
        .contiguous()?
        .unsqueeze(0)
}

/// Learned 2D positional embedding added to a `[B, H, W, dim]` token grid
#[derive(Debug)]
pub struct VitPosEmbed2d {
    embed: Tensor,
    seqlens: (usize, usize),
    allow_interpolation: bool,
    span: tracing::Span,
}

impl VitPosEmbed2d {
    pub fn new(
        seqlens: (usize, usize),
        dim: usize,
        allow_interpolation: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        // plain normal stands in for trunc_normal(std=0.02)
        let embed = vb.get_with_hints(
            (1, seqlens.0, seqlens.1, dim),
            "embed",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "pos-embed");
        Ok(Self {
            embed,
            seqlens,
            allow_interpolation,
            span,
        })
    }

    pub fn seqlens(&self) -> (usize, usize) {
        self.seqlens
    }

    pub fn embed(&self) -> &Tensor {
        &self.embed
    }
}

impl Module for VitPosEmbed2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, h, w, dim) = x.dims4()?;
        let (_, _, _, embed_dim) = self.embed.dims4()?;
        if dim != embed_dim {
            bail!("positional embedding has {embed_dim} channels, input has {dim}")
        }
        if (h, w) == self.seqlens {
            return x.broadcast_add(&self.embed);
        }
        if !self.allow_interpolation {
            bail!(
                "input grid ({h}, {w}) differs from positional embedding grid {:?} and interpolation is disabled",
                self.seqlens
            )
        }
        let embed = interpolate_sincos(&self.embed, (h, w))?.to_dtype(x.dtype())?;
        x.broadcast_add(&embed)
    }
}
