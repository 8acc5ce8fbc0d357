//! UViL model configuration
//!
//! Every string-keyed choice of the network (init policies, conv kind, norm
//! layer) is a closed enum resolved once when the model is built.

use std::fmt;
use std::str::FromStr;

use candle_core::{bail, Error, Result};
use serde::{Deserialize, Serialize};

/// Number of channels grouped into one headwise q/k/v projection block.
pub const QKV_BLOCK_SIZE: usize = 4;

/// Upper bound on `num_stages`, keeping the per-stage shifts in range.
pub const MAX_STAGES: usize = 16;

/// Weight initialization of the patch embedding convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PatchEmbedInit {
    /// candle's default convolution init
    #[serde(rename = "torch")]
    Torch,
    /// Xavier-uniform over the flattened kernel, zero bias
    #[default]
    #[serde(rename = "xavier_uniform")]
    XavierUniform,
}

/// Weight initialization of the ViL blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViLInit {
    #[default]
    #[serde(rename = "original")]
    Original,
    /// Scales the output projection by the real block count
    #[serde(rename = "original-fixed")]
    OriginalFixed,
}

/// Token mixing convolution used inside a ViL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConvKind {
    /// Depthwise 2D convolution over the token grid
    #[default]
    #[serde(rename = "2d")]
    TwoD,
    /// Depthwise causal 1D convolution over the token sequence
    #[serde(rename = "causal1d")]
    Causal1d,
}

/// Normalization layer used by the bottleneck expansion and the decoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormLayer {
    #[default]
    #[serde(rename = "layernorm")]
    LayerNorm,
    #[serde(rename = "rmsnorm")]
    RmsNorm,
}

macro_rules! string_enum {
    ($ty:ty, $what:literal, $($name:literal => $variant:path),+ $(,)?) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(Error::Msg(format!(concat!("unknown ", $what, " '{}'"), other))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

string_enum!(PatchEmbedInit, "patch embed init",
    "torch" => PatchEmbedInit::Torch,
    "xavier_uniform" => PatchEmbedInit::XavierUniform,
);
string_enum!(ViLInit, "ViL init",
    "original" => ViLInit::Original,
    "original-fixed" => ViLInit::OriginalFixed,
);
string_enum!(ConvKind, "conv kind",
    "2d" => ConvKind::TwoD,
    "causal1d" => ConvKind::Causal1d,
);
string_enum!(NormLayer, "norm layer",
    "layernorm" => NormLayer::LayerNorm,
    "rmsnorm" => NormLayer::RmsNorm,
);

/// Configuration for UViL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UViLConfig {
    /// Input shape (channels, height, width)
    pub input_shape: (usize, usize, usize),
    pub num_classes: usize,
    pub patch_size: usize,
    /// Channel width of the first stage, doubled at every merge
    pub embed_dim: usize,
    /// Kept for config compatibility, has no effect
    pub patch_norm: bool,
    pub norm_layer: NormLayer,
    /// Number of ViL block pairs per stage
    pub depth: usize,
    /// Patch embedding stride, `None` for non-overlapping patches
    pub stride: Option<usize>,
    pub num_stages: usize,
    /// Reserved, has no effect
    pub output_shape: Option<Vec<usize>>,
    /// Reserved, has no effect
    pub mode: String,
    /// Reserved, has no effect
    pub pooling: String,
    pub drop_path_rate: f64,
    /// Ramp the drop path rate linearly from 0 over the stages
    pub drop_path_decay: bool,
    /// Kept for config compatibility, has no effect
    pub legacy_norm: bool,
    pub conv_kind: ConvKind,
    pub conv_kernel_size: usize,
    pub proj_bias: bool,
    pub norm_bias: bool,
    pub vil_init: ViLInit,
    pub patch_embed_init: PatchEmbedInit,
    /// Resize the positional embedding when the token grid differs from the trained one
    pub pos_embed_interpolation: bool,
    /// Normalize the decoder output before the final 4x expansion
    pub decoder_output_norm: bool,
}

impl Default for UViLConfig {
    fn default() -> Self {
        Self {
            input_shape: (1, 224, 224),
            num_classes: 10,
            patch_size: 4,
            embed_dim: 96,
            patch_norm: true,
            norm_layer: NormLayer::LayerNorm,
            depth: 2,
            stride: None,
            num_stages: 2,
            output_shape: None,
            mode: "features".to_string(),
            pooling: "to_image".to_string(),
            drop_path_rate: 0.0,
            drop_path_decay: false,
            legacy_norm: false,
            conv_kind: ConvKind::TwoD,
            conv_kernel_size: 3,
            proj_bias: true,
            norm_bias: true,
            vil_init: ViLInit::Original,
            patch_embed_init: PatchEmbedInit::XavierUniform,
            pos_embed_interpolation: true,
            decoder_output_norm: false,
        }
    }
}

impl UViLConfig {
    /// Four stage model for 224x224 single channel images
    pub fn uvil_t(num_classes: usize) -> Self {
        Self {
            num_classes,
            num_stages: 4,
            ..Self::default()
        }
    }

    pub fn in_channels(&self) -> usize {
        self.input_shape.0
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.input_shape.1, self.input_shape.2)
    }

    /// Patch embedding stride, defaulting to the patch size
    pub fn effective_stride(&self) -> usize {
        self.stride.unwrap_or(self.patch_size)
    }

    /// Token grid produced by the patch embedding
    pub fn patch_grid(&self) -> Result<(usize, usize)> {
        let (h, w) = self.resolution();
        let p = self.patch_size;
        if p == 0 {
            bail!("patch_size must be positive")
        }
        if h < p || w < p || h % p != 0 || w % p != 0 {
            bail!("resolution ({h}, {w}) is not divisible by patch_size {p}")
        }
        let s = self.effective_stride();
        if s == 0 {
            bail!("stride must be positive")
        }
        Ok(((h - p) / s + 1, (w - p) / s + 1))
    }

    /// Channel width of encoder stage `idx`
    pub fn stage_dim(&self, idx: usize) -> usize {
        self.embed_dim << idx
    }

    /// Token grid of encoder stage `idx`
    pub fn stage_resolution(&self, idx: usize) -> Result<(usize, usize)> {
        let (h, w) = self.patch_grid()?;
        Ok((h >> idx, w >> idx))
    }

    /// Channel widths of all encoder stages
    pub fn stage_dims(&self) -> Vec<usize> {
        (0..self.num_stages).map(|i| self.stage_dim(i)).collect()
    }

    /// Token grids of all encoder stages
    pub fn stage_resolutions(&self) -> Result<Vec<(usize, usize)>> {
        (0..self.num_stages).map(|i| self.stage_resolution(i)).collect()
    }

    /// Stochastic depth rate per stage
    pub fn drop_path_schedule(&self) -> Vec<f64> {
        let n = self.num_stages;
        if self.drop_path_decay && self.drop_path_rate > 0.0 {
            if n == 1 {
                return vec![0.0];
            }
            (0..n)
                .map(|i| self.drop_path_rate * i as f64 / (n - 1) as f64)
                .collect()
        } else {
            vec![self.drop_path_rate; n]
        }
    }

    /// Checks the configuration before any weight is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels() == 0 {
            bail!("input_shape must have at least one channel")
        }
        if self.num_classes == 0 {
            bail!("num_classes must be positive")
        }
        if !(2..=MAX_STAGES).contains(&self.num_stages) {
            bail!(
                "num_stages must be in [2, {MAX_STAGES}], got {}",
                self.num_stages
            )
        }
        let inner = self.embed_dim.checked_mul(2).unwrap_or(0);
        if inner == 0 || inner % QKV_BLOCK_SIZE != 0 {
            bail!(
                "embed_dim {} must be even so the ViL inner width splits into blocks of {QKV_BLOCK_SIZE}",
                self.embed_dim
            )
        }
        let factor = 1usize << (self.num_stages - 1);
        if self.embed_dim.checked_mul(factor).is_none() {
            bail!(
                "embed_dim {} overflows at stage {}",
                self.embed_dim,
                self.num_stages - 1
            )
        }
        let (gh, gw) = self.patch_grid()?;
        if gh % factor != 0 || gw % factor != 0 {
            bail!(
                "patch grid ({gh}, {gw}) cannot be halved {} times",
                self.num_stages - 1
            )
        }
        if self.conv_kernel_size == 0 {
            bail!("conv_kernel_size must be positive")
        }
        if self.conv_kind == ConvKind::TwoD && self.conv_kernel_size % 2 == 0 {
            bail!(
                "conv_kernel_size {} must be odd for 2d convolutions",
                self.conv_kernel_size
            )
        }
        if !(0.0..1.0).contains(&self.drop_path_rate) {
            bail!("drop_path_rate {} must be in [0, 1)", self.drop_path_rate)
        }
        Ok(())
    }
}
