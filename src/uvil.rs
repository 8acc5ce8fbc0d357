//! UViL - U-shaped Vision-LSTM for dense prediction
//!
//! A hierarchical ViL encoder, a mirrored decoder fed by skip connections and
//! a single 4x patch expansion back to pixel resolution followed by a 1x1
//! classification convolution.

use candle_core::{bail, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::config::{NormLayer, UViLConfig};
use crate::embed::{VitPatchEmbed, VitPosEmbed2d};
use crate::norm::Norm;
use crate::patch::{FinalPatchExpand4x, PatchExpand};
use crate::stage::{ViLDecoderStage, ViLEncoderStage};
use crate::vil::ViLBlockConfig;

/// Encoder features recorded before each stage, finest first
#[derive(Debug, Default)]
pub struct SkipCache {
    features: Vec<Tensor>,
}

impl SkipCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            features: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, x: Tensor) {
        self.features.push(x)
    }

    pub fn get(&self, idx: usize) -> Option<&Tensor> {
        self.features.get(idx)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.features.iter()
    }
}

#[derive(Debug)]
enum DecoderLayer {
    /// Bottleneck upsample, no skip fusion
    Expand(PatchExpand),
    /// Skip concat, channel fusion, then a decoder stage
    Fused { concat: Linear, stage: ViLDecoderStage },
}

#[derive(Debug)]
pub struct UViL {
    config: UViLConfig,
    patch_embed: VitPatchEmbed,
    pos_embed: VitPosEmbed2d,
    enc_layers: Vec<ViLEncoderStage>,
    dec_layers: Vec<DecoderLayer>,
    norm_upsample: Norm,
    final_patch_expand: FinalPatchExpand4x,
    final_conv: Conv2d,
    patch_grid: (usize, usize),
    span: tracing::Span,
}

impl UViL {
    pub fn new(config: UViLConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let n = config.num_stages;
        let (h, w) = config.resolution();
        let patch_grid = config.patch_grid()?;
        let dpr = config.drop_path_schedule();
        let norm_layer = config.norm_layer;

        let patch_embed = VitPatchEmbed::new(
            config.embed_dim,
            config.in_channels(),
            &[h, w],
            config.patch_size,
            config.stride,
            config.patch_embed_init,
            vb.pp("patch_embed"),
        )?;
        let pos_embed = VitPosEmbed2d::new(
            patch_grid,
            config.embed_dim,
            config.pos_embed_interpolation,
            vb.pp("pos_embed"),
        )?;
        tracing::debug!(?patch_grid, dim = config.embed_dim, "patch embedding");

        let block_config = |idx: usize, drop_path: f64| -> Result<ViLBlockConfig> {
            Ok(ViLBlockConfig {
                dim: config.stage_dim(idx),
                seqlens: config.stage_resolution(idx)?,
                drop_path,
                conv_kind: config.conv_kind,
                conv_kernel_size: config.conv_kernel_size,
                proj_bias: config.proj_bias,
                norm_bias: config.norm_bias,
                num_blocks: 2 * config.depth,
                init: config.vil_init,
            })
        };

        let mut enc_layers = Vec::with_capacity(n);
        for (i, &drop_path) in dpr.iter().enumerate() {
            let block = block_config(i, drop_path)?;
            tracing::debug!(stage = i, dim = block.dim, resolution = ?block.seqlens, depth = config.depth, "encoder stage");
            let stage = ViLEncoderStage::new(
                &block,
                config.depth,
                i < n - 1,
                vb.pp(format!("enc_layers.{i}")),
            )?;
            enc_layers.push(stage);
        }

        let mut dec_layers = Vec::with_capacity(n);
        for (i, &drop_path) in dpr.iter().enumerate() {
            // decoder stage i runs at the resolution of encoder stage n-1-i
            let level = n - 1 - i;
            let layer = if i == 0 {
                DecoderLayer::Expand(PatchExpand::new(
                    config.stage_resolution(level)?,
                    config.stage_dim(level),
                    2,
                    norm_layer,
                    vb.pp(format!("dec_layers.{i}")),
                )?)
            } else {
                let block = block_config(level, drop_path)?;
                let concat = candle_nn::linear(
                    2 * block.dim,
                    block.dim,
                    vb.pp(format!("concat_back_dim.{i}")),
                )?;
                let stage = ViLDecoderStage::new(
                    &block,
                    config.depth,
                    i < n - 1,
                    vb.pp(format!("dec_layers.{i}")),
                )?;
                DecoderLayer::Fused { concat, stage }
            };
            tracing::debug!(
                stage = i,
                dim = config.stage_dim(level),
                resolution = ?config.stage_resolution(level)?,
                "decoder stage"
            );
            dec_layers.push(layer);
        }

        let norm_upsample = norm_layer.build(config.embed_dim, true, vb.pp("norm_upsample"))?;
        let final_patch_expand = FinalPatchExpand4x::new(
            patch_grid,
            config.embed_dim,
            NormLayer::LayerNorm,
            vb.pp("final_patch_expnad"),
        )?;
        let final_conv = candle_nn::conv2d_no_bias(
            config.embed_dim,
            config.num_classes,
            1,
            Conv2dConfig::default(),
            vb.pp("final_conv"),
        )?;
        tracing::debug!(
            classes = config.num_classes,
            output = ?final_patch_expand.output_resolution(),
            "segmentation head"
        );

        let span = tracing::span!(tracing::Level::TRACE, "uvil");
        Ok(Self {
            config,
            patch_embed,
            pos_embed,
            enc_layers,
            dec_layers,
            norm_upsample,
            final_patch_expand,
            final_conv,
            patch_grid,
            span,
        })
    }

    /// Builds the model from pretrained weights, e.g. a `VarBuilder` over a
    /// safetensors checkpoint keyed by the module paths used here.
    pub fn load(config: UViLConfig, vb: VarBuilder) -> Result<Self> {
        Self::new(config, vb)
    }

    pub fn config(&self) -> &UViLConfig {
        &self.config
    }

    pub fn patch_grid(&self) -> (usize, usize) {
        self.patch_grid
    }

    fn encode(&self, x: &Tensor, train: bool) -> Result<(Tensor, SkipCache)> {
        let (_, c, _, _) = x.dims4()?;
        if c != self.config.in_channels() {
            bail!("expected {} input channels, got {c}", self.config.in_channels())
        }
        let x = self.patch_embed.forward(x)?;
        let x = self.pos_embed.forward(&x)?;
        // [B, H, W, C] -> [B, H*W, C]
        let mut x = x.flatten(1, 2)?;

        let mut skips = SkipCache::with_capacity(self.enc_layers.len());
        for stage in &self.enc_layers {
            skips.push(x.clone());
            x = stage.forward_t(&x, train)?;
        }
        Ok((x, skips))
    }

    fn decode(&self, x: &Tensor, skips: SkipCache, train: bool) -> Result<Tensor> {
        let n = self.dec_layers.len();
        if skips.len() != n {
            bail!("decoder needs {n} skip features, got {}", skips.len())
        }
        let mut x = x.clone();
        for (i, layer) in self.dec_layers.iter().enumerate() {
            x = match layer {
                DecoderLayer::Expand(expand) => expand.forward(&x)?,
                DecoderLayer::Fused { concat, stage } => {
                    let skip = &skips.features[n - 1 - i];
                    let x = Tensor::cat(&[&x, skip], D::Minus1)?;
                    let x = concat.forward(&x)?;
                    stage.forward_t(&x, train)?
                }
            };
        }
        if self.config.decoder_output_norm {
            self.norm_upsample.forward(&x)
        } else {
            Ok(x)
        }
    }

    /// Patch embedding and encoder stages.
    ///
    /// Returns the bottleneck tokens and the pre-stage feature of every
    /// encoder stage.
    pub fn forward_encoder(&self, x: &Tensor) -> Result<(Tensor, SkipCache)> {
        self.encode(x, false)
    }

    /// Decoder stages fed by the skip features of [`UViL::forward_encoder`].
    pub fn forward_decoder(&self, x: &Tensor, skips: SkipCache) -> Result<Tensor> {
        self.decode(x, skips, false)
    }

    /// 4x token expansion and per pixel classification.
    ///
    /// `[B, Hp*Wp, C]` -> `[B, num_classes, 4Hp, 4Wp]`
    pub fn final_4x_upsample(&self, x: &Tensor) -> Result<Tensor> {
        let (hp, wp) = self.patch_grid;
        let (b, l, c) = x.dims3()?;
        if l != hp * wp {
            bail!("input features has wrong size, got {l} tokens for a {hp}x{wp} grid")
        }
        let x = self.final_patch_expand.forward(x)?;
        let (h, w) = self.final_patch_expand.output_resolution();
        let x = x.reshape((b, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()?;
        self.final_conv.forward(&x)
    }

    /// Inference forward pass returning per pixel class logits
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }
}

impl ModuleT for UViL {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (x, skips) = self.encode(x, train)?;
        let x = self.decode(&x, skips, train)?;
        self.final_4x_upsample(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> UViLConfig {
        UViLConfig {
            input_shape: (1, 32, 32),
            num_classes: 2,
            embed_dim: 16,
            depth: 1,
            num_stages: 2,
            ..UViLConfig::default()
        }
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_skip_cache_has_one_entry_per_stage() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = UViLConfig {
            num_stages: 3,
            ..small_config()
        };
        let model = UViL::new(config, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 1, 32, 32), &device).unwrap();
        let (bottleneck, skips) = model.forward_encoder(&x).unwrap();
        assert_eq!(bottleneck.dims(), &[1, 4, 64]);
        assert_eq!(skips.len(), 3);
        let dims: Vec<_> = skips.iter().map(|s| s.dims().to_vec()).collect();
        assert_eq!(dims, vec![vec![1, 64, 16], vec![1, 16, 32], vec![1, 4, 64]]);

        let decoded = model.forward_decoder(&bottleneck, skips).unwrap();
        assert_eq!(decoded.dims(), &[1, 64, 16]);
    }

    #[test]
    fn test_decoder_rejects_incomplete_skips() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = UViL::new(small_config(), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 1, 32, 32), &device).unwrap();
        let (bottleneck, skips) = model.forward_encoder(&x).unwrap();
        let mut partial = SkipCache::default();
        partial.push(skips.get(0).unwrap().clone());
        assert!(model.forward_decoder(&bottleneck, partial).is_err());
    }

    #[test]
    fn test_decoder_output_norm_flag() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // both models share the weights of the same VarMap
        let plain = UViL::new(small_config(), vb.clone()).unwrap();
        let normed = UViL::new(
            UViLConfig {
                decoder_output_norm: true,
                ..small_config()
            },
            vb,
        )
        .unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 1, 32, 32), &device).unwrap();
        let (bottleneck, skips) = plain.forward_encoder(&x).unwrap();
        let unnormed = plain.forward_decoder(&bottleneck, skips).unwrap();
        let (bottleneck, skips) = normed.forward_encoder(&x).unwrap();
        let normalized = normed.forward_decoder(&bottleneck, skips).unwrap();

        // the default path returns the raw decoder tokens
        let raw_mean = max_abs(&unnormed.mean_keepdim(D::Minus1).unwrap());
        assert!(raw_mean > 1e-3, "{raw_mean}");

        // the flag applies norm_upsample on top of the same tokens
        let expected = plain.norm_upsample.forward(&unnormed).unwrap();
        assert!(max_abs(&(normalized - expected).unwrap()) < 1e-4);
    }

    #[test]
    fn test_final_upsample_checks_token_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = UViL::new(small_config(), vb).unwrap();

        let ok = Tensor::zeros((2, 64, 16), DType::F32, &device).unwrap();
        assert_eq!(model.final_4x_upsample(&ok).unwrap().dims(), &[2, 2, 32, 32]);
        let bad = Tensor::zeros((2, 60, 16), DType::F32, &device).unwrap();
        assert!(model.final_4x_upsample(&bad).is_err());
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = UViL::new(small_config(), vb).unwrap();
        let x = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();
        assert!(model.forward(&x).is_err());
    }

    #[test]
    fn test_weight_paths() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        UViL::new(small_config(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "patch_embed.proj.weight",
            "pos_embed.embed",
            "enc_layers.0.vilblock.0.rowwise_from_top_left.layer.proj_up.weight",
            "enc_layers.0.downsample.reduction.weight",
            "dec_layers.0.expand.weight",
            "concat_back_dim.1.weight",
            "concat_back_dim.1.bias",
            "dec_layers.1.vilblock.0.rowwise_from_bot_right.layer.proj_down.weight",
            "norm_upsample.weight",
            "final_patch_expnad.expand.weight",
            "final_conv.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("concat_back_dim.0.weight"));
        assert!(!data.contains_key("dec_layers.1.upsample.expand.weight"));
        assert!(!data.contains_key("final_conv.bias"));
    }

    #[test]
    fn test_configured_norm_only_on_bottleneck_expand_and_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = UViLConfig {
            norm_layer: NormLayer::RmsNorm,
            num_stages: 3,
            ..small_config()
        };
        UViL::new(config, vb).unwrap();

        // rms norm carries no bias, layer norm does
        let data = varmap.data().lock().unwrap();
        assert!(!data.contains_key("dec_layers.0.norm.bias"));
        assert!(!data.contains_key("norm_upsample.bias"));
        for name in [
            "enc_layers.0.downsample.norm.bias",
            "dec_layers.1.upsample.norm.bias",
            "final_patch_expnad.norm.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_conv_kernel_size_reaches_blocks() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = UViLConfig {
            conv_kernel_size: 5,
            ..small_config()
        };
        UViL::new(config, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let conv = data
            .get("enc_layers.0.vilblock.0.rowwise_from_top_left.layer.conv.weight")
            .unwrap();
        // depthwise over the 2 * 16 inner channels
        assert_eq!(conv.dims(), &[32, 1, 5, 5]);
    }
}
