//! Encoder and decoder stages of the U-shape
//!
//! A stage runs `depth` ViL block pairs at one resolution and then
//! optionally changes resolution. The in-stage merge and expand always use
//! layer norm.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::NormLayer;
use crate::patch::{PatchExpand, PatchMerging};
use crate::vil::{ViLBlockConfig, ViLBlockPair};

fn block_pairs(block: &ViLBlockConfig, depth: usize, vb: &VarBuilder) -> Result<Vec<ViLBlockPair>> {
    let mut blocks = Vec::with_capacity(depth);
    for i in 0..depth {
        blocks.push(ViLBlockPair::new(block, vb.pp(format!("vilblock.{i}")))?);
    }
    Ok(blocks)
}

fn run_blocks(blocks: &[ViLBlockPair], x: &Tensor, train: bool) -> Result<Tensor> {
    let mut x = x.clone();
    for block in blocks {
        x = block.forward_t(&x, train)?;
    }
    Ok(x)
}

/// Encoder stage: block pairs followed by an optional patch merge
#[derive(Debug)]
pub struct ViLEncoderStage {
    blocks: Vec<ViLBlockPair>,
    downsample: Option<PatchMerging>,
    span: tracing::Span,
}

impl ViLEncoderStage {
    pub fn new(
        block: &ViLBlockConfig,
        depth: usize,
        downsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = block_pairs(block, depth, &vb)?;
        let downsample = if downsample {
            Some(PatchMerging::new(block.seqlens, block.dim, NormLayer::LayerNorm, vb.pp("downsample"))?)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "vil-encoder-stage");
        Ok(Self {
            blocks,
            downsample,
            span,
        })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

impl ModuleT for ViLEncoderStage {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = run_blocks(&self.blocks, x, train)?;
        match &self.downsample {
            Some(downsample) => downsample.forward(&x),
            None => Ok(x),
        }
    }
}

/// Decoder stage: block pairs followed by an optional 2x patch expansion
#[derive(Debug)]
pub struct ViLDecoderStage {
    blocks: Vec<ViLBlockPair>,
    upsample: Option<PatchExpand>,
    span: tracing::Span,
}

impl ViLDecoderStage {
    pub fn new(
        block: &ViLBlockConfig,
        depth: usize,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = block_pairs(block, depth, &vb)?;
        let upsample = if upsample {
            Some(PatchExpand::new(block.seqlens, block.dim, 2, NormLayer::LayerNorm, vb.pp("upsample"))?)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "vil-decoder-stage");
        Ok(Self {
            blocks,
            upsample,
            span,
        })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

impl ModuleT for ViLDecoderStage {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = run_blocks(&self.blocks, x, train)?;
        match &self.upsample {
            Some(upsample) => upsample.forward(&x),
            None => Ok(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvKind, ViLInit};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn block_config(dim: usize, seqlens: (usize, usize)) -> ViLBlockConfig {
        ViLBlockConfig {
            dim,
            seqlens,
            drop_path: 0.0,
            conv_kind: ConvKind::TwoD,
            conv_kernel_size: 3,
            proj_bias: true,
            norm_bias: true,
            num_blocks: 2,
            init: ViLInit::Original,
        }
    }

    #[test]
    fn test_encoder_stage_downsamples() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stage = ViLEncoderStage::new(&block_config(8, (4, 4)), 1, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 16, 8), &device).unwrap();
        let y = stage.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 4, 16]);
    }

    #[test]
    fn test_last_encoder_stage_keeps_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stage = ViLEncoderStage::new(&block_config(8, (2, 2)), 2, false, vb).unwrap();
        assert_eq!(stage.depth(), 2);

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device).unwrap();
        assert_eq!(stage.forward_t(&x, false).unwrap().dims(), &[1, 4, 8]);
    }

    #[test]
    fn test_decoder_stage_upsamples() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stage = ViLDecoderStage::new(&block_config(16, (2, 2)), 1, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        assert_eq!(stage.forward_t(&x, false).unwrap().dims(), &[1, 16, 8]);
    }

    #[test]
    fn test_stage_weight_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        ViLEncoderStage::new(&block_config(8, (2, 2)), 2, true, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "vilblock.0.rowwise_from_top_left.norm.weight",
            "vilblock.1.rowwise_from_bot_right.layer.proj_up.weight",
            "vilblock.1.rowwise_from_bot_right.layer.mlstm_cell.fgate.bias",
            "downsample.reduction.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
