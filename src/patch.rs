//! Patch merging and expansion operators
//!
//! All operators work on flattened token sequences `[B, H*W, C]` at a fixed
//! input resolution and move them to the next resolution of the U-shape.

use candle_core::{bail, Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::NormLayer;
use crate::norm::Norm;

fn check_tokens(x: &Tensor, (h, w): (usize, usize), op: &str) -> Result<(usize, usize, usize)> {
    let (b, l, c) = x.dims3()?;
    if l != h * w {
        bail!("{op}: input feature has wrong size, got {l} tokens for a {h}x{w} grid")
    }
    Ok((b, l, c))
}

/// Rearranges `[B, H, W, (p p c)]` into `[B, (H p)*(W p), c]`.
fn unfold_blocks(x: &Tensor, (h, w): (usize, usize), p: usize) -> Result<Tensor> {
    let (b, _, c) = x.dims3()?;
    if c % (p * p) != 0 {
        bail!("cannot split {c} channels into {p}x{p} spatial blocks")
    }
    let c_out = c / (p * p);
    x.reshape((b, h, w, p, p, c_out))?
        .permute((0, 1, 3, 2, 4, 5))?
        .reshape((b, h * p * w * p, c_out))
}

/// Patch Merging layer (downsampling)
///
/// `[B, H*W, C]` -> `[B, H/2*W/2, 2C]`
#[derive(Debug)]
pub struct PatchMerging {
    reduction: Linear,
    norm: Norm,
    input_resolution: (usize, usize),
    span: tracing::Span,
}

impl PatchMerging {
    pub fn new(
        input_resolution: (usize, usize),
        dim: usize,
        norm_layer: NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm = norm_layer.build(4 * dim, true, vb.pp("norm"))?;
        let reduction = candle_nn::linear_no_bias(4 * dim, 2 * dim, vb.pp("reduction"))?;
        let span = tracing::span!(tracing::Level::TRACE, "patch-merging");
        Ok(Self {
            reduction,
            norm,
            input_resolution,
            span,
        })
    }

    pub fn output_resolution(&self) -> (usize, usize) {
        (self.input_resolution.0 / 2, self.input_resolution.1 / 2)
    }
}

impl Module for PatchMerging {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (h, w) = self.input_resolution;
        let (b, _, c) = check_tokens(x, (h, w), "patch merging")?;
        if h % 2 != 0 || w % 2 != 0 {
            bail!("patch merging: x size ({h}*{w}) are not even")
        }

        // [B, H/2, 2, W/2, 2, C], the two singleton axes carry the row and column offsets
        let x = x.reshape((b, h / 2, 2, w / 2, 2, c))?;
        let pick = |row: usize, col: usize| -> Result<Tensor> {
            x.narrow(2, row, 1)?.narrow(4, col, 1)?.squeeze(4)?.squeeze(2)
        };
        let x0 = pick(0, 0)?;
        let x1 = pick(1, 0)?;
        let x2 = pick(0, 1)?;
        let x3 = pick(1, 1)?;

        let x = Tensor::cat(&[&x0, &x1, &x2, &x3], D::Minus1)?;
        let x = x.reshape((b, (h / 2) * (w / 2), 4 * c))?;

        let x = self.norm.forward(&x)?;
        self.reduction.forward(&x)
    }
}

/// Patch Expanding layer (upsampling)
///
/// With `dim_scale == 2`: `[B, H*W, C]` -> `[B, 2H*2W, C/2]`.
/// With `dim_scale == 1` the channels are not expanded first: `[B, H*W, C]` -> `[B, 2H*2W, C/4]`.
#[derive(Debug)]
pub struct PatchExpand {
    expand: Option<Linear>,
    norm: Norm,
    input_resolution: (usize, usize),
    span: tracing::Span,
}

impl PatchExpand {
    pub fn new(
        input_resolution: (usize, usize),
        dim: usize,
        dim_scale: usize,
        norm_layer: NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (expand, expanded) = match dim_scale {
            2 => (Some(candle_nn::linear_no_bias(dim, 2 * dim, vb.pp("expand"))?), 2 * dim),
            1 => (None, dim),
            other => bail!("patch expand supports dim_scale 1 or 2, got {other}"),
        };
        if expanded % 4 != 0 {
            bail!("patch expand: {expanded} channels do not split into 2x2 blocks")
        }
        let norm = norm_layer.build(expanded / 4, true, vb.pp("norm"))?;
        let span = tracing::span!(tracing::Level::TRACE, "patch-expand");
        Ok(Self {
            expand,
            norm,
            input_resolution,
            span,
        })
    }

    pub fn output_resolution(&self) -> (usize, usize) {
        (self.input_resolution.0 * 2, self.input_resolution.1 * 2)
    }
}

impl Module for PatchExpand {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = match &self.expand {
            Some(expand) => expand.forward(x)?,
            None => x.clone(),
        };
        check_tokens(&x, self.input_resolution, "patch expand")?;
        let x = unfold_blocks(&x, self.input_resolution, 2)?;
        self.norm.forward(&x)
    }
}

/// Final 4x patch expansion back to the input image grid
///
/// `[B, H*W, C]` -> `[B, 4H*4W, C]`
#[derive(Debug)]
pub struct FinalPatchExpand4x {
    expand: Linear,
    norm: Norm,
    input_resolution: (usize, usize),
    span: tracing::Span,
}

impl FinalPatchExpand4x {
    pub const DIM_SCALE: usize = 4;

    pub fn new(
        input_resolution: (usize, usize),
        dim: usize,
        norm_layer: NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let scale = Self::DIM_SCALE * Self::DIM_SCALE;
        let expand = candle_nn::linear_no_bias(dim, scale * dim, vb.pp("expand"))?;
        let norm = norm_layer.build(dim, true, vb.pp("norm"))?;
        let span = tracing::span!(tracing::Level::TRACE, "final-patch-expand");
        Ok(Self {
            expand,
            norm,
            input_resolution,
            span,
        })
    }

    pub fn output_resolution(&self) -> (usize, usize) {
        (
            self.input_resolution.0 * Self::DIM_SCALE,
            self.input_resolution.1 * Self::DIM_SCALE,
        )
    }
}

impl Module for FinalPatchExpand4x {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = self.expand.forward(x)?;
        check_tokens(&x, self.input_resolution, "final patch expand")?;
        let x = unfold_blocks(&x, self.input_resolution, Self::DIM_SCALE)?;
        self.norm.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_patch_merging_shape_law() {
        let varmap = VarMap::new();
        for (i, &(h, w, c)) in [(2, 2, 4), (8, 4, 8), (6, 10, 12)].iter().enumerate() {
            let merge =
                PatchMerging::new((h, w), c, NormLayer::LayerNorm, vb(&varmap).pp(i)).unwrap();
            let x = Tensor::randn(0f32, 1.0, (2, h * w, c), &Device::Cpu).unwrap();
            let y = merge.forward(&x).unwrap();
            assert_eq!(y.dims(), &[2, (h / 2) * (w / 2), 2 * c]);
            assert_eq!(merge.output_resolution(), (h / 2, w / 2));
        }
    }

    #[test]
    fn test_patch_merging_gathers_offsets_in_order() {
        let device = Device::Cpu;
        // one 2x2 grid, token value encodes 10 * row + col
        let x = Tensor::from_vec(vec![0f32, 1., 10., 11.], (1, 4, 1), &device).unwrap();

        // reduction row 0 reads the second gathered offset, row 1 the third
        let reduction = Tensor::from_vec(
            vec![0f32, 1., 0., 0., 0., 0., 1., 0.],
            (2, 4),
            &device,
        )
        .unwrap();
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("norm.weight".to_string(), Tensor::ones(4, DType::F32, &device).unwrap());
        tensors.insert("norm.bias".to_string(), Tensor::zeros(4, DType::F32, &device).unwrap());
        tensors.insert("reduction.weight".to_string(), reduction);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let merge = PatchMerging::new((2, 2), 1, NormLayer::LayerNorm, vb).unwrap();

        let y = merge.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // offsets are gathered as (0,0), (1,0), (0,1), (1,1): the second is the
        // large row-1 value, the third the small column-1 value
        assert!(y[0] > 0.0, "{y:?}");
        assert!(y[1] < 0.0, "{y:?}");
    }

    #[test]
    fn test_patch_merging_rejects_bad_input() {
        let varmap = VarMap::new();
        let merge = PatchMerging::new((4, 4), 4, NormLayer::LayerNorm, vb(&varmap)).unwrap();
        let wrong_len = Tensor::zeros((1, 15, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(merge.forward(&wrong_len).is_err());

        let odd = PatchMerging::new((3, 4), 4, NormLayer::LayerNorm, vb(&varmap).pp("odd")).unwrap();
        let x = Tensor::zeros((1, 12, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(odd.forward(&x).is_err());
    }

    #[test]
    fn test_patch_expand_shape_law_and_inverse_of_merging() {
        let varmap = VarMap::new();
        let (h, w, c) = (4, 6, 8);
        let merge = PatchMerging::new((h, w), c, NormLayer::LayerNorm, vb(&varmap).pp("m")).unwrap();
        let expand =
            PatchExpand::new((h / 2, w / 2), 2 * c, 2, NormLayer::LayerNorm, vb(&varmap).pp("e"))
                .unwrap();

        let x = Tensor::randn(0f32, 1.0, (3, h * w, c), &Device::Cpu).unwrap();
        let merged = merge.forward(&x).unwrap();
        let y = expand.forward(&merged).unwrap();
        assert_eq!(y.dims(), x.dims());
        assert_eq!(expand.output_resolution(), (h, w));
    }

    #[test]
    fn test_patch_expand_without_channel_expansion() {
        let varmap = VarMap::new();
        let expand = PatchExpand::new((2, 2), 8, 1, NormLayer::LayerNorm, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu).unwrap();
        let y = expand.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 16, 2]);

        assert!(PatchExpand::new((2, 2), 6, 1, NormLayer::LayerNorm, vb(&varmap).pp("bad")).is_err());
        assert!(PatchExpand::new((2, 2), 8, 3, NormLayer::LayerNorm, vb(&varmap).pp("s3")).is_err());
    }

    #[test]
    fn test_patch_expand_places_channel_blocks_spatially() {
        // With dim_scale 1 the rearrangement is observable up to the norm:
        // a token whose 4 channel blocks are constant becomes 4 constant pixels.
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 4), &device).unwrap();
        let y = unfold_blocks(&x, (1, 1), 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 1]);
        let y = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // (p1, p2) row-major: top-left, top-right, bottom-left, bottom-right
        assert_eq!(y, vec![1., 2., 3., 4.]);
    }

    #[test]
    fn test_final_expand_keeps_channels() {
        let varmap = VarMap::new();
        let (h, w, c) = (3, 5, 6);
        let expand = FinalPatchExpand4x::new((h, w), c, NormLayer::LayerNorm, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, h * w, c), &Device::Cpu).unwrap();
        let y = expand.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 16 * h * w, c]);
        assert_eq!(expand.output_resolution(), (12, 20));

        let bad = Tensor::randn(0f32, 1.0, (2, h * w + 1, c), &Device::Cpu).unwrap();
        assert!(expand.forward(&bad).is_err());
    }
}
