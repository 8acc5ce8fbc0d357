//! Normalization layer factory

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, LayerNorm, RmsNorm, VarBuilder};

use crate::config::NormLayer;

pub const NORM_EPS: f64 = 1e-5;

/// Per-channel normalization over the last dimension
#[derive(Debug, Clone)]
pub enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl NormLayer {
    /// Builds the normalization for `dim` channels, loading `weight` (and
    /// `bias` for layer norm when `bias` is set) from `vb`.
    pub fn build(self, dim: usize, bias: bool, vb: VarBuilder) -> Result<Norm> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        match self {
            NormLayer::LayerNorm => {
                let norm = if bias {
                    let b = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
                    LayerNorm::new(weight, b, NORM_EPS)
                } else {
                    LayerNorm::new_no_bias(weight, NORM_EPS)
                };
                Ok(Norm::Layer(norm))
            }
            NormLayer::RmsNorm => Ok(Norm::Rms(RmsNorm::new(weight, NORM_EPS))),
        }
    }
}

impl Module for Norm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Layer(norm) => norm.forward(x),
            Norm::Rms(norm) => norm.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_normalizes_last_dim() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = NormLayer::LayerNorm.build(8, true, vb).unwrap();

        let x = Tensor::randn(3.0f32, 2.0, (2, 5, 8), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 8]);

        let mean = y.mean_keepdim(D::Minus1).unwrap().abs().unwrap();
        let max_mean = mean.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(max_mean < 1e-4, "per token mean {max_mean}");
    }

    #[test]
    fn test_norm_without_bias_allocates_weight_only() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        NormLayer::LayerNorm.build(4, false, vb.pp("a")).unwrap();
        NormLayer::RmsNorm.build(4, true, vb.pp("b")).unwrap();

        let data = varmap.data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["a.weight".to_string(), "b.weight".to_string()]);
    }
}
