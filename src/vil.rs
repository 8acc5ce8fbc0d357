//! Vision-LSTM (ViL) blocks
//!
//! A [`ViLBlockPair`] runs two mLSTM blocks over the flattened token grid,
//! the first reading rows from the top-left corner and the second from the
//! bottom-right corner. Both preserve the `[B, S, C]` shape.
//! Reference: https://arxiv.org/abs/2406.04303

use candle_core::{bail, DType, Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

use crate::config::{ConvKind, ViLInit, QKV_BLOCK_SIZE};
use crate::norm::NORM_EPS;

/// Up-projection factor of a ViL layer
const EXPANSION: usize = 2;
/// Heads of the matrix LSTM cell
const MLSTM_HEADS: usize = 4;
const MLSTM_EPS: f64 = 1e-6;

/// Construction parameters shared by every block of a stage
#[derive(Debug, Clone)]
pub struct ViLBlockConfig {
    pub dim: usize,
    /// Token grid the blocks run on
    pub seqlens: (usize, usize),
    pub drop_path: f64,
    pub conv_kind: ConvKind,
    pub conv_kernel_size: usize,
    pub proj_bias: bool,
    pub norm_bias: bool,
    /// Total blocks of the stage, used to scale the output projection init
    pub num_blocks: usize,
    pub init: ViLInit,
}

/// Order in which a block scans the token grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    RowwiseFromTopLeft,
    RowwiseFromBotRight,
}

/// Reverses the token axis of `[B, S, C]`.
fn flip_tokens(x: &Tensor) -> Result<Tensor> {
    let s = x.dim(1)?;
    let idx: Vec<u32> = (0..s as u32).rev().collect();
    let idx = Tensor::from_vec(idx, s, x.device())?;
    x.index_select(&idx, 1)
}

/// `log(sigmoid(x))` without overflow for large `|x|`
fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let soft = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.minimum(0f64)? - soft
}

fn linear_normal(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    stdev: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev })?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Blockdiagonal projection applied independently per group of channels
#[derive(Debug)]
struct LinearHeadwiseExpand {
    weight: Tensor,
    bias: Option<Tensor>,
    num_heads: usize,
}

impl LinearHeadwiseExpand {
    fn new(dim: usize, num_heads: usize, bias: bool, stdev: f64, vb: VarBuilder) -> Result<Self> {
        if dim % num_heads != 0 {
            bail!("{dim} channels do not split into {num_heads} heads")
        }
        let dh = dim / num_heads;
        let weight = vb.get_with_hints((num_heads, dh, dh), "weight", Init::Randn { mean: 0.0, stdev })?;
        let bias = if bias {
            Some(vb.get_with_hints(dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            num_heads,
        })
    }
}

impl Module for LinearHeadwiseExpand {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, d) = x.dims3()?;
        let nh = self.num_heads;
        // [NH, B*S, DH] @ [NH, DH, DH]
        let x = x.reshape((b * s, nh, d / nh))?.transpose(0, 1)?.contiguous()?;
        let w = self.weight.t()?.contiguous()?;
        let x = x.matmul(&w)?.transpose(0, 1)?.reshape((b, s, d))?;
        match &self.bias {
            Some(bias) => x.broadcast_add(bias),
            None => Ok(x),
        }
    }
}

/// Depthwise token mixing convolution
#[derive(Debug)]
enum SequenceConv {
    Grid { conv: Conv2d, seqlens: (usize, usize) },
    Causal { conv: Conv1d },
}

impl SequenceConv {
    fn new(kind: ConvKind, dim: usize, kernel_size: usize, seqlens: (usize, usize), vb: VarBuilder) -> Result<Self> {
        match kind {
            ConvKind::TwoD => {
                if kernel_size % 2 == 0 {
                    bail!("2d token convolution needs an odd kernel, got {kernel_size}")
                }
                let cfg = Conv2dConfig {
                    padding: kernel_size / 2,
                    groups: dim,
                    ..Default::default()
                };
                let conv = candle_nn::conv2d(dim, dim, kernel_size, cfg, vb.pp("conv"))?;
                Ok(Self::Grid { conv, seqlens })
            }
            ConvKind::Causal1d => {
                let cfg = Conv1dConfig {
                    padding: kernel_size - 1,
                    groups: dim,
                    ..Default::default()
                };
                let conv = candle_nn::conv1d(dim, dim, kernel_size, cfg, vb.pp("conv").pp("conv"))?;
                Ok(Self::Causal { conv })
            }
        }
    }
}

impl Module for SequenceConv {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, c) = x.dims3()?;
        match self {
            Self::Grid { conv, seqlens: (h, w) } => {
                if s != h * w {
                    bail!("token convolution expects {h}x{w} tokens, got {s}")
                }
                let x = x.transpose(1, 2)?.reshape((b, c, *h, *w))?;
                conv.forward(&x)?.reshape((b, c, s))?.transpose(1, 2)
            }
            Self::Causal { conv } => {
                // symmetric padding, keep the first `s` outputs
                let x = conv.forward(&x.transpose(1, 2)?.contiguous()?)?;
                x.narrow(2, 0, s)?.transpose(1, 2)
            }
        }
    }
}

/// Zero mean, unit variance over the last dimension
fn standardize(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let x = x.broadcast_sub(&mean)?;
    let var = x.sqr()?.mean_keepdim(D::Minus1)?;
    x.broadcast_div(&(var + NORM_EPS)?.sqrt()?)
}

/// Layer norm whose `weight` is stored as an offset from one, so a zero
/// weight is the identity scale.
#[derive(Debug)]
struct ResidualLayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ResidualLayerNorm {
    fn new(dim: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(0.0))?;
        let bias = if bias {
            Some(vb.get_with_hints(dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    fn affine(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.broadcast_mul(&(&self.weight + 1.0)?)?;
        match &self.bias {
            Some(bias) => x.broadcast_add(bias),
            None => Ok(x),
        }
    }
}

impl Module for ResidualLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.affine(&standardize(x)?)
    }
}

/// Group norm with one group per head, `[B, NH, S, DH]` -> `[B, S, NH*DH]`
#[derive(Debug)]
struct MultiHeadLayerNorm {
    norm: ResidualLayerNorm,
}

impl MultiHeadLayerNorm {
    fn new(dim: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: ResidualLayerNorm::new(dim, bias, vb)?,
        })
    }
}

impl Module for MultiHeadLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, nh, s, dh) = x.dims4()?;
        let x = standardize(&x.transpose(1, 2)?.contiguous()?)?;
        self.norm.affine(&x.reshape((b, s, nh * dh))?)
    }
}

/// Query rows of one parallel mLSTM chunk
const MLSTM_CHUNK: usize = 256;

/// Additive causal mask for query rows `start..start + rows` against keys
/// `0..cols`: 0 where the key is not after the query, -inf otherwise.
fn causal_mask(start: usize, rows: usize, cols: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (start..start + rows)
        .flat_map(|i| (0..cols).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(mask, (rows, cols), device)?.to_dtype(dtype)
}

/// Stabilized parallel mLSTM over `[B, NH, S, DH]` queries, keys and values
/// with `[B, NH, S, 1]` gate pre-activations.
///
/// Query rows are processed `chunk` at a time and only see the keys up to
/// the last row of their chunk, so the decay matrix never exceeds
/// `[B, NH, chunk, S]`. With `detach` each chunk result is cut from the
/// autograd graph, releasing its decay matrix before the next chunk.
fn parallel_stabilized(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    igate: &Tensor,
    fgate: &Tensor,
    chunk: usize,
    detach: bool,
) -> Result<Tensor> {
    let (_, _, s, dh) = q.dims4()?;
    let chunk = chunk.max(1);

    // decay[i, j] = sum of log forget gates over (j, i]
    let cum = log_sigmoid(fgate)?.cumsum(2)?;
    let cum_t = cum.transpose(2, 3)?.contiguous()?;
    let igate_t = igate.transpose(2, 3)?.contiguous()?;
    let k = (k / (dh as f64).sqrt())?;

    let mut outs = Vec::with_capacity(s.div_ceil(chunk));
    for start in (0..s).step_by(chunk) {
        let rows = chunk.min(s - start);
        let cols = start + rows;
        let log_d = cum
            .narrow(2, start, rows)?
            .broadcast_sub(&cum_t.narrow(3, 0, cols)?)?
            .broadcast_add(&causal_mask(start, rows, cols, q.dtype(), q.device())?)?
            .broadcast_add(&igate_t.narrow(3, 0, cols)?)?;
        let max_log_d = log_d.max_keepdim(D::Minus1)?;
        let d = log_d.broadcast_sub(&max_log_d)?.exp()?;
        drop(log_d);

        let q_rows = q.narrow(2, start, rows)?.contiguous()?;
        let k_cols = k.narrow(2, 0, cols)?.contiguous()?;
        let c = q_rows.matmul(&k_cols.t()?)?.mul(&d)?;
        drop(d);
        let normalizer = c
            .sum_keepdim(D::Minus1)?
            .abs()?
            .maximum(&max_log_d.neg()?.exp()?)?;
        let c = c.broadcast_div(&(normalizer + MLSTM_EPS)?)?;
        let h = c.matmul(&v.narrow(2, 0, cols)?.contiguous()?)?;
        outs.push(if detach { h.detach() } else { h });
    }
    Tensor::cat(&outs, 2)
}

/// Matrix LSTM cell in its parallel form
#[derive(Debug)]
struct MatrixLstmCell {
    igate: Linear,
    fgate: Linear,
    outnorm: MultiHeadLayerNorm,
    num_heads: usize,
}

impl MatrixLstmCell {
    fn new(dim: usize, num_heads: usize, norm_bias: bool, vb: VarBuilder) -> Result<Self> {
        let gate_weight = |vb: &VarBuilder| vb.get_with_hints((num_heads, 3 * dim), "weight", Init::Const(0.0));

        let igate_vb = vb.pp("igate");
        let igate = Linear::new(
            gate_weight(&igate_vb)?,
            Some(igate_vb.get_with_hints(num_heads, "bias", Init::Randn { mean: 0.0, stdev: 0.1 })?),
        );

        // forget gate biases start evenly spread over [3, 6], gates mostly open
        let fgate_vb = vb.pp("fgate");
        let preset = fgate_vb.contains_tensor("bias");
        let fgate_bias = fgate_vb.get_with_hints(num_heads, "bias", Init::Const(0.0))?;
        if !preset {
            fgate_bias.slice_set(&linspace(3.0, 6.0, num_heads, &fgate_bias)?, 0, 0)?;
        }
        let fgate = Linear::new(gate_weight(&fgate_vb)?, Some(fgate_bias));

        let outnorm = MultiHeadLayerNorm::new(dim, norm_bias, vb.pp("outnorm"))?;
        Ok(Self {
            igate,
            fgate,
            outnorm,
            num_heads,
        })
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, train: bool) -> Result<Tensor> {
        let (b, s, _) = q.dims3()?;
        let nh = self.num_heads;
        let gate_input = Tensor::cat(&[q, k, v], D::Minus1)?;
        // [B, S, NH] -> [B, NH, S, 1]
        let igate = self.igate.forward(&gate_input)?.transpose(1, 2)?.unsqueeze(3)?;
        let fgate = self.fgate.forward(&gate_input)?.transpose(1, 2)?.unsqueeze(3)?;

        let heads = |t: &Tensor| t.reshape((b, s, nh, ()))?.transpose(1, 2)?.contiguous();
        let h = parallel_stabilized(
            &heads(q)?,
            &heads(k)?,
            &heads(v)?,
            &igate,
            &fgate,
            MLSTM_CHUNK,
            !train,
        )?;
        self.outnorm.forward(&h)
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive, laid out like `like`.
fn linspace(start: f64, end: f64, n: usize, like: &Tensor) -> Result<Tensor> {
    let step = if n > 1 { (end - start) / (n - 1) as f64 } else { 0.0 };
    let values: Vec<f32> = (0..n).map(|i| (start + step * i as f64) as f32).collect();
    Tensor::from_vec(values, n, like.device())?.to_dtype(like.dtype())
}

/// mLSTM layer scanning the tokens in one direction
#[derive(Debug)]
pub struct ViLLayer {
    direction: Direction,
    proj_up: Linear,
    q_proj: LinearHeadwiseExpand,
    k_proj: LinearHeadwiseExpand,
    v_proj: LinearHeadwiseExpand,
    conv: SequenceConv,
    mlstm_cell: MatrixLstmCell,
    learnable_skip: Tensor,
    proj_down: Linear,
    inner_dim: usize,
}

impl ViLLayer {
    pub fn new(cfg: &ViLBlockConfig, direction: Direction, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.dim;
        let inner_dim = EXPANSION * dim;
        if inner_dim % QKV_BLOCK_SIZE != 0 || inner_dim % MLSTM_HEADS != 0 {
            bail!("ViL inner width {inner_dim} does not split into heads")
        }
        let small = (2.0 / (5.0 * dim as f64)).sqrt();
        let num_blocks = match cfg.init {
            ViLInit::Original => 1,
            ViLInit::OriginalFixed => cfg.num_blocks.max(1),
        };
        let wang = 2.0 / num_blocks as f64 / (dim as f64).sqrt();

        let proj_up = linear_normal(dim, 2 * inner_dim, cfg.proj_bias, small, vb.pp("proj_up"))?;
        let num_heads = inner_dim / QKV_BLOCK_SIZE;
        let q_proj = LinearHeadwiseExpand::new(inner_dim, num_heads, cfg.proj_bias, small, vb.pp("q_proj"))?;
        let k_proj = LinearHeadwiseExpand::new(inner_dim, num_heads, cfg.proj_bias, small, vb.pp("k_proj"))?;
        let v_proj = LinearHeadwiseExpand::new(inner_dim, num_heads, cfg.proj_bias, small, vb.pp("v_proj"))?;
        let conv = SequenceConv::new(cfg.conv_kind, inner_dim, cfg.conv_kernel_size, cfg.seqlens, vb.clone())?;
        let mlstm_cell = MatrixLstmCell::new(inner_dim, MLSTM_HEADS, cfg.norm_bias, vb.pp("mlstm_cell"))?;
        let learnable_skip = vb.get_with_hints(inner_dim, "learnable_skip", Init::Const(1.0))?;
        let proj_down = linear_normal(inner_dim, dim, cfg.proj_bias, wang, vb.pp("proj_down"))?;

        Ok(Self {
            direction,
            proj_up,
            q_proj,
            k_proj,
            v_proj,
            conv,
            mlstm_cell,
            learnable_skip,
            proj_down,
            inner_dim,
        })
    }
}

impl ModuleT for ViLLayer {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let flipped = self.direction == Direction::RowwiseFromBotRight;
        let x = if flipped { flip_tokens(x)? } else { x.clone() };

        let x_inner = self.proj_up.forward(&x)?;
        let x_mlstm = x_inner.narrow(D::Minus1, 0, self.inner_dim)?;
        let z = x_inner.narrow(D::Minus1, self.inner_dim, self.inner_dim)?;

        let conv_act = self.conv.forward(&x_mlstm)?.silu()?;
        let q = self.q_proj.forward(&conv_act)?;
        let k = self.k_proj.forward(&conv_act)?;
        let v = self.v_proj.forward(&x_mlstm.contiguous()?)?;
        let h = self.mlstm_cell.forward(&q, &k, &v, train)?;

        let h = (h + conv_act.broadcast_mul(&self.learnable_skip)?)?;
        let h = (h * z.silu()?)?;
        let x = self.proj_down.forward(&h)?;

        if flipped {
            flip_tokens(&x)
        } else {
            Ok(x)
        }
    }
}

/// Stochastic depth on a residual branch
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Self {
        Self { drop_prob }
    }
}

impl ModuleT for DropPath {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob == 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.drop_prob;
        let mut shape = vec![1usize; x.rank()];
        shape[0] = x.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, shape, x.device())?
            .ge(self.drop_prob)?
            .to_dtype(x.dtype())?;
        x.broadcast_mul(&mask)? / keep
    }
}

/// Pre-norm residual ViL block
#[derive(Debug)]
pub struct ViLBlock {
    norm: ResidualLayerNorm,
    layer: ViLLayer,
    drop_path: DropPath,
    span: tracing::Span,
}

impl ViLBlock {
    pub fn new(cfg: &ViLBlockConfig, direction: Direction, vb: VarBuilder) -> Result<Self> {
        let norm = ResidualLayerNorm::new(cfg.dim, cfg.norm_bias, vb.pp("norm"))?;
        let layer = ViLLayer::new(cfg, direction, vb.pp("layer"))?;
        let span = tracing::span!(tracing::Level::TRACE, "vil-block");
        Ok(Self {
            norm,
            layer,
            drop_path: DropPath::new(cfg.drop_path),
            span,
        })
    }
}

impl ModuleT for ViLBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = self.layer.forward_t(&self.norm.forward(x)?, train)?;
        let residual = self.drop_path.forward_t(&residual, train)?;
        x + residual
    }
}

/// Two ViL blocks scanning the grid in opposite directions
#[derive(Debug)]
pub struct ViLBlockPair {
    rowwise_from_top_left: ViLBlock,
    rowwise_from_bot_right: ViLBlock,
}

impl ViLBlockPair {
    pub fn new(cfg: &ViLBlockConfig, vb: VarBuilder) -> Result<Self> {
        let rowwise_from_top_left = ViLBlock::new(
            cfg,
            Direction::RowwiseFromTopLeft,
            vb.pp("rowwise_from_top_left"),
        )?;
        let rowwise_from_bot_right = ViLBlock::new(
            cfg,
            Direction::RowwiseFromBotRight,
            vb.pp("rowwise_from_bot_right"),
        )?;
        Ok(Self {
            rowwise_from_top_left,
            rowwise_from_bot_right,
        })
    }
}

impl ModuleT for ViLBlockPair {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.rowwise_from_top_left.forward_t(x, train)?;
        self.rowwise_from_bot_right.forward_t(&x, train)
    }
}
