//! Pyramid Vision Transformer v2 stage.
//!
//! One stage = optional overlapping patch merge (stride 2), `depth` blocks of
//! spatial-reduction attention + depthwise-conv MLP, and a final norm. The
//! stage consumes and produces NCHW feature maps; blocks run on
//! `[batch, tokens, channels]` sequences.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::{gelu, relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{Distribution, Tensor};

use crate::error::{ModelError, ModelResult};
use crate::norm::{Norm, NormLayer};

/// Pooled key/value grid used by linear (pooling) attention.
const LINEAR_POOL_SIZE: usize = 7;

/// Linear stochastic-depth schedule over every block of a staged network,
/// split into one group per stage.
///
/// Values run from 0 to `drop_path_rate` across `sum(depths)` positions, so
/// each stage receives its slice of the global schedule even when earlier
/// stages are never built.
pub fn drop_path_schedule(depths: &[usize], drop_path_rate: f64) -> Vec<Vec<f64>> {
    let total: usize = depths.iter().sum();
    let mut flat = (0..total).map(|k| {
        if total > 1 {
            drop_path_rate * (k as f64 / (total - 1) as f64)
        } else {
            0.0
        }
    });
    depths
        .iter()
        .map(|&depth| flat.by_ref().take(depth).collect())
        .collect()
}

/// Per-sample stochastic depth. Identity unless the backend tracks gradients.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn prob(&self) -> f64 {
        self.prob
    }

    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return x;
        }
        let keep = 1.0 - self.prob;
        let mut shape = [1; D];
        shape[0] = x.dims()[0];
        let mask = Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep), &x.device());
        x * mask.div_scalar(keep)
    }
}

/// Strided conv patch merge; returns NHWC tokens.
#[derive(Module, Debug)]
pub struct OverlapPatchEmbed<B: Backend> {
    proj: Conv2d<B>,
    norm: Norm<B>,
}

impl<B: Backend> OverlapPatchEmbed<B> {
    pub fn new(
        in_chans: usize,
        embed_dim: usize,
        patch_size: usize,
        stride: usize,
        norm_layer: &NormLayer,
        device: &B::Device,
    ) -> Self {
        let pad = patch_size / 2;
        let proj = Conv2dConfig::new([in_chans, embed_dim], [patch_size, patch_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .init(device);
        Self {
            proj,
            norm: norm_layer.init(embed_dim, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.proj.forward(x).permute([0, 2, 3, 1]);
        self.norm.forward(x)
    }
}

/// Shrinks the key/value token grid before attention.
#[derive(Module, Debug)]
pub struct SpatialReduction<B: Backend> {
    conv: Conv2d<B>,
    norm: Norm<B>,
    pooled: bool,
}

impl<B: Backend> SpatialReduction<B> {
    fn forward(&self, x: Tensor<B, 3>, (h, w): (usize, usize)) -> Tensor<B, 3> {
        let [b, _, c] = x.dims();
        let grid = x.swap_dims(1, 2).reshape([b, c, h, w]);
        let grid = if self.pooled {
            adaptive_avg_pool2d(grid, [LINEAR_POOL_SIZE, LINEAR_POOL_SIZE])
        } else {
            grid
        };
        let tokens = self.conv.forward(grid).flatten::<3>(2, 3).swap_dims(1, 2);
        let tokens = self.norm.forward(tokens);
        if self.pooled {
            gelu(tokens)
        } else {
            tokens
        }
    }
}

/// Multi-head attention whose keys/values come from a spatially reduced grid.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    q: Linear<B>,
    kv: Linear<B>,
    attn_drop: Dropout,
    proj: Linear<B>,
    proj_drop: Dropout,
    reduction: Option<SpatialReduction<B>>,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl<B: Backend> Attention<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        num_heads: usize,
        sr_ratio: usize,
        linear_attn: bool,
        qkv_bias: bool,
        attn_drop: f64,
        proj_drop: f64,
        norm_layer: &NormLayer,
        device: &B::Device,
    ) -> Self {
        let head_dim = dim / num_heads;
        let reduction = if linear_attn {
            Some(SpatialReduction {
                conv: Conv2dConfig::new([dim, dim], [1, 1]).init(device),
                norm: norm_layer.init(dim, device),
                pooled: true,
            })
        } else if sr_ratio > 1 {
            Some(SpatialReduction {
                conv: Conv2dConfig::new([dim, dim], [sr_ratio, sr_ratio])
                    .with_stride([sr_ratio, sr_ratio])
                    .init(device),
                norm: norm_layer.init(dim, device),
                pooled: false,
            })
        } else {
            None
        };
        Self {
            q: LinearConfig::new(dim, dim).with_bias(qkv_bias).init(device),
            kv: LinearConfig::new(dim, dim * 2)
                .with_bias(qkv_bias)
                .init(device),
            attn_drop: DropoutConfig::new(attn_drop).init(),
            proj: LinearConfig::new(dim, dim).init(device),
            proj_drop: DropoutConfig::new(proj_drop).init(),
            reduction,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, size: (usize, usize)) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let (heads, hd) = (self.num_heads, self.head_dim);
        let q = self
            .q
            .forward(x.clone())
            .reshape([b, n, heads, hd])
            .swap_dims(1, 2);

        let kv_in = match &self.reduction {
            Some(reduction) => reduction.forward(x, size),
            None => x,
        };
        let m = kv_in.dims()[1];
        let kv = self.kv.forward(kv_in);
        let k = kv
            .clone()
            .slice([0..b, 0..m, 0..c])
            .reshape([b, m, heads, hd])
            .swap_dims(1, 2);
        let v = kv
            .slice([0..b, 0..m, c..2 * c])
            .reshape([b, m, heads, hd])
            .swap_dims(1, 2);

        let attn = q.matmul(k.swap_dims(2, 3)).mul_scalar(self.scale);
        let attn = self.attn_drop.forward(softmax(attn, 3));
        let x = attn.matmul(v).swap_dims(1, 2).reshape([b, n, c]);
        self.proj_drop.forward(self.proj.forward(x))
    }
}

/// fc1 → depthwise 3x3 conv → GELU → fc2.
#[derive(Module, Debug)]
pub struct MlpWithDepthwiseConv<B: Backend> {
    fc1: Linear<B>,
    dwconv: Conv2d<B>,
    fc2: Linear<B>,
    drop: Dropout,
    extra_relu: bool,
}

impl<B: Backend> MlpWithDepthwiseConv<B> {
    pub fn new(
        dim: usize,
        hidden: usize,
        drop: f64,
        extra_relu: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: LinearConfig::new(dim, hidden).init(device),
            dwconv: Conv2dConfig::new([hidden, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(hidden)
                .init(device),
            fc2: LinearConfig::new(hidden, dim).init(device),
            drop: DropoutConfig::new(drop).init(),
            extra_relu,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, (h, w): (usize, usize)) -> Tensor<B, 3> {
        let x = self.fc1.forward(x);
        let [b, _, hidden] = x.dims();
        let x = x.swap_dims(1, 2).reshape([b, hidden, h, w]);
        let x = if self.extra_relu { relu(x) } else { x };
        let x = self.dwconv.forward(x).flatten::<3>(2, 3).swap_dims(1, 2);
        let x = self.drop.forward(gelu(x));
        self.drop.forward(self.fc2.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm1: Norm<B>,
    attn: Attention<B>,
    drop_path1: DropPath,
    norm2: Norm<B>,
    mlp: MlpWithDepthwiseConv<B>,
    drop_path2: DropPath,
}

impl<B: Backend> Block<B> {
    pub fn drop_path_prob(&self) -> f64 {
        self.drop_path1.prob()
    }

    pub fn forward(&self, x: Tensor<B, 3>, size: (usize, usize)) -> Tensor<B, 3> {
        let attn = self.attn.forward(self.norm1.forward(x.clone()), size);
        let x = x + self.drop_path1.forward(attn);
        let mlp = self.mlp.forward(self.norm2.forward(x.clone()), size);
        x + self.drop_path2.forward(mlp)
    }
}

/// Construction parameters of one [`PyramidVisionTransformerStage`].
#[derive(Debug, Clone, PartialEq)]
pub struct PvtStageConfig {
    pub dim: usize,
    pub dim_out: usize,
    pub depth: usize,
    pub downsample: bool,
    pub num_heads: usize,
    pub sr_ratio: usize,
    pub mlp_ratio: f64,
    pub linear_attn: bool,
    pub qkv_bias: bool,
    pub proj_drop: f64,
    pub attn_drop: f64,
    /// One stochastic-depth probability per block.
    pub drop_path: Vec<f64>,
    pub norm_layer: NormLayer,
}

impl PvtStageConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ModelResult<PyramidVisionTransformerStage<B>> {
        if !self.downsample && self.dim != self.dim_out {
            return Err(ModelError::config(format!(
                "stage without downsampling needs matching widths, got {} -> {}",
                self.dim, self.dim_out
            )));
        }
        if self.num_heads == 0 || self.dim_out % self.num_heads != 0 {
            return Err(ModelError::config(format!(
                "stage width {} is not divisible by {} heads",
                self.dim_out, self.num_heads
            )));
        }
        if self.drop_path.len() != self.depth {
            return Err(ModelError::config(format!(
                "drop path schedule has {} entries for {} blocks",
                self.drop_path.len(),
                self.depth
            )));
        }

        let downsample = self.downsample.then(|| {
            OverlapPatchEmbed::new(self.dim, self.dim_out, 3, 2, &self.norm_layer, device)
        });
        let hidden = ((self.dim_out as f64) * self.mlp_ratio) as usize;
        let blocks = self
            .drop_path
            .iter()
            .map(|&prob| Block {
                norm1: self.norm_layer.init(self.dim_out, device),
                attn: Attention::new(
                    self.dim_out,
                    self.num_heads,
                    self.sr_ratio,
                    self.linear_attn,
                    self.qkv_bias,
                    self.attn_drop,
                    self.proj_drop,
                    &self.norm_layer,
                    device,
                ),
                drop_path1: DropPath::new(prob),
                norm2: self.norm_layer.init(self.dim_out, device),
                mlp: MlpWithDepthwiseConv::new(
                    self.dim_out,
                    hidden.max(1),
                    self.proj_drop,
                    self.linear_attn,
                    device,
                ),
                drop_path2: DropPath::new(prob),
            })
            .collect();

        Ok(PyramidVisionTransformerStage {
            downsample,
            blocks,
            norm: self.norm_layer.init(self.dim_out, device),
            dim: self.dim,
            dim_out: self.dim_out,
        })
    }
}

#[derive(Module, Debug)]
pub struct PyramidVisionTransformerStage<B: Backend> {
    downsample: Option<OverlapPatchEmbed<B>>,
    blocks: Vec<Block<B>>,
    norm: Norm<B>,
    dim: usize,
    dim_out: usize,
}

impl<B: Backend> PyramidVisionTransformerStage<B> {
    pub fn in_channels(&self) -> usize {
        self.dim
    }

    pub fn out_channels(&self) -> usize {
        self.dim_out
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn downsamples(&self) -> bool {
        self.downsample.is_some()
    }

    pub fn drop_path_probs(&self) -> Vec<f64> {
        self.blocks.iter().map(Block::drop_path_prob).collect()
    }

    /// `[N, C, H, W]` → `[N, C', H', W']`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.downsample {
            Some(downsample) => downsample.forward(x),
            None => x.permute([0, 2, 3, 1]),
        };
        let [b, h, w, c] = x.dims();
        let mut x = x.reshape([b, h * w, c]);
        for block in &self.blocks {
            x = block.forward(x, (h, w));
        }
        self.norm
            .forward(x)
            .reshape([b, h, w, c])
            .permute([0, 3, 1, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::NormKind;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    fn stage_config(dim: usize, dim_out: usize, downsample: bool) -> PvtStageConfig {
        PvtStageConfig {
            dim,
            dim_out,
            depth: 2,
            downsample,
            num_heads: 2,
            sr_ratio: 2,
            mlp_ratio: 2.0,
            linear_attn: false,
            qkv_bias: true,
            proj_drop: 0.0,
            attn_drop: 0.0,
            drop_path: vec![0.0, 0.1],
            norm_layer: NormLayer::new(NormKind::LayerNorm),
        }
    }

    #[test]
    fn schedule_is_split_by_depth() {
        let groups = drop_path_schedule(&[1, 2, 1], 0.3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![0.0]);
        assert_eq!(groups[1].len(), 2);
        assert!((groups[1][0] - 0.1).abs() < 1e-12);
        assert_eq!(groups[2], vec![0.3]);
    }

    #[test]
    fn schedule_with_single_block_is_zero() {
        assert_eq!(drop_path_schedule(&[1], 0.5), vec![vec![0.0]]);
        assert_eq!(drop_path_schedule(&[0, 0], 0.5), vec![Vec::<f64>::new(), Vec::new()]);
    }

    #[test]
    fn downsampling_stage_halves_resolution() {
        let device = Default::default();
        let stage = stage_config(8, 16, true).init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([2, 8, 8, 8], &device);
        assert_eq!(stage.forward(x).dims(), [2, 16, 4, 4]);
        assert_eq!(stage.drop_path_probs(), vec![0.0, 0.1]);
    }

    #[test]
    fn plain_stage_keeps_resolution() {
        let device = Default::default();
        let stage = stage_config(8, 8, false).init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 6, 6], &device);
        assert_eq!(stage.forward(x).dims(), [1, 8, 6, 6]);
        assert!(!stage.downsamples());
    }

    #[test]
    fn plain_stage_rejects_width_change() {
        let device = Default::default();
        let err = stage_config(8, 16, false)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn linear_attention_pools_keys() {
        let device = Default::default();
        let cfg = PvtStageConfig {
            linear_attn: true,
            ..stage_config(4, 8, true)
        };
        let stage = cfg.init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 28, 28], &device);
        assert_eq!(stage.forward(x).dims(), [1, 8, 14, 14]);
    }

    #[test]
    fn drop_path_is_active_only_with_autodiff() {
        let device = Default::default();
        let drop = DropPath::new(0.5);
        let x = Tensor::<TestBackend, 3>::ones([4, 3, 2], &device);
        let out: f32 = drop.forward(x).sum().into_scalar();
        assert_eq!(out, 24.0);

        let x = Tensor::<Autodiff<TestBackend>, 3>::ones([64, 3, 2], &device);
        let values = drop.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
    }
}
