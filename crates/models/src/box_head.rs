use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::{FctConfig, PvtConfig};
use crate::error::ModelResult;
use crate::norm::{NormKind, NormLayer};
use crate::pvt::{drop_path_schedule, PvtStageConfig, PyramidVisionTransformerStage};
use crate::registry::RoiBoxHead;
use crate::shape::{FeatureInfo, ShapeSpec};

/// Constructor arguments of [`Pvt4BoxHead`].
///
/// `pvt` describes a full staged backbone; the head only instantiates its
/// deepest level.
#[derive(Debug, Clone, PartialEq)]
pub struct Pvt4BoxHeadConfig {
    pub input_shape: ShapeSpec,
    pub pvt: PvtConfig,
}

impl Pvt4BoxHeadConfig {
    pub fn new(input_shape: ShapeSpec) -> Self {
        Self {
            input_shape,
            pvt: PvtConfig::default(),
        }
    }

    pub fn with_pvt(mut self, pvt: PvtConfig) -> Self {
        self.pvt = pvt;
        self
    }

    /// Reads `MODEL.PVT.*` from `cfg`.
    pub fn from_config(cfg: &FctConfig, input_shape: ShapeSpec) -> Self {
        Self {
            input_shape,
            pvt: cfg.model.pvt.clone(),
        }
    }

    /// Stage parameters for the last pyramid level.
    pub fn stage_config(&self) -> ModelResult<(usize, PvtStageConfig)> {
        let pvt = &self.pvt;
        pvt.validate()?;
        let norm_layer = NormLayer::new(pvt.norm_layer.parse::<NormKind>()?);
        let i = pvt.last_level()?;
        let drop_path = drop_path_schedule(&pvt.depths, pvt.drop_path_rate)
            .into_iter()
            .nth(i)
            .unwrap_or_default();
        let stage = PvtStageConfig {
            dim: self.input_shape.channels,
            dim_out: pvt.embed_dims[i],
            depth: pvt.depths[i],
            downsample: i != 0,
            num_heads: pvt.num_heads[i],
            sr_ratio: pvt.sr_ratios[i],
            mlp_ratio: pvt.mlp_ratios[i],
            linear_attn: pvt.linear,
            qkv_bias: pvt.qkv_bias,
            proj_drop: pvt.proj_drop_rate,
            attn_drop: pvt.attn_drop_rate,
            drop_path,
            norm_layer,
        };
        Ok((i, stage))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ModelResult<Pvt4BoxHead<B>> {
        let (i, stage_cfg) = self.stage_config()?;
        let stage = stage_cfg.init(device)?;
        let feature_info = FeatureInfo::for_stage(i, stage_cfg.dim_out);
        let stride = if stage_cfg.downsample { 2 } else { 1 };
        let output_shape = self.input_shape.strided(stage_cfg.dim_out, stride);
        tracing::debug!(
            stage = %feature_info.module,
            depth = stage_cfg.depth,
            input = %self.input_shape,
            output = %output_shape,
            "built PVT4 box head"
        );
        Ok(Pvt4BoxHead {
            stage,
            feature_info: Ignored(feature_info),
            output_shape: Ignored(output_shape),
        })
    }
}

/// ROI box head made of the deepest stage of a PVT v2 backbone.
#[derive(Module, Debug)]
pub struct Pvt4BoxHead<B: Backend> {
    stage: PyramidVisionTransformerStage<B>,
    feature_info: Ignored<FeatureInfo>,
    output_shape: Ignored<ShapeSpec>,
}

impl<B: Backend> Pvt4BoxHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.stage.forward(x)
    }

    /// Output channels are `embed_dims[i]`. Height and width are halved with
    /// integer division when the stage downsamples, which is every config with
    /// two or more levels. A single-level config builds a stage without patch
    /// merging, so height and width pass through unchanged.
    pub fn output_shape(&self) -> ShapeSpec {
        *self.output_shape
    }

    pub fn feature_info(&self) -> &FeatureInfo {
        &self.feature_info
    }

    pub fn stage(&self) -> &PyramidVisionTransformerStage<B> {
        &self.stage
    }
}

impl<B: Backend> RoiBoxHead<B> for Pvt4BoxHead<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        Pvt4BoxHead::forward(self, x)
    }

    fn output_shape(&self) -> ShapeSpec {
        Pvt4BoxHead::output_shape(self)
    }

    fn num_params(&self) -> usize {
        Module::num_params(self)
    }
}
