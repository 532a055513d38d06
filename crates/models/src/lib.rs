//! Burn ROI box heads for few-shot object detection.
//!
//! The main model is [`Pvt4BoxHead`]: the deepest stage of a Pyramid Vision
//! Transformer v2, used as the box head on pooled ROI features. It is sized
//! from the same `MODEL.PVT.*` configuration as a full PVT backbone and only
//! instantiates the last pyramid level.
//!
//! - [`FctConfig`]: hierarchical TOML configuration with `KEY VALUE` overrides.
//! - [`PyramidVisionTransformerStage`]: patch merge + attention/MLP blocks.
//! - [`BoxHeadRegistry`]: explicit name → constructor table used at model build.
//! - [`ShapeSpec`]/[`FeatureInfo`]: shape bookkeeping between modules.
//!
//! Models are generic over Burn backends; binaries choose `burn-ndarray` or
//! `burn-wgpu`.

pub mod box_head;
pub mod config;
pub mod error;
pub mod norm;
pub mod pvt;
pub mod registry;
pub mod shape;

pub use box_head::{Pvt4BoxHead, Pvt4BoxHeadConfig};
pub use config::{FctConfig, FpnSection, ModelSection, PvtConfig, RoiBoxHeadSection};
pub use error::{ModelError, ModelResult};
pub use norm::{Norm, NormKind, NormLayer};
pub use pvt::{drop_path_schedule, PvtStageConfig, PyramidVisionTransformerStage};
pub use registry::{BoxHeadFactory, BoxHeadRegistry, RoiBoxHead, PVT4_BOX_HEAD};
pub use shape::{FeatureInfo, ShapeSpec};
