//! Name → constructor table for ROI box heads.
//!
//! The table is built explicitly by application startup code and consulted
//! with `MODEL.ROI_BOX_HEAD.NAME`; nothing registers itself globally.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::box_head::Pvt4BoxHeadConfig;
use crate::config::FctConfig;
use crate::error::{ModelError, ModelResult};
use crate::shape::ShapeSpec;

pub const PVT4_BOX_HEAD: &str = "PVT4BoxHead";

/// Runtime interface shared by all ROI box heads.
pub trait RoiBoxHead<B: Backend> {
    /// `[rois, C, H, W]` pooled features → head features.
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;
    fn output_shape(&self) -> ShapeSpec;
    fn num_params(&self) -> usize;
}

pub type BoxHeadFactory<B> = fn(
    &FctConfig,
    ShapeSpec,
    &<B as Backend>::Device,
) -> ModelResult<Box<dyn RoiBoxHead<B>>>;

#[derive(Debug, Clone)]
pub struct BoxHeadRegistry<B: Backend> {
    factories: BTreeMap<String, BoxHeadFactory<B>>,
}

impl<B: Backend> Default for BoxHeadRegistry<B> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<B: Backend> BoxHeadRegistry<B> {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding every head this crate provides.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .factories
            .insert(PVT4_BOX_HEAD.to_string(), build_pvt4_box_head::<B>);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: BoxHeadFactory<B>,
    ) -> ModelResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(ModelError::DuplicateHead(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the head named by `MODEL.ROI_BOX_HEAD.NAME`.
    pub fn build(
        &self,
        cfg: &FctConfig,
        input_shape: ShapeSpec,
        device: &B::Device,
    ) -> ModelResult<Box<dyn RoiBoxHead<B>>> {
        self.build_named(&cfg.model.roi_box_head.name, cfg, input_shape, device)
    }

    pub fn build_named(
        &self,
        name: &str,
        cfg: &FctConfig,
        input_shape: ShapeSpec,
        device: &B::Device,
    ) -> ModelResult<Box<dyn RoiBoxHead<B>>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ModelError::UnknownHead {
                name: name.to_string(),
                registered: self.names().collect::<Vec<_>>().join(", "),
            })?;
        tracing::info!(head = name, input = %input_shape, "building ROI box head");
        factory(cfg, input_shape, device)
    }
}

fn build_pvt4_box_head<B: Backend>(
    cfg: &FctConfig,
    input_shape: ShapeSpec,
    device: &B::Device,
) -> ModelResult<Box<dyn RoiBoxHead<B>>> {
    let head = Pvt4BoxHeadConfig::from_config(cfg, input_shape).init::<B>(device)?;
    Ok(Box::new(head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn defaults_contain_pvt4() {
        let registry = BoxHeadRegistry::<TestBackend>::with_defaults();
        assert!(registry.contains(PVT4_BOX_HEAD));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![PVT4_BOX_HEAD]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = BoxHeadRegistry::<TestBackend>::with_defaults();
        let err = registry
            .register(PVT4_BOX_HEAD, build_pvt4_box_head::<TestBackend>)
            .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateHead(_)));
        registry
            .register("Alias", build_pvt4_box_head::<TestBackend>)
            .unwrap();
        assert!(registry.contains("Alias"));
    }

    #[test]
    fn unknown_name_lists_registered_heads() {
        let registry = BoxHeadRegistry::<TestBackend>::with_defaults();
        let mut cfg = FctConfig::default();
        cfg.model.roi_box_head.name = "FastRCNNConvFCHead".into();
        let err = registry
            .build(&cfg, ShapeSpec::new(256, 14, 14), &Default::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("PVT4BoxHead"));
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let registry = BoxHeadRegistry::<TestBackend>::empty();
        assert!(!registry.contains(PVT4_BOX_HEAD));
    }
}
