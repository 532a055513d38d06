//! Feature-map shape bookkeeping shared by heads and backbones.

use std::fmt;

/// Channel depth and (optional) spatial extent of a feature map.
///
/// `height`/`width` are `None` for channels-only shapes, e.g. the output of a
/// head that flattens its spatial dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeSpec {
    pub channels: usize,
    pub height: Option<usize>,
    pub width: Option<usize>,
}

impl ShapeSpec {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height: Some(height),
            width: Some(width),
        }
    }

    pub fn channels_only(channels: usize) -> Self {
        Self {
            channels,
            height: None,
            width: None,
        }
    }

    /// Same channel count with the spatial extent divided by `stride` (floor).
    pub fn strided(&self, channels: usize, stride: usize) -> Self {
        let stride = stride.max(1);
        Self {
            channels,
            height: self.height.map(|h| h / stride),
            width: self.width.map(|w| w / stride),
        }
    }
}

impl From<usize> for ShapeSpec {
    fn from(channels: usize) -> Self {
        ShapeSpec::channels_only(channels)
    }
}

impl fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim = |d: Option<usize>| d.map(|v| v.to_string()).unwrap_or_else(|| "?".into());
        write!(f, "{}x{}x{}", self.channels, dim(self.height), dim(self.width))
    }
}

/// Describes which backbone stage a module stands in for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureInfo {
    pub num_channels: usize,
    /// Spatial reduction relative to the network input.
    pub reduction: usize,
    pub module: String,
}

impl FeatureInfo {
    /// Info for stage `index` of a pyramid whose stem reduces by 4.
    pub fn for_stage(index: usize, num_channels: usize) -> Self {
        Self {
            num_channels,
            reduction: 4 << index,
            module: format!("stages.{index}"),
        }
    }
}
