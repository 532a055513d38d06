pub mod util;

pub use util::{run_main, HeadReport, TrainNetArgs};

/// Backend alias for tool runs (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type ToolBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type ToolBackend = burn_ndarray::NdArray<f32>;
