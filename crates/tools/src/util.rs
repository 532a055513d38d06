use anyhow::{bail, Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use clap::Parser;
use cli_support::{ConfigArgs, LaunchArgs};
use launch::comm;
use models::{BoxHeadRegistry, FctConfig, ShapeSpec};
use tracing::{info, warn};

use crate::ToolBackend;

#[derive(Parser, Debug, Clone)]
#[command(name = "train_net", about = "Build the configured ROI box head on every worker")]
pub struct TrainNetArgs {
    #[command(flatten)]
    pub launch: LaunchArgs,
    /// Re-execute this binary for local ranks 1.. instead of starting them by hand.
    #[arg(long, default_value_t = false)]
    pub spawn_workers: bool,
    /// Number of pooled ROIs pushed through the head per worker.
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// What one worker built and observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadReport {
    pub rank: usize,
    pub world_size: usize,
    pub head: String,
    pub input_shape: ShapeSpec,
    pub output_shape: ShapeSpec,
    pub output_dims: [usize; 4],
    pub num_params: usize,
}

/// Per-worker entry point: load config, build the box head from the
/// registry, and push one batch of pooled features through it.
pub fn run_main(args: TrainNetArgs) -> Result<HeadReport> {
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    let cfg = FctConfig::load(args.config.config_file.as_deref(), &args.config.opts)
        .context("load config")?;
    let resolution = cfg.model.roi_box_head.pooler_resolution;
    let input_shape = ShapeSpec::new(cfg.model.fpn.out_channels, resolution, resolution);

    let device = <ToolBackend as Backend>::Device::default();
    let registry = BoxHeadRegistry::<ToolBackend>::with_defaults();
    let head = registry
        .build(&cfg, input_shape, &device)
        .with_context(|| format!("build box head {}", cfg.model.roi_box_head.name))?;

    let x = Tensor::<ToolBackend, 4>::zeros(
        [args.batch_size, input_shape.channels, resolution, resolution],
        &device,
    );
    let output_dims = head.forward(x).dims();
    let output_shape = head.output_shape();
    if output_dims[1] != output_shape.channels {
        bail!(
            "head produced {} channels, declared output shape is {output_shape}",
            output_dims[1]
        );
    }
    // Declared sizes floor odd inputs while the strided conv rounds up.
    let spatial = [output_shape.height, output_shape.width];
    let observed = [output_dims[2], output_dims[3]];
    if spatial
        .iter()
        .zip(observed)
        .any(|(want, got)| want.is_some_and(|want| want != got))
    {
        warn!(
            ?observed,
            declared = %output_shape,
            "head output size differs from declared output shape"
        );
    }

    let report = HeadReport {
        rank: comm::get_rank(),
        world_size: comm::get_world_size(),
        head: cfg.model.roi_box_head.name.clone(),
        input_shape,
        output_shape,
        output_dims,
        num_params: head.num_params(),
    };
    info!(
        rank = report.rank,
        world_size = report.world_size,
        head = %report.head,
        input = %report.input_shape,
        output = %report.output_shape,
        params = report.num_params,
        "box head ready"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_config_flags_share_one_command_line() {
        let args = TrainNetArgs::try_parse_from([
            "train_net",
            "--num-gpus",
            "2",
            "--spawn-workers",
            "--batch-size",
            "4",
            "MODEL.FPN.OUT_CHANNELS",
            "128",
        ])
        .unwrap();
        assert_eq!(args.launch.num_gpus, 2);
        assert!(args.spawn_workers);
        assert_eq!(args.batch_size, 4);
        assert_eq!(args.config.opts, vec!["MODEL.FPN.OUT_CHANNELS", "128"]);
    }

    #[test]
    fn spawned_worker_command_line_parses() {
        // Shape of the argv `spawn_local_workers` produces.
        let args = TrainNetArgs::try_parse_from([
            "train_net",
            "--local-rank",
            "1",
            "--dist-url",
            "tcp://127.0.0.1:29500",
            "--num-gpus",
            "2",
            "MODEL.PVT.DROP_PATH_RATE",
            "0.1",
        ])
        .unwrap();
        let spec = args.launch.launch_spec().unwrap();
        assert_eq!(spec.local_rank, 1);
        assert_eq!(spec.world_size(), 2);
        assert_eq!(args.config.opts.len(), 2);
    }

    #[test]
    fn zero_batch_is_rejected() {
        let args = TrainNetArgs::try_parse_from(["train_net", "--batch-size", "0"]).unwrap();
        assert!(run_main(args).is_err());
    }
}
