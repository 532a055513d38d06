use anyhow::{Context, Result};
use clap::Parser;
use cli_support::{init_tracing, strip_worker_flags};
use fct_tools::{run_main, TrainNetArgs};
use launch::{launch, spawn_local_workers, wait_workers, ProcessGroupBootstrap};
use tracing::info;

fn main() -> Result<()> {
    init_tracing()?;
    let args = TrainNetArgs::parse();
    let mut spec = args.launch.launch_spec()?;

    let mut workers = Vec::new();
    if args.spawn_workers && spec.num_processes_per_machine > 1 && spec.local_rank == 0 {
        let url = spec.resolve_dist_url()?;
        spec.dist_url = Some(url.clone());
        let program = std::env::current_exe().context("locate train_net executable")?;
        let argv: Vec<String> = std::env::args().skip(1).collect();
        workers = spawn_local_workers(&spec, &url, &program, &strip_worker_flags(&argv))?;
    }

    let outcome = launch(run_main, &spec, args, &ProcessGroupBootstrap);
    if outcome.is_err() {
        for worker in &mut workers {
            let _ = worker.kill();
        }
    }
    let joined = wait_workers(workers);
    if let Some(report) = outcome? {
        info!(
            output_dims = ?report.output_dims,
            params = report.num_params,
            "single-process run finished"
        );
    }
    joined?;
    Ok(())
}
