use std::fs;

use clap::Parser;
use fct_tools::{run_main, TrainNetArgs};
use models::ShapeSpec;

const SMALL_PVT: &str = r#"
[MODEL.PVT]
DEPTHS = [1, 1]
EMBED_DIMS = [16, 32]
NUM_HEADS = [1, 2]
SR_RATIOS = [2, 1]
MLP_RATIOS = [2.0, 2.0]

[MODEL.ROI_BOX_HEAD]
POOLER_RESOLUTION = 8

[MODEL.FPN]
OUT_CHANNELS = 16
"#;

#[test]
fn runs_head_from_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.toml");
    fs::write(&path, SMALL_PVT).expect("write temp config");

    let args = TrainNetArgs::parse_from([
        "train_net".to_string(),
        "--config-file".to_string(),
        path.display().to_string(),
        "--batch-size".to_string(),
        "3".to_string(),
    ]);
    let report = run_main(args).expect("run head");
    assert_eq!(report.rank, 0);
    assert_eq!(report.world_size, 1);
    assert_eq!(report.head, "PVT4BoxHead");
    assert_eq!(report.input_shape, ShapeSpec::new(16, 8, 8));
    assert_eq!(report.output_shape, ShapeSpec::new(32, 4, 4));
    assert_eq!(report.output_dims, [3, 32, 4, 4]);
    assert!(report.num_params > 0);
}

#[test]
fn overrides_apply_after_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.toml");
    fs::write(&path, SMALL_PVT).expect("write temp config");

    let args = TrainNetArgs::parse_from([
        "train_net".to_string(),
        "--config-file".to_string(),
        path.display().to_string(),
        "MODEL.PVT.EMBED_DIMS".to_string(),
        "[16, 24]".to_string(),
        "MODEL.PVT.DROP_PATH_RATE".to_string(),
        "0.2".to_string(),
    ]);
    let report = run_main(args).expect("run head");
    assert_eq!(report.output_dims, [2, 24, 4, 4]);
}

#[test]
fn odd_pooler_resolution_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.toml");
    fs::write(&path, SMALL_PVT).expect("write temp config");

    let args = TrainNetArgs::parse_from([
        "train_net".to_string(),
        "--config-file".to_string(),
        path.display().to_string(),
        "MODEL.ROI_BOX_HEAD.POOLER_RESOLUTION".to_string(),
        "7".to_string(),
    ]);
    let report = run_main(args).expect("run head");
    assert_eq!(report.input_shape, ShapeSpec::new(16, 7, 7));
    assert_eq!(report.output_shape, ShapeSpec::new(32, 3, 3));
    assert_eq!(report.output_dims, [2, 32, 4, 4]);
}

#[test]
fn unknown_head_name_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.toml");
    fs::write(&path, SMALL_PVT).expect("write temp config");

    let args = TrainNetArgs::parse_from([
        "train_net".to_string(),
        "--config-file".to_string(),
        path.display().to_string(),
        "MODEL.ROI_BOX_HEAD.NAME".to_string(),
        "FastRCNNConvFCHead".to_string(),
    ]);
    let err = run_main(args).unwrap_err();
    let err = err.downcast_ref::<models::ModelError>().expect("model error");
    assert!(matches!(err, models::ModelError::UnknownHead { .. }));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let args = TrainNetArgs::parse_from([
        "train_net".to_string(),
        "--config-file".to_string(),
        dir.path().join("absent.toml").display().to_string(),
    ]);
    let err = run_main(args).unwrap_err();
    assert!(format!("{err:#}").contains("absent.toml"));
}
