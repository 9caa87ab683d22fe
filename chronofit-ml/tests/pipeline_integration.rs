//! End-to-end runs of the training pipeline and the sweep controller.

use chronofit_ml::config::Features;
use chronofit_ml::runtime::{MatmulPrecision, float32_matmul_precision};
use chronofit_ml::training::sweep::{SweepController, SweepSpace, TrialStatus};
use chronofit_ml::{ExperimentConfig, ExperimentRunner, MlError, ModelFamily};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};

fn smoke_config(log_dir: &Path) -> ExperimentConfig {
    ExperimentConfig {
        loader: "synthetic".into(),
        tracking: false,
        log_dir: log_dir.to_path_buf(),
        seq_len: 8,
        pred_len: 4,
        batch_size: 8,
        eval_batch_size: 8,
        train_epochs: 2,
        ..ExperimentConfig::default()
    }
}

fn write_csv(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("toy.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "date,load,OT").unwrap();
    for t in 0..rows {
        let x = t as f32 * 0.1;
        writeln!(file, "2020-01-01 {t},{},{}", x.sin(), (x * 0.5).cos()).unwrap();
    }
    path
}

#[test]
fn synthetic_forecast_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let report = ExperimentRunner::new()
        .run(smoke_config(dir.path()))
        .unwrap();

    assert_eq!(report.epochs_run, 2);
    assert!(report.test_loss().is_some_and(f64::is_finite));
    assert!(!report.lr_history.is_empty());
    assert!(report.checkpoint_dir.join("last.ckpt").exists());
    assert!(report.checkpoint_dir.join("checkpoints.json").exists());
    let best = report.best_checkpoint.as_deref().unwrap();
    assert!(best.starts_with("epoch="));
    assert!(report.checkpoint_dir.join(best).exists());
}

#[test]
fn full_precision_run_relaxes_matmul_precision() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        precision: "32".into(),
        train_epochs: 1,
        ..smoke_config(dir.path())
    };
    let report = ExperimentRunner::new().run(config).unwrap();
    assert_eq!(report.matmul_precision, MatmulPrecision::High);
    assert_eq!(float32_matmul_precision(), MatmulPrecision::High);
}

#[test]
fn diffusion_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        model_family: ModelFamily::Diffusion,
        timesteps: 50,
        train_epochs: 1,
        ..smoke_config(dir.path())
    };
    let report = ExperimentRunner::new().run(config).unwrap();
    assert_eq!(report.epochs_run, 1);
    assert!(report.test_loss().is_some_and(f64::is_finite));
}

#[test]
fn same_seed_reproduces_run() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let first = ExperimentRunner::new().run(smoke_config(a.path())).unwrap();
    let second = ExperimentRunner::new().run(smoke_config(b.path())).unwrap();
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first.lr_history, second.lr_history);

    let c = tempfile::tempdir().unwrap();
    let other = ExperimentRunner::new()
        .run(ExperimentConfig {
            random_seed: 7,
            ..smoke_config(c.path())
        })
        .unwrap();
    assert_ne!(first.metrics, other.metrics);
}

#[test]
fn csv_run_infers_channels() {
    let dir = tempfile::tempdir().unwrap();
    write_csv(dir.path(), 600);
    let config = ExperimentConfig {
        loader: "csv".into(),
        root_path: dir.path().to_path_buf(),
        data_path_pretrain: "toy.csv".into(),
        features: Features::MultiToUni,
        target: "OT".into(),
        ..smoke_config(dir.path())
    };
    let report = ExperimentRunner::new().run(config).unwrap();
    assert!(report.test_loss().is_some_and(f64::is_finite));
}

#[test]
fn missing_dataset_is_a_run_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        loader: "csv".into(),
        root_path: dir.path().to_path_buf(),
        data_path_pretrain: "absent.csv".into(),
        ..smoke_config(dir.path())
    };
    let err = ExperimentRunner::new().run(config).unwrap_err();
    assert!(!err.is_config());
}

#[test]
fn checkpoint_failures_do_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let report = ExperimentRunner::new().run(smoke_config(&blocker)).unwrap();
    assert_eq!(report.epochs_run, 2);
    // best + last for each of the two epochs
    assert_eq!(report.checkpoint_failures.len(), 4);
    assert!(report.best_checkpoint.is_none());
    assert!(report.test_loss().is_some_and(f64::is_finite));
}

#[test]
fn early_stopping_halts_before_max_epochs() {
    let dir = tempfile::tempdir().unwrap();
    // Updates this small underflow to zero in f32, so the weights never move
    // and the second epoch's val_loss ties the first.
    let config = ExperimentConfig {
        train_epochs: 30,
        patience: 1,
        learning_rate: 1e-300,
        ..smoke_config(dir.path())
    };
    let report = ExperimentRunner::new().run(config).unwrap();
    assert!(report.stopped_early);
    assert_eq!(report.epochs_run, 2);
}

#[test]
fn sweep_runs_exact_budget_despite_data_errors() {
    let dir = tempfile::tempdir().unwrap();
    let base = ExperimentConfig {
        loader: "csv".into(),
        root_path: dir.path().to_path_buf(),
        data_path_pretrain: "absent.csv".into(),
        ..smoke_config(dir.path())
    };
    let mut controller = SweepController::new(base, SweepSpace::default(), 3, 11).unwrap();
    let report = controller.run(&ExperimentRunner::new());

    assert_eq!(report.trials.len(), 3);
    assert!(report.trials.iter().all(|t| t.status == TrialStatus::Failed));
    assert!(report.trials.iter().all(|t| t.seed == Some(2021)));
    let saved = report.save(dir.path()).unwrap();
    assert!(saved.exists());
}

#[test]
fn sweep_trials_use_sampled_seed_and_fields() {
    let dir = tempfile::tempdir().unwrap();
    let space: SweepSpace = serde_json::from_value(json!({
        "method": "grid",
        "metric": {"name": "val_loss", "goal": "minimize"},
        "parameters": {
            "random_seed": {"values": [1, 2]},
            "train_epochs": {"values": [1]}
        }
    }))
    .unwrap();
    let base = ExperimentConfig {
        random_seed: 999,
        ..smoke_config(dir.path())
    };
    let mut controller = SweepController::new(base, space, 10, 0).unwrap();
    assert_eq!(controller.budget(), 2);

    let mut seen = Vec::new();
    let runner = ExperimentRunner::new();
    let report = controller.run_with(|config| {
        seen.push((config.random_seed, config.train_epochs, config.seq_len));
        runner.run(config)
    });
    seen.sort();
    assert_eq!(seen, vec![(1, 1, 8), (2, 1, 8)]);
    assert_eq!(report.failed(), 0);
    assert!(report.best().is_some_and(|t| t.metric.is_some()));
}

#[test]
fn sweep_rejects_zero_count() {
    let err = SweepController::new(ExperimentConfig::default(), SweepSpace::default(), 0, 0)
        .unwrap_err();
    assert!(matches!(err, MlError::Config(_)));
}
