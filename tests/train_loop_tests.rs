use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use imagenet_trainer::data::{ArrayDataset, BatchLoader, LoaderOptions};
use imagenet_trainer::distributed::NullCommunicator;
use imagenet_trainer::model::build_model;
use imagenet_trainer::training::scheduler::LrMode;
use imagenet_trainer::training::Trainer;
use imagenet_trainer::utils::checkpoint;
use imagenet_trainer::utils::config::{CompressionParams, TrainConfig};

const CLASSES: usize = 4;
const INPUT_SIZE: usize = 8;

fn tiny_config(save_dir: PathBuf) -> TrainConfig {
    TrainConfig {
        model: "mlp".to_string(),
        classes: CLASSES,
        batch_size: 8,
        num_epochs: 2,
        input_size: INPUT_SIZE,
        dtype: "float32".to_string(),
        lr: 0.05,
        momentum: 0.9,
        wd: 1e-4,
        lr_mode: LrMode::Cosine,
        lr_decay: 0.1,
        lr_decay_period: 0,
        lr_decay_epoch: vec![],
        warmup_lr: 0.0,
        warmup_epochs: 1,
        no_wd: false,
        mixup: false,
        mixup_alpha: 0.2,
        mixup_off_epoch: 0,
        label_smoothing: false,
        teacher: None,
        teacher_params: None,
        temperature: 20.0,
        hard_weight: 0.5,
        use_rec: false,
        rec_train: PathBuf::new(),
        rec_val: PathBuf::new(),
        data_dir: PathBuf::new(),
        num_workers: 1,
        save_frequency: 1,
        save_dir,
        resume_epoch: 0,
        resume_params: None,
        resume_states: None,
        log_interval: 0,
        compression: CompressionParams::default(),
    }
}

fn loaders(seed: u64) -> anyhow::Result<(BatchLoader, BatchLoader)> {
    let train = ArrayDataset::synthetic(32, CLASSES, INPUT_SIZE, seed)?;
    let val = ArrayDataset::synthetic(16, CLASSES, INPUT_SIZE, seed + 1)?;
    let train = BatchLoader::new(train, LoaderOptions::train(8, 1, 0))?;
    let val = BatchLoader::new(val, LoaderOptions::val(8, 1, 0))?;
    Ok((train, val))
}

#[test]
fn test_evaluation_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = tiny_config(dir.path().to_path_buf());
    let (train, mut val) = loaders(11)?;

    let mut trainer = Trainer::new(
        cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train.num_batches(),
    )?;

    let first = trainer.evaluate(&mut val)?;
    let second = trainer.evaluate(&mut val)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_fit_writes_checkpoint_artifacts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let save_dir = dir.path().to_path_buf();
    let cfg = tiny_config(save_dir.clone());
    let (mut train, mut val) = loaders(23)?;

    let mut trainer = Trainer::new(
        cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train.num_batches(),
    )?;
    trainer.fit(&mut train, &mut val)?;

    // Periodic artifacts for both epochs plus the terminal save.
    for epoch in 0..2 {
        let stem = checkpoint::periodic_stem("mlp", epoch);
        assert!(
            checkpoint::params_path(&save_dir, &stem).exists(),
            "missing params for epoch {}",
            epoch
        );
        assert!(
            checkpoint::states_path(&save_dir, &stem).exists(),
            "missing states for epoch {}",
            epoch
        );
    }

    // A best checkpoint exists whenever some epoch improved on the
    // initial error bound.
    if trainer.best_val_error() < 1.0 {
        let best_found = std::fs::read_dir(&save_dir)?
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with("-best.params")
            });
        assert!(best_found, "no best checkpoint written");
    }
    Ok(())
}

#[test]
fn test_mixup_run_uses_rmse_metric() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = tiny_config(dir.path().to_path_buf());
    cfg.mixup = true;
    cfg.label_smoothing = true;
    cfg.mixup_off_epoch = 1;
    cfg.save_frequency = 0;

    let (mut train, mut val) = loaders(37)?;
    let mut trainer = Trainer::new(
        cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train.num_batches(),
    )?;

    trainer.train_epoch(0, &mut train)?;
    let (err1, err5) = trainer.evaluate(&mut val)?;
    assert!((0.0..=1.0).contains(&err1));
    assert!(err5 <= err1 + 1e-9);
    Ok(())
}

#[test]
fn test_distillation_pipeline() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let teacher_path = dir.path().join("teacher.params");

    // Pretrain stand-in: save a freshly initialized teacher.
    let device = Device::Cpu;
    let teacher_varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&teacher_varmap, DType::F32, &device);
    let _teacher = build_model("mlp", CLASSES, INPUT_SIZE, vb)?;
    checkpoint::save_parameters(&teacher_varmap, &teacher_path, None, None)?;

    let mut cfg = tiny_config(dir.path().to_path_buf());
    cfg.teacher = Some("mlp".to_string());
    cfg.teacher_params = Some(teacher_path);
    cfg.hard_weight = 0.5;
    cfg.label_smoothing = true;
    cfg.save_frequency = 0;

    let (mut train, mut val) = loaders(53)?;
    let mut trainer = Trainer::new(
        cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train.num_batches(),
    )?;

    trainer.train_epoch(0, &mut train)?;
    let (err1, _err5) = trainer.evaluate(&mut val)?;
    assert!((0.0..=1.0).contains(&err1));
    Ok(())
}

#[test]
fn test_resume_from_periodic_checkpoint() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let save_dir = dir.path().to_path_buf();

    let cfg = tiny_config(save_dir.clone());
    let (mut train, mut val) = loaders(71)?;
    let mut trainer = Trainer::new(
        cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train.num_batches(),
    )?;
    trainer.fit(&mut train, &mut val)?;

    let stem = checkpoint::periodic_stem("mlp", 0);
    let mut resumed_cfg = tiny_config(save_dir.clone());
    resumed_cfg.resume_epoch = 1;
    resumed_cfg.resume_params = Some(checkpoint::params_path(&save_dir, &stem));
    resumed_cfg.resume_states = Some(checkpoint::states_path(&save_dir, &stem));

    let (mut train2, mut val2) = loaders(71)?;
    let mut resumed = Trainer::new(
        resumed_cfg,
        vec![Device::Cpu],
        Arc::new(NullCommunicator),
        train2.num_batches(),
    )?;
    resumed.fit(&mut train2, &mut val2)?;
    Ok(())
}
