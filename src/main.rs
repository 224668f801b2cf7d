use std::sync::Arc;

use candle_core::Device;
use clap::Parser;
use tracing::info;

use imagenet_trainer::cli::Args;
use imagenet_trainer::data::{ArrayDataset, BatchLoader, LoaderOptions};
use imagenet_trainer::distributed::{CollectiveCommunicator, NullCommunicator};
use imagenet_trainer::training::Trainer;
use imagenet_trainer::utils::logging;
use imagenet_trainer::Result;

fn main() {
    if let Err(e) = run() {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let logging_file = args.logging_file.clone();
    let num_gpus = args.num_gpus;
    let cfg = args.into_config()?;

    let comm: Arc<dyn CollectiveCommunicator> = Arc::new(NullCommunicator);
    let nworker = comm.world_size();
    let rank = comm.rank();

    logging::init_run_logging(logging::run_log_file_name(
        nworker,
        &cfg.model,
        &logging_file,
    ))?;
    info!(?cfg, nworker, rank, "starting training run");

    let devices = build_devices(num_gpus)?;

    let (train_ds, val_ds) = if cfg.use_rec {
        (
            ArrayDataset::from_record(&cfg.rec_train)?,
            ArrayDataset::from_record(&cfg.rec_val)?,
        )
    } else {
        (
            ArrayDataset::from_dir(cfg.data_dir.join("train"))?,
            ArrayDataset::from_dir(cfg.data_dir.join("val"))?,
        )
    };
    info!(
        train_samples = train_ds.len(),
        val_samples = val_ds.len(),
        data_workers = cfg.num_workers,
        "data pipeline ready"
    );

    let mut train_loader =
        BatchLoader::new(train_ds, LoaderOptions::train(cfg.batch_size, nworker, rank))?;
    let mut val_loader =
        BatchLoader::new(val_ds, LoaderOptions::val(cfg.batch_size, nworker, rank))?;

    let mut trainer = Trainer::new(cfg, devices, comm, train_loader.num_batches())?;
    trainer.fit(&mut train_loader, &mut val_loader)?;

    info!(
        best_err_top1 = trainer.best_val_error(),
        "training complete"
    );
    Ok(())
}

fn build_devices(num_gpus: usize) -> Result<Vec<Device>> {
    if num_gpus == 0 {
        info!("training on CPU");
        return Ok(vec![Device::Cpu]);
    }
    (0..num_gpus)
        .map(|i| {
            let device = Device::new_cuda(i)?;
            Ok(device)
        })
        .collect()
}
