//! The training program for dog/cat image classification.

pub mod common;
pub mod config;
pub mod data;
pub mod logging;
pub mod model;
pub mod processor;
pub mod train;
pub mod training_stream;
pub mod utils;

use crate::{common::*, data::TrainingRecord, training_stream::TrainingStream};

/// The entry of training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();
    let run_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };
    let checkpoint_dir: Arc<Path> = run_dir.join("checkpoints").into_boxed_path().into();

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*run_dir).await?;
        tokio::fs::create_dir_all(&*checkpoint_dir).await?;
        let path = run_dir.join("config.json");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
        info!("write run files to {}", run_dir.display());
    }

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(16);
    let (data_tx, data_rx) = mpsc::channel::<TrainingRecord>(2);
    let (init_epoch_tx, init_epoch_rx) = oneshot::channel();

    // load dataset
    info!("loading dataset");
    let dataset = Arc::new(TrainingStream::new(&config, Some(logging_tx.clone())).await?);
    let dataset_summary = train::DatasetSummary {
        num_classes: dataset.num_classes(),
        balanced_class_weights: dataset.balanced_class_weights(),
    };
    info!(
        "classes: {:?}, {} steps per epoch, {} validation records",
        dataset.classes(),
        dataset.steps_per_epoch(),
        dataset.num_validation_records()
    );

    // start logger
    let logging_future = logging::logging_worker(config.clone(), run_dir.clone(), logging_rx).await?;

    // feeding worker
    let training_data_future = tokio::task::spawn(async move {
        let init_epoch = init_epoch_rx
            .await
            .map_err(|_| format_err!("training worker stopped before training"))?;
        let mut train_stream = dataset.train_stream(init_epoch)?;

        while let Some(result) = train_stream
            .next()
            .instrument(trace_span!("recv_next_batch"))
            .await
        {
            let record = result?;
            data_tx
                .send(record)
                .instrument(trace_span!("send_batch_to_training_loop"))
                .await
                .map_err(|_| format_err!("failed to send message to training worker"))?;
        }

        Fallible::Ok(())
    })
    .map(|result| Fallible::Ok(result??));

    // training worker
    let training_worker_future = {
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            train::training_worker(
                config,
                checkpoint_dir,
                dataset_summary,
                init_epoch_tx,
                data_rx,
                logging_tx,
            )
        })
        .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(training_data_future, training_worker_future, logging_future)?;

    Ok(())
}
