use super::ClassificationLoss;
use crate::{
    common::*,
    config::{Config, LoadCheckpoint, LoggingConfig, ModelConfig, OptimizerConfig, TrainingConfig},
    data::{Phase, TrainingRecord},
    logging::{EpochSummaryLog, LoggingMessage, TrainingStepLog},
    model::{self, Model},
    utils::{
        self, CheckpointPolicy, EpochMetrics, LrScheduler, MeanMeter, PlateauProgress, RateCounter,
    },
};

/// Dataset properties the training worker depends on.
#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub num_classes: usize,
    pub balanced_class_weights: Vec<f64>,
}

/// Running sums of a training epoch.
#[derive(Debug, Default)]
struct EpochMeters {
    loss: MeanMeter,
    accuracy: MeanMeter,
    val_loss: MeanMeter,
    val_accuracy: MeanMeter,
}

impl EpochMeters {
    fn metrics(&self) -> EpochMetrics {
        EpochMetrics {
            loss: self.loss.mean().unwrap_or(f64::NAN),
            accuracy: self.accuracy.mean().unwrap_or(f64::NAN),
            val_loss: self.val_loss.mean(),
            val_accuracy: self.val_accuracy.mean(),
        }
    }
}

/// Start the training worker on the configured device.
///
/// The worker reports the epoch to start from on `init_epoch_tx`, and then
/// consumes batches from `data_rx` until the channel is closed.
pub fn training_worker(
    config: Arc<Config>,
    checkpoint_dir: Arc<Path>,
    dataset: DatasetSummary,
    init_epoch_tx: oneshot::Sender<usize>,
    mut data_rx: mpsc::Receiver<TrainingRecord>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<()> {
    let Config {
        model: ref model_config,
        training:
            TrainingConfig {
                optimizer:
                    OptimizerConfig {
                        beta1,
                        beta2,
                        weight_decay,
                    },
                ref lr_schedule,
                ref loss,
                class_weight,
                ref checkpoint,
                ref load_checkpoint,
                device,
                ..
            },
        logging:
            LoggingConfig {
                dir: ref logging_dir,
                enable_images,
                log_steps,
                ..
            },
        ..
    } = *config;
    let DatasetSummary {
        num_classes,
        ref balanced_class_weights,
    } = dataset;
    info!("use device {:?}", device);

    // init model
    info!("initializing model");

    const DUMMY_LR: f64 = 1.0;

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();

    let model = Model::new(&root, model_config, num_classes)?;
    let loss_fn =
        ClassificationLoss::new(&root / "loss", loss, class_weight, balanced_class_weights)?;
    let mut epoch_tensor = root.zeros_no_train("epoch", &[]);
    let mut training_step_tensor = root.zeros_no_train("training_step", &[]);
    let mut lr_tensor = root.zeros_no_train("learning_rate", &[]);
    let mut plateau_best_tensor = root.zeros_no_train("plateau_best", &[]);
    let mut plateau_wait_tensor = root.zeros_no_train("plateau_wait", &[]);
    let mut plateau_cooldown_tensor = root.zeros_no_train("plateau_cooldown", &[]);
    let mut checkpoint_best_tensor = root.zeros_no_train("checkpoint_best", &[]);

    // best values stay NaN unless restored
    plateau_best_tensor.fill_(f64::NAN);
    checkpoint_best_tensor.fill_(f64::NAN);

    // load pretrained weights
    if let Some(path) = &model_config.pretrained_weights {
        info!("load pretrained weights {}", path.display());
        let missing = vs
            .load_partial(path)
            .with_context(|| format!("failed to load pretrained weights '{}'", path.display()))?;
        debug!("variables not found in pretrained weights: {:?}", missing);
    }

    // load checkpoint
    let checkpoint_file = utils::try_load_checkpoint(&mut vs, logging_dir, load_checkpoint)?;
    let restored = match (load_checkpoint, &checkpoint_file) {
        (LoadCheckpoint::Disabled, _) | (_, None) => None,
        (_, Some(_)) => {
            let plateau = PlateauProgress {
                lr: f64::from(&lr_tensor),
                best: f64::from(&plateau_best_tensor),
                wait: f32::from(&plateau_wait_tensor) as usize,
                cooldown_counter: f32::from(&plateau_cooldown_tensor) as usize,
            };
            Some((
                f32::from(&epoch_tensor) as usize,
                f32::from(&training_step_tensor) as usize,
                (plateau.lr > 0.0).then(|| plateau),
                f64::from(&checkpoint_best_tensor),
            ))
        }
    };
    let (init_epoch, init_training_step) = restored
        .map(|(epoch, step, ..)| (epoch, step))
        .unwrap_or((0, 0));
    info!(
        "start from epoch {} and training step {}",
        init_epoch, init_training_step
    );

    // freeze backbone
    if let ModelConfig {
        freeze_backbone: true,
        ..
    } = *model_config
    {
        let num_frozen = model::freeze_backbone(&vs);
        info!("freeze {} backbone variables", num_frozen);
    }

    let mut optimizer = nn::Adam {
        beta1: beta1.raw(),
        beta2: beta2.raw(),
        wd: weight_decay.raw(),
    }
    .build(&vs, DUMMY_LR)?;

    // tell the feeder where to start
    init_epoch_tx
        .send(init_epoch)
        .map_err(|_| format_err!("cannot send initial epoch to data feeder"))?;

    // training
    info!("start training");
    let mut lr_scheduler = LrScheduler::new(lr_schedule, init_training_step)?;
    let mut checkpoint_policy = CheckpointPolicy::new(checkpoint);
    if let Some((_, _, plateau, checkpoint_best)) = restored {
        if let Some(plateau) = plateau {
            lr_scheduler.restore_plateau(plateau);
        }
        checkpoint_policy.restore_best(checkpoint_best);
    }
    let mut rate_counter = RateCounter::with_second_interval();
    let mut meters = EpochMeters::default();
    let mut last_training_step = init_training_step;

    optimizer.set_lr(lr_scheduler.next());

    while let Some(record) = data_rx.blocking_recv() {
        let TrainingRecord {
            epoch,
            step,
            phase,
            end_of_epoch,
            image,
            label,
        } = record.to_device(device);
        let batch_size = label.size1()? as usize;

        match phase {
            Phase::Training => {
                let _span = trace_span!("training_step", step).entered();

                // forward pass
                let logits = model.forward_t(&image, true)?;

                // optimizer
                let loss = loss_fn.forward(&logits, &label);
                optimizer.backward_step(&loss);

                let loss = f64::from(&loss);
                let accuracy = utils::accuracy(&logits, &label);
                meters.loss.add(loss, batch_size);
                meters.accuracy.add(accuracy, batch_size);

                // print message
                rate_counter.add(1.0);
                if let Some(batch_rate) = rate_counter.rate() {
                    let record_rate = batch_rate * batch_size as f64;
                    info!(
                        "epoch: {}\tstep: {}\tlr: {:.5}\tloss: {:.5}\tacc: {:.3}\t{:.2} batches/s\t{:.2} records/s",
                        epoch,
                        step,
                        lr_scheduler.lr(),
                        loss,
                        accuracy,
                        batch_rate,
                        record_rate
                    );
                }

                // send to logger
                if step % log_steps.get() == 0 {
                    logging_tx
                        .send(LoggingMessage::new_training_step(
                            "training",
                            TrainingStepLog {
                                step,
                                lr: r64(lr_scheduler.lr()),
                                loss,
                                accuracy,
                                input: enable_images.then(|| image.shallow_clone()),
                            },
                        ))
                        .map_err(|_err| format_err!("cannot send message to logger"))?;
                }

                // update lr
                optimizer.set_lr(lr_scheduler.next());

                // update training step
                last_training_step = step;
                training_step_tensor.copy_(&Tensor::from((step + 1) as f32));
            }
            Phase::Validation => {
                let _span = trace_span!("validation_step", step).entered();

                let (loss, accuracy) = tch::no_grad(|| -> Result<_> {
                    let logits = model.forward_t(&image, false)?;
                    let loss = f64::from(loss_fn.forward(&logits, &label));
                    let accuracy = utils::accuracy(&logits, &label);
                    Ok((loss, accuracy))
                })?;
                meters.val_loss.add(loss, batch_size);
                meters.val_accuracy.add(accuracy, batch_size);
            }
        }

        if end_of_epoch {
            let metrics = meters.metrics();
            meters = EpochMeters::default();

            match (metrics.val_loss, metrics.val_accuracy) {
                (Some(val_loss), Some(val_accuracy)) => info!(
                    "epoch {} finished\tloss: {:.5}\tacc: {:.3}\tval_loss: {:.5}\tval_acc: {:.3}",
                    epoch, metrics.loss, metrics.accuracy, val_loss, val_accuracy
                ),
                _ => info!(
                    "epoch {} finished\tloss: {:.5}\tacc: {:.3}",
                    epoch, metrics.loss, metrics.accuracy
                ),
            }

            // schedule lr
            if let Some(lr) = lr_scheduler.on_epoch_end(&metrics) {
                optimizer.set_lr(lr);
            }

            let should_save = checkpoint_policy.should_save(epoch, &metrics);

            // persist training state
            epoch_tensor.copy_(&Tensor::from((epoch + 1) as f32));
            lr_tensor.copy_(&Tensor::from(lr_scheduler.lr() as f32));
            if let Some(PlateauProgress {
                best,
                wait,
                cooldown_counter,
                ..
            }) = lr_scheduler.plateau_progress()
            {
                plateau_best_tensor.copy_(&Tensor::from(best as f32));
                plateau_wait_tensor.copy_(&Tensor::from(wait as f32));
                plateau_cooldown_tensor.copy_(&Tensor::from(cooldown_counter as f32));
            }
            checkpoint_best_tensor.copy_(&Tensor::from(checkpoint_policy.best() as f32));

            // save checkpoint
            if should_save {
                utils::save_checkpoint(
                    &vs,
                    &checkpoint_dir,
                    epoch,
                    last_training_step,
                    metrics.loss,
                )?;
            }

            // send to logger
            let (head_weight_mean, head_weight_std) = tch::no_grad(|| {
                let weight = &model.head().linear().ws;
                (
                    f64::from(weight.mean(Kind::Float)),
                    f64::from(weight.std(true)),
                )
            });
            logging_tx
                .send(LoggingMessage::new_epoch_summary(
                    "epoch",
                    EpochSummaryLog {
                        epoch,
                        lr: r64(lr_scheduler.lr()),
                        metrics,
                        head_weight_mean,
                        head_weight_std,
                    },
                ))
                .map_err(|_err| format_err!("cannot send message to logger"))?;
        }
    }

    info!("training finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(logging_dir: &Path, load_checkpoint: &str) -> Result<Config> {
        config_with(
            logging_dir,
            load_checkpoint,
            r#"{ type: "Constant", lr: 0.001 }"#,
            "{ period_epochs: 1 }",
        )
    }

    fn config_with(
        logging_dir: &Path,
        load_checkpoint: &str,
        lr_schedule: &str,
        checkpoint: &str,
    ) -> Result<Config> {
        let text = format!(
            r#"{{
                model: {{ backbone: "Resnet18" }},
                dataset: {{ dir: "dogcat", image_size: 32 }},
                training: {{
                    epochs: 2,
                    batch_size: 2,
                    device: "cpu",
                    lr_schedule: {},
                    checkpoint: {},
                    load_checkpoint: {},
                }},
                logging: {{ dir: "{}", enable_images: false }},
            }}"#,
            lr_schedule,
            checkpoint,
            load_checkpoint,
            logging_dir.display()
        );
        Config::from_json5(&text)
    }

    fn record(epoch: usize, step: usize, phase: Phase, end_of_epoch: bool) -> TrainingRecord {
        TrainingRecord {
            epoch,
            step,
            phase,
            end_of_epoch,
            image: Tensor::randn(&[2, 3, 32, 32], (Kind::Float, Device::Cpu)),
            label: Tensor::of_slice(&[0i64, 1]),
        }
    }

    fn run(
        config: Config,
        checkpoint_dir: &Path,
        records: Vec<TrainingRecord>,
    ) -> Result<usize> {
        let (init_epoch_tx, init_epoch_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(records.len().max(1));
        let (logging_tx, mut logging_rx) = broadcast::channel(16);

        for record in records {
            data_tx
                .blocking_send(record)
                .map_err(|_| format_err!("cannot send record"))?;
        }
        drop(data_tx);

        training_worker(
            Arc::new(config),
            checkpoint_dir.into(),
            DatasetSummary {
                num_classes: 2,
                balanced_class_weights: vec![1.0, 1.0],
            },
            init_epoch_tx,
            data_rx,
            logging_tx,
        )?;

        let num_summaries = std::iter::from_fn(|| logging_rx.try_recv().ok())
            .filter(|msg| matches!(msg.kind, crate::logging::LoggingMessageKind::EpochSummary(_)))
            .count();
        ensure!(num_summaries == 1);

        Ok(init_epoch_rx.blocking_recv()?)
    }

    #[test]
    fn train_and_resume() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let checkpoint_dir = logging_dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;

        // the first epoch from scratch
        let init_epoch = run(
            config(logging_dir.path(), r#"{ type: "Disabled" }"#)?,
            &checkpoint_dir,
            vec![
                record(0, 0, Phase::Training, false),
                record(0, 1, Phase::Training, false),
                record(0, 1, Phase::Validation, true),
            ],
        )?;
        ensure!(init_epoch == 0);
        ensure!(std::fs::read_dir(&checkpoint_dir)?.count() == 1);

        // resume from the saved checkpoint
        let init_epoch = run(
            config(logging_dir.path(), r#"{ type: "FromRecent" }"#)?,
            &checkpoint_dir,
            vec![
                record(1, 2, Phase::Training, false),
                record(1, 3, Phase::Training, true),
            ],
        )?;
        ensure!(init_epoch == 1);
        ensure!(std::fs::read_dir(&checkpoint_dir)?.count() == 2);

        Ok(())
    }

    #[test]
    fn resume_keeps_best_values() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let checkpoint_dir = logging_dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;

        let lr_schedule = r#"{
            type: "ReduceOnPlateau",
            lr: 0.001,
            monitor: "loss",
            factor: 0.5,
            patience: 2,
            min_lr: 0.00001,
        }"#;
        let checkpoint = r#"{ period_epochs: 1, save_best_only: true, monitor: "loss" }"#;

        // the first epoch always improves
        run(
            config_with(
                logging_dir.path(),
                r#"{ type: "Disabled" }"#,
                lr_schedule,
                checkpoint,
            )?,
            &checkpoint_dir,
            vec![
                record(0, 0, Phase::Training, false),
                record(0, 1, Phase::Training, true),
            ],
        )?;
        let paths: Vec<_> = std::fs::read_dir(&checkpoint_dir)?
            .map(|entry| -> Result<_> { Ok(entry?.path()) })
            .collect::<Result<_>>()?;
        ensure!(paths.len() == 1);
        let path = &paths[0];

        let named_tensors = Tensor::load_multi(path)?;
        let value = |name: &str| -> Result<f64> {
            named_tensors
                .iter()
                .find(|(var_name, _)| var_name == name)
                .map(|(_, tensor)| f64::from(tensor))
                .ok_or_else(|| format_err!("'{}' is not saved", name))
        };
        let checkpoint_best = value("checkpoint_best")?;
        ensure!(checkpoint_best.is_finite());
        ensure!(value("plateau_best")? == checkpoint_best);
        ensure!(value("plateau_wait")? == 0.0);
        ensure!(value("plateau_cooldown")? == 0.0);

        // make the saved best value unbeatable
        let named_tensors: Vec<_> = named_tensors
            .into_iter()
            .map(|(name, tensor)| {
                if name == "checkpoint_best" {
                    (name, Tensor::from(-1f32))
                } else {
                    (name, tensor)
                }
            })
            .collect();
        Tensor::save_multi(&named_tensors, path)?;

        // the resumed run keeps the best value and saves nothing
        let init_epoch = run(
            config_with(
                logging_dir.path(),
                r#"{ type: "FromRecent" }"#,
                lr_schedule,
                checkpoint,
            )?,
            &checkpoint_dir,
            vec![
                record(1, 2, Phase::Training, false),
                record(1, 3, Phase::Training, true),
            ],
        )?;
        ensure!(init_epoch == 1);
        ensure!(std::fs::read_dir(&checkpoint_dir)?.count() == 1);

        Ok(())
    }
}
