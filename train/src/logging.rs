//! Data logging toolkit.

use crate::{
    common::*,
    config::{Config, LoggingConfig, PreprocessorConfig},
    processor::Normalize,
    utils::{EpochMetrics, RateCounter},
};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Derivative)]
    #[derivative(Debug)]
    pub struct LoggingWorker {
        config: Arc<Config>,
        #[derivative(Debug = "ignore")]
        event_writer: EventWriter<BufWriter<File>>,
        normalize: Normalize,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            config: Arc<Config>,
            run_dir: &Path,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            // prepare dirs
            let event_dir = run_dir.join("events");
            let event_path_prefix = event_dir
                .join("dogcat")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-unicode event path {:?}", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;
            let normalize = {
                let PreprocessorConfig { mean, std, .. } = config.preprocessor;
                Normalize::new(mean.map(|val| val.raw()), std.map(|val| val.raw()))?
            };
            let rate_counter = RateCounter::with_second_interval();

            Ok(Self {
                config,
                event_writer,
                normalize,
                rate_counter,
                rx,
            })
        }

        /// Start the data logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(num_skipped)) => {
                        debug!("logger skipped {} messages", num_skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match kind {
                    LoggingMessageKind::TrainingStep(msg) => {
                        self.log_training_step(&tag, msg).await?;
                    }
                    LoggingMessageKind::EpochSummary(msg) => {
                        self.log_epoch_summary(&tag, msg).await?;
                    }
                    LoggingMessageKind::AugmentationPreview(msg) => {
                        self.log_augmentation_preview(&tag, msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    debug!("processed {:.2} events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_training_step(&mut self, tag: &str, msg: TrainingStepLog) -> Result<()> {
            let TrainingStepLog {
                step,
                lr,
                loss,
                accuracy,
                input,
            } = msg;
            let step = step as i64;

            self.event_writer
                .write_scalar_async(format!("{}/params/learning_rate", tag), step, lr.raw() as f32)
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/loss", tag), step, loss as f32)
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/accuracy", tag), step, accuracy as f32)
                .await?;

            if let Some(input) = input {
                if let Some(images) = self.prepare_images(input, true).await? {
                    self.event_writer
                        .write_image_list_async(format!("{}/image/input", tag), step, images)
                        .await?;
                }
            }

            Ok(())
        }

        async fn log_epoch_summary(&mut self, tag: &str, msg: EpochSummaryLog) -> Result<()> {
            let EpochSummaryLog {
                epoch,
                lr,
                metrics:
                    EpochMetrics {
                        loss,
                        accuracy,
                        val_loss,
                        val_accuracy,
                    },
                head_weight_mean,
                head_weight_std,
            } = msg;
            let step = epoch as i64;

            let scalars = [
                ("loss", Some(loss)),
                ("accuracy", Some(accuracy)),
                ("val_loss", val_loss),
                ("val_accuracy", val_accuracy),
                ("params/learning_rate", Some(lr.raw())),
                ("params/head_weight_mean", Some(head_weight_mean)),
                ("params/head_weight_std", Some(head_weight_std)),
            ];

            for (name, value) in scalars {
                if let Some(value) = value {
                    self.event_writer
                        .write_scalar_async(format!("{}/{}", tag, name), step, value as f32)
                        .await?;
                }
            }

            Ok(())
        }

        async fn log_augmentation_preview(
            &mut self,
            tag: &str,
            msg: AugmentationPreviewLog,
        ) -> Result<()> {
            let AugmentationPreviewLog { epoch, images } = msg;

            if let Some(images) = self.prepare_images(images, false).await? {
                self.event_writer
                    .write_image_list_async(format!("{}/image", tag), epoch as i64, images)
                    .await?;
            }

            Ok(())
        }

        /// Truncate a `[B, 3, H, W]` batch to at most `max_images` images on CPU.
        ///
        /// Normalized images are mapped back to [0, 1] scale.
        async fn prepare_images(&self, images: Tensor, normalized: bool) -> Result<Option<Tensor>> {
            let LoggingConfig {
                enable_images,
                max_images,
                ..
            } = self.config.logging;

            if !enable_images {
                return Ok(None);
            }

            let normalize = self.normalize.clone();
            let images = tokio::task::spawn_blocking(move || -> Result<_> {
                tch::no_grad(|| {
                    let (batch_size, _c, _h, _w) = images.size4()?;
                    let images = images
                        .narrow(0, 0, batch_size.min(max_images as i64))
                        .to_device(Device::Cpu);
                    let images = if normalized {
                        normalize.inverse(&images)
                    } else {
                        images.clamp(0.0, 1.0)
                    };
                    Ok(images)
                })
            })
            .await??;

            Ok(Some(images))
        }
    }

    /// Start the logging worker and return the future of its completion.
    pub async fn logging_worker(
        config: Arc<Config>,
        run_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(config, &run_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, TensorLike, Clone)]
    pub struct LoggingMessage {
        #[tensor_like(clone)]
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(tag: S, msg: TrainingStepLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingStep(msg),
            }
        }

        pub fn new_epoch_summary<S>(tag: S, msg: EpochSummaryLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::EpochSummary(msg),
            }
        }

        /// Images are in `[batch, 3, height, width]` shape and [0, 1] scale.
        pub fn new_augmentation_preview<S>(tag: S, epoch: usize, images: &Tensor) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::AugmentationPreview(AugmentationPreviewLog {
                    epoch,
                    images: images.shallow_clone(),
                }),
            }
        }
    }

    #[derive(Debug, TensorLike)]
    pub enum LoggingMessageKind {
        TrainingStep(TrainingStepLog),
        EpochSummary(EpochSummaryLog),
        AugmentationPreview(AugmentationPreviewLog),
    }

    impl Clone for LoggingMessageKind {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }

    #[derive(Debug, TensorLike)]
    pub struct TrainingStepLog {
        pub step: usize,
        #[tensor_like(clone)]
        pub lr: R64,
        #[tensor_like(clone)]
        pub loss: f64,
        #[tensor_like(clone)]
        pub accuracy: f64,
        /// Normalized input images.
        pub input: Option<Tensor>,
    }

    #[derive(Debug, Clone, TensorLike)]
    pub struct EpochSummaryLog {
        pub epoch: usize,
        #[tensor_like(clone)]
        pub lr: R64,
        #[tensor_like(clone)]
        pub metrics: EpochMetrics,
        #[tensor_like(clone)]
        pub head_weight_mean: f64,
        #[tensor_like(clone)]
        pub head_weight_std: f64,
    }

    #[derive(Debug, TensorLike)]
    pub struct AugmentationPreviewLog {
        pub epoch: usize,
        pub images: Tensor,
    }
}
