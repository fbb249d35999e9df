use crate::{
    common::*,
    config::{Config, DatasetConfig, PreprocessorConfig, TrainingConfig, ValidationConfig},
    data::{ClassDirDataset, FileDataset, FileRecord, GenericDataset, Phase, TrainingRecord},
    logging::LoggingMessage,
    processor::{center_crop, Normalize, RandomAugment, RandomAugmentInit},
};
use futures::stream::BoxStream;

/// Asynchronous data stream for training.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TrainingStream {
    batch_size: usize,
    epochs: usize,
    steps_per_epoch: usize,
    validation_steps: Option<usize>,
    image_size: usize,
    resize_margin: usize,
    mean: [f64; 3],
    std: [f64; 3],
    worker_buf_size: Option<usize>,
    augment: RandomAugment,
    #[derivative(Debug = "ignore")]
    train_set: Arc<ClassDirDataset>,
    #[derivative(Debug = "ignore")]
    validation_set: Option<Arc<ClassDirDataset>>,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
}

/// The records and metadata of a batch to be loaded.
#[derive(Debug, Clone)]
struct BatchJob {
    epoch: usize,
    step: usize,
    phase: Phase,
    end_of_epoch: bool,
    records: Vec<Arc<FileRecord>>,
}

impl TrainingStream {
    pub async fn new(
        config: &Config,
        logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    ) -> Result<Self> {
        let Config {
            dataset:
                DatasetConfig {
                    dir: ref dataset_dir,
                    ref classes,
                    image_size,
                    ref validation,
                },
            preprocessor:
                PreprocessorConfig {
                    resize_margin,
                    horizontal_flip_prob,
                    vertical_flip_prob,
                    transpose_prob,
                    brightness_delta,
                    mean,
                    std,
                    worker_buf_size,
                },
            training:
                TrainingConfig {
                    epochs,
                    batch_size,
                    steps_per_epoch,
                    validation_steps,
                    ..
                },
            ..
        } = *config;
        let image_size = image_size.get();
        let batch_size = batch_size.get();

        // load datasets
        let dataset = ClassDirDataset::load(dataset_dir, classes.as_deref()).await?;
        let (train_set, validation_set) = match validation {
            ValidationConfig::Disabled => (dataset, None),
            ValidationConfig::Dir { dir } => {
                let validation_set =
                    ClassDirDataset::load(dir, Some(dataset.classes())).await?;
                (dataset, Some(validation_set))
            }
            ValidationConfig::Split { ratio, seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let (train_set, validation_set) = dataset.split(ratio.raw(), &mut rng)?;
                (train_set, Some(validation_set))
            }
        };

        let steps_per_epoch = match steps_per_epoch {
            Some(steps) => steps.get(),
            None => (train_set.records().len() / batch_size).max(1),
        };

        let augment = RandomAugmentInit {
            horizontal_flip_prob: horizontal_flip_prob.raw(),
            vertical_flip_prob: vertical_flip_prob.raw(),
            transpose_prob: transpose_prob.raw(),
            brightness_delta: brightness_delta.raw(),
            crop_size: image_size,
        }
        .build()?;

        Ok(Self {
            batch_size,
            epochs: epochs.get(),
            steps_per_epoch,
            validation_steps: validation_steps.map(|steps| steps.get()),
            image_size,
            resize_margin,
            mean: mean.map(|val| val.raw()),
            std: std.map(|val| val.raw()),
            worker_buf_size,
            augment,
            train_set: Arc::new(train_set),
            validation_set: validation_set.map(Arc::new),
            logging_tx,
        })
    }

    pub fn classes(&self) -> &[String] {
        self.train_set.classes()
    }

    pub fn num_classes(&self) -> usize {
        self.train_set.num_classes()
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    pub fn num_validation_records(&self) -> usize {
        self.validation_set
            .as_ref()
            .map(|dataset| dataset.records().len())
            .unwrap_or(0)
    }

    /// Class weights inversely proportional to training class frequencies.
    pub fn balanced_class_weights(&self) -> Vec<f64> {
        self.train_set.balanced_class_weights()
    }

    /// List the batches of an epoch in the order they are yielded.
    fn epoch_jobs<R>(&self, epoch: usize, rng: &mut R) -> Vec<BatchJob>
    where
        R: Rng + ?Sized,
    {
        let batch_size = self.batch_size;
        let steps_per_epoch = self.steps_per_epoch;

        // training batches
        let train_records = self.train_set.records();
        let mut indexes = (0..train_records.len()).collect_vec();
        indexes.shuffle(&mut *rng);

        let train_jobs = indexes
            .into_iter()
            .cycle()
            .chunks(batch_size)
            .into_iter()
            .take(steps_per_epoch)
            .enumerate()
            .map(|(index, chunk)| BatchJob {
                epoch,
                step: epoch * steps_per_epoch + index,
                phase: Phase::Training,
                end_of_epoch: false,
                records: chunk.map(|index| train_records[index].clone()).collect(),
            })
            .collect_vec();

        // validation batches, reshuffled per epoch
        let last_step = (epoch + 1) * steps_per_epoch - 1;
        let validation_jobs = match &self.validation_set {
            Some(dataset) => {
                let num_batches = self.validation_steps.unwrap_or(usize::MAX);
                let mut records = dataset.records().to_vec();
                records.shuffle(rng);

                records
                    .chunks(batch_size)
                    .take(num_batches)
                    .map(|chunk| BatchJob {
                        epoch,
                        step: last_step,
                        phase: Phase::Validation,
                        end_of_epoch: false,
                        records: chunk.to_vec(),
                    })
                    .collect_vec()
            }
            None => vec![],
        };

        let mut jobs = train_jobs;
        jobs.extend(validation_jobs);
        if let Some(last) = jobs.last_mut() {
            last.end_of_epoch = true;
        }
        jobs
    }

    /// Generate batches from `init_epoch` to the last epoch.
    pub fn train_stream(
        self: Arc<Self>,
        init_epoch: usize,
    ) -> Result<BoxStream<'static, Result<TrainingRecord>>> {
        ensure!(
            init_epoch <= self.epochs,
            "the initial epoch {} exceeds the number of epochs {}",
            init_epoch,
            self.epochs
        );

        // parallel stream config
        let par_config: par_stream::ParParams = {
            let buf_size: par_stream::BufSize = self
                .worker_buf_size
                .map(|buf_size| Some(buf_size).into())
                .unwrap_or_else(|| 2.0.into());

            Some(par_stream::ParParamsConfig::Manual {
                num_workers: par_stream::NumWorkers::Default,
                buf_size,
            })
            .into()
        };

        // list batches per epoch
        let stream = {
            let this = self.clone();
            stream::iter(init_epoch..self.epochs).flat_map(move |epoch| {
                let mut rng = StdRng::from_entropy();
                stream::iter(this.epoch_jobs(epoch, &mut rng))
            })
        };

        // load and preprocess images in parallel
        let stream = {
            let this = self;

            stream.par_map(par_config, move |job| {
                let this = this.clone();
                move || {
                    let _span = trace_span!("load_batch").entered();
                    this.load_batch(job)
                }
            })
        };

        Ok(stream.boxed())
    }

    fn load_batch(&self, job: BatchJob) -> Result<TrainingRecord> {
        let BatchJob {
            epoch,
            step,
            phase,
            end_of_epoch,
            records,
        } = job;
        let resize = (self.image_size + self.resize_margin) as i64;

        let (images, labels): (Vec<_>, Vec<_>) = records
            .iter()
            .map(|record| -> Result<_> {
                let FileRecord { path, label } = &**record;
                let image = vision::image::load_and_resize(path, resize, resize)
                    .with_context(|| format!("failed to load image '{}'", path.display()))?;
                let image = image.to_kind(Kind::Float) / 255.0;

                let image = match phase {
                    Phase::Training => self.augment.forward(&image)?,
                    Phase::Validation => center_crop(&image, self.image_size)?,
                };
                Ok((image, *label as i64))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        let image = Tensor::stack(&images, 0);

        // preview augmented images on the first batch of an epoch
        if phase == Phase::Training && step % self.steps_per_epoch == 0 {
            if let Some(logging_tx) = &self.logging_tx {
                let msg = LoggingMessage::new_augmentation_preview("augmentation", epoch, &image);
                let _ = logging_tx.send(msg);
            }
        }

        let normalize = Normalize::new(self.mean, self.std)?;
        let image = normalize.forward(&image);
        let label = Tensor::of_slice(&labels);

        debug!(
            "loaded batch epoch={} step={} phase={:?} size={}",
            epoch,
            step,
            phase,
            labels.len()
        );

        Ok(TrainingRecord {
            epoch,
            step,
            phase,
            end_of_epoch,
            image,
            label,
        })
    }
}
