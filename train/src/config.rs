//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use model::*;
pub use preprocessor::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    pub fn from_json5(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints that serde alone does not express.
    pub fn validate(&self) -> Result<()> {
        let Self {
            model,
            dataset,
            preprocessor,
            training,
            logging,
        } = self;

        ensure!(
            (0.0..1.0).contains(&model.dropout.raw()),
            "dropout must be in range [0, 1)"
        );

        if let Some(classes) = &dataset.classes {
            ensure!(classes.len() >= 2, "at least two classes are required");
            ensure!(
                classes.iter().all_unique(),
                "class names must not be duplicated"
            );
        }
        if let ValidationConfig::Split { ratio, .. } = dataset.validation {
            ensure!(
                ratio > 0.0 && ratio < 1.0,
                "validation split ratio must be in range (0, 1)"
            );
        }

        {
            let PreprocessorConfig {
                horizontal_flip_prob,
                vertical_flip_prob,
                transpose_prob,
                brightness_delta,
                std,
                ..
            } = *preprocessor;

            for (name, prob) in [
                ("horizontal_flip_prob", horizontal_flip_prob),
                ("vertical_flip_prob", vertical_flip_prob),
                ("transpose_prob", transpose_prob),
            ] {
                ensure!(
                    (0.0..=1.0).contains(&prob.raw()),
                    "{} must be in range [0, 1]",
                    name
                );
            }
            ensure!(
                brightness_delta >= 0.0,
                "brightness_delta must be non-negative"
            );
            ensure!(
                std.iter().all(|val| *val > 0.0),
                "std values must be positive"
            );
        }

        match training.lr_schedule {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr > 0.0, "lr must be positive");
            }
            LearningRateSchedule::StepWise { ref steps } => {
                ensure!(!steps.is_empty(), "steps must not be empty");
            }
            LearningRateSchedule::ReduceOnPlateau {
                lr,
                monitor,
                factor,
                min_lr,
                min_delta,
                ..
            } => {
                ensure!(lr > 0.0, "lr must be positive");
                ensure!(
                    factor > 0.0 && factor < 1.0,
                    "factor must be in range (0, 1)"
                );
                ensure!(min_lr >= 0.0, "min_lr must be non-negative");
                ensure!(min_delta >= 0.0, "min_delta must be non-negative");
                ensure!(
                    !monitor.requires_validation() || dataset.validation.is_enabled(),
                    "monitoring {:?} requires a validation set",
                    monitor
                );
            }
        }

        if let LossConfig::FocalLoss { gamma, alpha } = training.loss {
            ensure!(gamma >= 0.0, "gamma must be non-negative");
            ensure!(alpha > 0.0, "alpha must be positive");
        }

        {
            let CheckpointConfig {
                save_best_only,
                monitor,
                ..
            } = training.checkpoint;
            ensure!(
                !save_best_only || !monitor.requires_validation() || dataset.validation.is_enabled(),
                "monitoring {:?} requires a validation set",
                monitor
            );
        }

        ensure!(
            training.validation_steps.is_none() || dataset.validation.is_enabled(),
            "validation_steps is set but validation is disabled"
        );
        ensure!(logging.max_images > 0, "max_images must be positive");

        Ok(())
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The pretrained feature extractor.
        #[serde(default)]
        pub backbone: BackboneKind,
        /// The libtorch variable store file with pretrained backbone weights.
        pub pretrained_weights: Option<PathBuf>,
        /// If set, only the classification head is trained.
        #[serde(default)]
        pub freeze_backbone: bool,
        /// The dropout probability before the output layer.
        #[serde(default = "default_dropout")]
        pub dropout: R64,
    }

    /// Supported backbone architectures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum BackboneKind {
        Vgg16,
        Resnet18,
        Resnet34,
    }

    impl Default for BackboneKind {
        fn default() -> Self {
            Self::Vgg16
        }
    }

    fn default_dropout() -> R64 {
        r64(0.5)
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The directory where run directories are created.
    pub dir: PathBuf,
    pub enable_images: bool,
    /// The maximum number of images written per image summary.
    pub max_images: usize,
    /// Send a training step summary per this steps.
    pub log_steps: NonZeroUsize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("log"),
            enable_images: true,
            max_images: 3,
            log_steps: NonZeroUsize::new(1).unwrap(),
        }
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory with one subdirectory per class.
        pub dir: PathBuf,
        /// Optional ordered list of class names. The subdirectory names are
        /// sorted and used if it is not set.
        pub classes: Option<Vec<String>>,
        /// The side length of square input images.
        #[serde(default = "default_image_size")]
        pub image_size: NonZeroUsize,
        #[serde(default)]
        pub validation: ValidationConfig,
    }

    /// Source of validation records.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum ValidationConfig {
        /// Skip validation.
        Disabled,
        /// Load validation records from another class directory tree.
        Dir { dir: PathBuf },
        /// Hold out a ratio of training records.
        ///
        /// The held out records are drawn by `seed`, so that a resumed run
        /// validates on the same records.
        Split {
            ratio: R64,
            #[serde(default = "default_split_seed")]
            seed: u64,
        },
    }

    impl ValidationConfig {
        pub fn is_enabled(&self) -> bool {
            !matches!(self, Self::Disabled)
        }
    }

    impl Default for ValidationConfig {
        fn default() -> Self {
            Self::Disabled
        }
    }

    fn default_image_size() -> NonZeroUsize {
        NonZeroUsize::new(224).unwrap()
    }

    fn default_split_seed() -> u64 {
        1
    }
}

mod preprocessor {
    use super::*;

    /// Data preprocessing options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PreprocessorConfig {
        /// Images are resized to `image_size + resize_margin` before cropping.
        pub resize_margin: usize,
        /// The probability to apply horizontal flip.
        pub horizontal_flip_prob: R64,
        /// The probability to apply vertical flip.
        pub vertical_flip_prob: R64,
        /// The probability to swap image height and width axes.
        pub transpose_prob: R64,
        /// The maximum brightness shift in [0, 1] pixel scale.
        pub brightness_delta: R64,
        /// Per-channel RGB mean used for input normalization.
        pub mean: [R64; 3],
        /// Per-channel RGB standard deviation used for input normalization.
        pub std: [R64; 3],
        /// The maximum number of waiting batches in the loading stage.
        pub worker_buf_size: Option<usize>,
    }

    impl Default for PreprocessorConfig {
        fn default() -> Self {
            Self {
                resize_margin: 20,
                horizontal_flip_prob: r64(0.5),
                vertical_flip_prob: r64(0.5),
                transpose_prob: r64(0.5),
                brightness_delta: r64(0.1),
                mean: [r64(0.485), r64(0.456), r64(0.406)],
                std: [r64(0.229), r64(0.224), r64(0.225)],
                worker_buf_size: None,
            }
        }
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TrainingConfig {
        /// The number of epochs.
        pub epochs: NonZeroUsize,
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// If set, it overrides the number of training batches per epoch.
        pub steps_per_epoch: Option<NonZeroUsize>,
        /// If set, only this number of validation batches run per epoch.
        pub validation_steps: Option<NonZeroUsize>,
        /// Adam optimizer options.
        pub optimizer: OptimizerConfig,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The loss function options.
        pub loss: LossConfig,
        /// Per-class loss weighting.
        pub class_weight: ClassWeight,
        /// Checkpoint saving options.
        pub checkpoint: CheckpointConfig,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// The training device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    impl Default for TrainingConfig {
        fn default() -> Self {
            Self {
                epochs: NonZeroUsize::new(80).unwrap(),
                batch_size: NonZeroUsize::new(16).unwrap(),
                steps_per_epoch: None,
                validation_steps: None,
                optimizer: Default::default(),
                lr_schedule: Default::default(),
                loss: Default::default(),
                class_weight: Default::default(),
                checkpoint: Default::default(),
                load_checkpoint: Default::default(),
                device: Device::cuda_if_available(),
            }
        }
    }

    /// Adam optimizer options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct OptimizerConfig {
        pub beta1: R64,
        pub beta2: R64,
        pub weight_decay: R64,
    }

    impl Default for OptimizerConfig {
        fn default() -> Self {
            Self {
                beta1: r64(0.9),
                beta2: r64(0.999),
                weight_decay: r64(0.0),
            }
        }
    }

    /// The learning rate scheduling strategy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Use specific learning rate at specified steps.
        StepWise { steps: Vec<(usize, R64)> },
        /// Scale down the learning rate when the monitored metric stops
        /// improving at the end of epochs.
        ReduceOnPlateau {
            lr: R64,
            monitor: Monitor,
            factor: R64,
            patience: usize,
            min_lr: R64,
            #[serde(default = "default_min_delta")]
            min_delta: R64,
            #[serde(default)]
            cooldown: usize,
        },
    }

    impl Default for LearningRateSchedule {
        fn default() -> Self {
            Self::ReduceOnPlateau {
                lr: r64(1e-3),
                monitor: Monitor::Loss,
                factor: r64(0.5),
                patience: 2,
                min_lr: r64(1e-5),
                min_delta: default_min_delta(),
                cooldown: 0,
            }
        }
    }

    /// An epoch metric watched by schedulers and checkpointing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Monitor {
        Loss,
        Accuracy,
        ValLoss,
        ValAccuracy,
    }

    impl Monitor {
        pub fn requires_validation(&self) -> bool {
            matches!(self, Self::ValLoss | Self::ValAccuracy)
        }

        /// The metric of the same kind computed on training batches.
        pub fn training_counterpart(&self) -> Self {
            match self {
                Self::Loss | Self::ValLoss => Self::Loss,
                Self::Accuracy | Self::ValAccuracy => Self::Accuracy,
            }
        }

        /// Whether greater values are better.
        pub fn is_increasing(&self) -> bool {
            matches!(self, Self::Accuracy | Self::ValAccuracy)
        }

        /// The value that any finite metric improves on.
        pub fn initial_best(&self) -> f64 {
            if self.is_increasing() {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        }

        pub fn is_improvement(&self, current: f64, best: f64, min_delta: f64) -> bool {
            if self.is_increasing() {
                current > best + min_delta
            } else {
                current < best - min_delta
            }
        }
    }

    /// The loss function configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LossConfig {
        CrossEntropy,
        FocalLoss {
            #[serde(default = "default_focal_gamma")]
            gamma: R64,
            #[serde(default = "default_focal_alpha")]
            alpha: R64,
        },
    }

    impl Default for LossConfig {
        fn default() -> Self {
            Self::FocalLoss {
                gamma: default_focal_gamma(),
                alpha: default_focal_alpha(),
            }
        }
    }

    /// Per-class loss weighting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ClassWeight {
        /// Every class weights one.
        Uniform,
        /// Weights are inversely proportional to class frequencies.
        Balanced,
    }

    impl Default for ClassWeight {
        fn default() -> Self {
            Self::Balanced
        }
    }

    /// Checkpoint saving options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CheckpointConfig {
        /// Save a checkpoint per this number of epochs.
        pub period_epochs: NonZeroUsize,
        /// If set, a checkpoint is saved only if the monitored metric improves.
        pub save_best_only: bool,
        pub monitor: Monitor,
    }

    impl Default for CheckpointConfig {
        fn default() -> Self {
            Self {
                period_epochs: NonZeroUsize::new(5).unwrap(),
                save_best_only: false,
                monitor: Monitor::Loss,
            }
        }
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }

    fn default_min_delta() -> R64 {
        r64(1e-4)
    }

    fn default_focal_gamma() -> R64 {
        r64(2.0)
    }

    fn default_focal_alpha() -> R64 {
        r64(0.25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() -> Result<()> {
        let config = Config::from_json5(
            r#"{
                model: {},
                dataset: { dir: "dogcat", classes: ["dog", "cat"] },
            }"#,
        )?;

        assert_eq!(config.model.backbone, BackboneKind::Vgg16);
        assert_eq!(config.dataset.image_size.get(), 224);
        assert_eq!(config.training.epochs.get(), 80);
        assert_eq!(config.training.batch_size.get(), 16);
        assert_eq!(config.training.checkpoint.period_epochs.get(), 5);
        assert_eq!(config.training.class_weight, ClassWeight::Balanced);
        assert!(matches!(
            config.training.loss,
            LossConfig::FocalLoss { gamma, alpha } if gamma == 2.0 && alpha == 0.25
        ));
        assert!(matches!(
            config.training.lr_schedule,
            LearningRateSchedule::ReduceOnPlateau { patience: 2, monitor: Monitor::Loss, .. }
        ));
        assert_eq!(config.logging.max_images, 3);

        Ok(())
    }

    #[test]
    fn bundled_config_is_valid() -> Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("train.json5");
        let config = Config::open(&path)?;
        assert!(config.dataset.validation.is_enabled());
        Ok(())
    }

    #[test]
    fn reject_invalid_values() {
        // a single class
        assert!(Config::from_json5(
            r#"{ model: {}, dataset: { dir: "d", classes: ["dog"] } }"#
        )
        .is_err());

        // probability out of range
        assert!(Config::from_json5(
            r#"{
                model: {},
                dataset: { dir: "d" },
                preprocessor: { horizontal_flip_prob: 1.5 },
            }"#
        )
        .is_err());

        // validation metric without validation set
        assert!(Config::from_json5(
            r#"{
                model: {},
                dataset: { dir: "d" },
                training: {
                    lr_schedule: {
                        type: "ReduceOnPlateau",
                        lr: 0.001,
                        monitor: "val_loss",
                        factor: 0.5,
                        patience: 2,
                        min_lr: 0.00001,
                    },
                },
            }"#
        )
        .is_err());

        // split ratio out of range
        assert!(Config::from_json5(
            r#"{ model: {}, dataset: { dir: "d", validation: { type: "Split", ratio: 1.0 } } }"#
        )
        .is_err());

        // zero standard deviation
        assert!(Config::from_json5(
            r#"{
                model: {},
                dataset: { dir: "d" },
                preprocessor: { std: [0.229, 0.0, 0.225] },
            }"#
        )
        .is_err());

        // plateau factor out of range
        for factor in ["1.0", "0.0"] {
            let text = format!(
                r#"{{
                    model: {{}},
                    dataset: {{ dir: "d" }},
                    training: {{
                        lr_schedule: {{
                            type: "ReduceOnPlateau",
                            lr: 0.001,
                            monitor: "loss",
                            factor: {},
                            patience: 2,
                            min_lr: 0.00001,
                        }},
                    }},
                }}"#,
                factor
            );
            assert!(Config::from_json5(&text).is_err());
        }
    }

    #[test]
    fn split_seed_defaults() -> Result<()> {
        let config = Config::from_json5(
            r#"{ model: {}, dataset: { dir: "d", validation: { type: "Split", ratio: 0.1 } } }"#,
        )?;
        assert!(matches!(
            config.dataset.validation,
            ValidationConfig::Split { seed: 1, .. }
        ));
        Ok(())
    }

    #[test]
    fn monitor_direction() {
        assert!(Monitor::Loss.is_improvement(0.5, 0.6, 1e-4));
        assert!(!Monitor::Loss.is_improvement(0.59995, 0.6, 1e-4));
        assert!(Monitor::ValAccuracy.is_improvement(0.9, 0.8, 0.0));
        assert!(!Monitor::ValAccuracy.is_improvement(0.8, 0.9, 0.0));
        assert!(Monitor::Accuracy.is_improvement(0.1, Monitor::Accuracy.initial_best(), 0.0));
    }
}
