use crate::{
    common::*,
    config::{CheckpointConfig, LoadCheckpoint, Monitor},
    utils::EpochMetrics,
};
use once_cell::sync::Lazy;
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_(\d+)_(\d+)_[^_]+\.ckpt$",
    )
    .unwrap()
});

/// The fields encoded in a checkpoint filename.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointName {
    pub datetime: DateTime<chrono::FixedOffset>,
    pub epoch: usize,
    pub step: usize,
}

impl CheckpointName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
        let datetime = DateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
        let epoch = captures.get(2)?.as_str().parse().ok()?;
        let step = captures.get(3)?.as_str().parse().ok()?;
        Some(Self {
            datetime,
            epoch,
            step,
        })
    }
}

/// Save parameters to a checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    epoch: usize,
    training_step: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{:03}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        epoch,
        training_step,
        loss
    );
    let path = checkpoint_dir.join(filename);
    vs.save(&path)?;
    info!("save checkpoint file {}", path.display());
    Ok(path)
}

/// Find the most recent checkpoint file in all runs under the logging directory.
pub fn find_recent_checkpoint(logging_dir: &Path) -> Result<Option<PathBuf>> {
    let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
    let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;

    let checkpoint_file = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let CheckpointName {
                datetime,
                epoch,
                step,
            } = CheckpointName::parse(file_name)?;
            Some((path, (datetime, epoch, step)))
        })
        .max_by_key(|(_path, key)| *key)
        .map(|(path, _key)| path);

    Ok(checkpoint_file)
}

/// Load parameters from a diretory with specified checkpoint loading method.
///
/// It returns the path of the loaded checkpoint file.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = find_recent_checkpoint(logging_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "{} is not a file", file.display());
            Some(file.to_owned())
        }
    };

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        vs.load_partial(path)?;
    }

    Ok(path)
}

/// Decides at which epochs a checkpoint is saved.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    period_epochs: usize,
    save_best_only: bool,
    monitor: Monitor,
    best: f64,
}

impl CheckpointPolicy {
    pub fn new(config: &CheckpointConfig) -> Self {
        let CheckpointConfig {
            period_epochs,
            save_best_only,
            monitor,
        } = *config;

        Self {
            period_epochs: period_epochs.get(),
            save_best_only,
            monitor,
            best: monitor.initial_best(),
        }
    }

    /// The best monitored value seen by best-only saving.
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Restore the best monitored value saved in a checkpoint.
    ///
    /// NaN keeps the initial best value.
    pub fn restore_best(&mut self, best: f64) {
        if !best.is_nan() {
            self.best = best;
        }
    }

    /// Check if a checkpoint should be saved after the zero-based `epoch`.
    pub fn should_save(&mut self, epoch: usize, metrics: &EpochMetrics) -> bool {
        if (epoch + 1) % self.period_epochs != 0 {
            return false;
        }
        if !self.save_best_only {
            return true;
        }

        match metrics.get(self.monitor) {
            Some(current) if self.monitor.is_improvement(current, self.best, 0.0) => {
                info!(
                    "{:?} improved from {} to {}",
                    self.monitor, self.best, current
                );
                self.best = current;
                true
            }
            Some(_) => false,
            None => {
                warn!(
                    "metric {:?} is not available, skip saving checkpoint",
                    self.monitor
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f64) -> EpochMetrics {
        EpochMetrics {
            loss,
            accuracy: 0.0,
            val_loss: None,
            val_accuracy: None,
        }
    }

    #[test]
    fn parse_checkpoint_name() {
        let name = CheckpointName::parse("2022-04-01-12-30-45.123+0800_004_000125_00.12345.ckpt")
            .unwrap();
        assert_eq!(name.epoch, 4);
        assert_eq!(name.step, 125);

        assert!(CheckpointName::parse("model_05_0.12.h5").is_none());
        assert!(CheckpointName::parse("2022-04-01_004_000125_00.12345.ckpt").is_none());
    }

    #[test]
    fn save_and_find_recent() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let run_dir = logging_dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&run_dir)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let mut var = vs.root().zeros_no_train("value", &[]);

        ensure!(find_recent_checkpoint(logging_dir.path())?.is_none());

        let first = save_checkpoint(&vs, &run_dir, 4, 100, 0.5)?;
        std::thread::sleep(Duration::from_millis(10));
        tch::no_grad(|| var.copy_(&Tensor::from(7f32)));
        let second = save_checkpoint(&vs, &run_dir, 9, 200, 0.25)?;
        ensure!(first != second);

        let recent = find_recent_checkpoint(logging_dir.path())?;
        ensure!(recent.as_ref() == Some(&second));

        let mut restored = nn::VarStore::new(Device::Cpu);
        let value = restored.root().zeros_no_train("value", &[]);
        let loaded = try_load_checkpoint(
            &mut restored,
            logging_dir.path(),
            &LoadCheckpoint::FromRecent,
        )?;
        ensure!(loaded == Some(second));
        ensure!(f32::from(&value) == 7.0);

        Ok(())
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let result = try_load_checkpoint(
            &mut vs,
            Path::new("."),
            &LoadCheckpoint::FromFile {
                file: PathBuf::from("no-such-checkpoint.ckpt"),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn checkpoint_period() {
        let mut policy = CheckpointPolicy::new(&CheckpointConfig::default());
        let saved: Vec<_> = (0..12)
            .filter(|&epoch| policy.should_save(epoch, &metrics(1.0)))
            .collect();
        assert_eq!(saved, vec![4, 9]);
    }

    #[test]
    fn checkpoint_best_only() {
        let mut policy = CheckpointPolicy::new(&CheckpointConfig {
            period_epochs: NonZeroUsize::new(1).unwrap(),
            save_best_only: true,
            monitor: Monitor::Loss,
        });
        assert!(policy.should_save(0, &metrics(1.0)));
        assert!(!policy.should_save(1, &metrics(1.5)));
        assert!(policy.should_save(2, &metrics(0.5)));
        assert!(!policy.should_save(3, &metrics(0.5)));
        assert_eq!(policy.best(), 0.5);
    }

    #[test]
    fn resumed_policy_keeps_best() {
        let config = CheckpointConfig {
            period_epochs: NonZeroUsize::new(1).unwrap(),
            save_best_only: true,
            monitor: Monitor::Loss,
        };

        let mut policy = CheckpointPolicy::new(&config);
        policy.restore_best(0.5);
        assert!(!policy.should_save(4, &metrics(0.7)));
        assert!(policy.should_save(5, &metrics(0.4)));

        let mut policy = CheckpointPolicy::new(&config);
        policy.restore_best(f64::NAN);
        assert!(policy.should_save(4, &metrics(0.7)));
    }

    #[test]
    fn recent_checkpoint_ties_break_by_epoch() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let checkpoint_dir = logging_dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;

        let time = "2022-04-01-12-30-45.123+0800";
        for epoch in [4, 9] {
            let name = format!("{}_{:03}_{:06}_00.50000.ckpt", time, epoch, epoch * 10);
            std::fs::write(checkpoint_dir.join(name), b"")?;
        }

        let recent = find_recent_checkpoint(logging_dir.path())?
            .ok_or_else(|| format_err!("no checkpoint found"))?;
        let name = recent
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(CheckpointName::parse)
            .ok_or_else(|| format_err!("invalid checkpoint name"))?;
        ensure!(name.epoch == 9 && name.step == 90);

        Ok(())
    }
}
