use crate::{
    common::*,
    config::{LearningRateSchedule, Monitor},
    utils::EpochMetrics,
};

#[derive(Debug, Clone)]
pub enum LrScheduler {
    Constant {
        lr: f64,
    },
    StepWise {
        lr_cache: f64,
        step: usize,
        index: usize,
        steps: Vec<(usize, f64)>,
    },
    ReduceOnPlateau(PlateauState),
}

/// The state of reduce-on-plateau scheduling.
#[derive(Debug, Clone)]
pub struct PlateauState {
    lr: f64,
    monitor: Monitor,
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    cooldown: usize,
    best: f64,
    wait: usize,
    cooldown_counter: usize,
}

/// The part of plateau scheduling state that is kept across runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateauProgress {
    pub lr: f64,
    pub best: f64,
    pub wait: usize,
    pub cooldown_counter: usize,
}

impl LrScheduler {
    pub fn new(config: &LearningRateSchedule, init_step: impl Into<Option<usize>>) -> Result<Self> {
        let init_step = init_step.into();

        let mut scheduler = match *config {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr > 0.0, "the lr must be positive");
                Self::Constant { lr: lr.raw() }
            }
            LearningRateSchedule::StepWise { ref steps } => {
                ensure!(
                    !steps.is_empty() && steps[0].0 == 0,
                    "the steps must start from zero"
                );

                steps.iter().try_fold(None, |prev_step, (curr_step, lr)| -> Result<_> {
                    if let Some(prev_step) = prev_step {
                        ensure!(curr_step > prev_step, "the steps must be monotonic");
                    }
                    ensure!(lr.raw() > 0.0, "lr must be positive");
                    Ok(Some(curr_step))
                })?;

                let steps: Vec<_> = steps.iter().map(|(step, lr)| (*step, lr.raw())).collect();

                Self::StepWise {
                    lr_cache: steps[0].1,
                    step: 0,
                    index: 0,
                    steps,
                }
            }
            LearningRateSchedule::ReduceOnPlateau {
                lr,
                monitor,
                factor,
                patience,
                min_lr,
                min_delta,
                cooldown,
            } => {
                ensure!(lr > 0.0, "the lr must be positive");
                ensure!(
                    factor > 0.0 && factor < 1.0,
                    "the factor must be in range (0, 1)"
                );

                Self::ReduceOnPlateau(PlateauState {
                    lr: lr.raw(),
                    monitor,
                    factor: factor.raw(),
                    patience,
                    min_lr: min_lr.raw(),
                    min_delta: min_delta.raw(),
                    cooldown,
                    best: monitor.initial_best(),
                    wait: 0,
                    cooldown_counter: 0,
                })
            }
        };

        if let Some(init_step) = init_step {
            scheduler.set_step(init_step);
        }

        Ok(scheduler)
    }

    pub fn set_step(&mut self, new_step: usize) {
        if let Self::StepWise {
            step,
            index,
            steps,
            lr_cache,
        } = self
        {
            *step = new_step;
            let new_index =
                match steps.binary_search_by_key(&new_step, |(step_thresh, _lr)| *step_thresh) {
                    Ok(new_index) => new_index,
                    Err(new_index) => new_index.saturating_sub(1),
                };
            *index = new_index;
            *lr_cache = steps[new_index].1;
        }
    }

    /// The resumable progress of plateau scheduling.
    pub fn plateau_progress(&self) -> Option<PlateauProgress> {
        match self {
            Self::ReduceOnPlateau(state) => Some(PlateauProgress {
                lr: state.lr,
                best: state.best,
                wait: state.wait,
                cooldown_counter: state.cooldown_counter,
            }),
            _ => None,
        }
    }

    /// Restore the progress of plateau scheduling saved in a checkpoint.
    ///
    /// A NaN `best` keeps the initial best value.
    pub fn restore_plateau(&mut self, progress: PlateauProgress) {
        if let Self::ReduceOnPlateau(state) = self {
            let PlateauProgress {
                lr,
                best,
                wait,
                cooldown_counter,
            } = progress;

            state.lr = lr.max(state.min_lr);
            if !best.is_nan() {
                state.best = best;
            }
            state.wait = wait;
            state.cooldown_counter = cooldown_counter.min(state.cooldown);
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::StepWise { lr_cache, .. } => *lr_cache,
            Self::ReduceOnPlateau(state) => state.lr,
        }
    }

    /// Get the learning rate of the current step and advance one step.
    pub fn next(&mut self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::StepWise {
                step,
                index,
                steps,
                lr_cache,
            } => {
                let lr = steps[*index].1;
                *step += 1;
                let next_index = *index + 1;
                if next_index < steps.len() && *step == steps[next_index].0 {
                    *index = next_index;
                }
                *lr_cache = lr;
                lr
            }
            Self::ReduceOnPlateau(state) => state.lr,
        }
    }

    /// Report the metrics at the end of an epoch.
    ///
    /// It returns the new learning rate if it is reduced.
    pub fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> Option<f64> {
        let state = match self {
            Self::ReduceOnPlateau(state) => state,
            _ => return None,
        };

        let current = metrics.get(state.monitor).unwrap_or_else(|| {
            let fallback = state.monitor.training_counterpart();
            warn!(
                "metric {:?} is not available, use {:?} instead",
                state.monitor, fallback
            );
            metrics.get(fallback).unwrap_or(metrics.loss)
        });
        state.step(current)
    }
}

impl PlateauState {
    fn step(&mut self, current: f64) -> Option<f64> {
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if self.monitor.is_improvement(current, self.best, self.min_delta) {
            self.best = current;
            self.wait = 0;
            return None;
        }

        if self.cooldown_counter > 0 {
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }

        self.wait = 0;
        self.cooldown_counter = self.cooldown;

        if self.lr <= self.min_lr {
            return None;
        }

        let new_lr = (self.lr * self.factor).max(self.min_lr);
        info!(
            "reduce learning rate from {:e} to {:e}",
            self.lr, new_lr
        );
        self.lr = new_lr;
        Some(new_lr)
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

    fn plateau(patience: usize, cooldown: usize) -> LearningRateSchedule {
        LearningRateSchedule::ReduceOnPlateau {
            lr: r64(1e-3),
            monitor: Monitor::Loss,
            factor: r64(0.5),
            patience,
            min_lr: r64(2e-4),
            min_delta: r64(0.0),
            cooldown,
        }
    }

    #[test]
    fn step_wise_schedule() -> Result<()> {
        let config = LearningRateSchedule::StepWise {
            steps: vec![(0, r64(0.1)), (2, r64(0.01)), (4, r64(0.001))],
        };
        let mut scheduler = LrScheduler::new(&config, None)?;
        let lrs: Vec<_> = (0..6).map(|_| scheduler.next()).collect();
        assert_eq!(lrs, vec![0.1, 0.1, 0.01, 0.01, 0.001, 0.001]);

        let mut scheduler = LrScheduler::new(&config, 3)?;
        assert_eq!(scheduler.lr(), 0.01);
        assert_eq!(scheduler.next(), 0.01);
        assert_eq!(scheduler.next(), 0.001);

        Ok(())
    }

    #[test]
    fn single_step_schedule() -> Result<()> {
        let config = LearningRateSchedule::StepWise {
            steps: vec![(0, r64(0.1))],
        };
        let mut scheduler = LrScheduler::new(&config, 10)?;
        assert_eq!(scheduler.next(), 0.1);
        Ok(())
    }

    #[test]
    fn reject_invalid_step_wise_schedule() {
        let unordered = LearningRateSchedule::StepWise {
            steps: vec![(0, r64(0.1)), (5, r64(0.01)), (3, r64(0.001))],
        };
        assert!(LrScheduler::new(&unordered, None).is_err());

        let late_start = LearningRateSchedule::StepWise {
            steps: vec![(1, r64(0.1))],
        };
        assert!(LrScheduler::new(&late_start, None).is_err());
    }

    #[test]
    fn reduce_on_plateau() -> Result<()> {
        let mut scheduler = LrScheduler::new(&plateau(2, 0), None)?;
        assert_eq!(scheduler.next(), 1e-3);

        // improving
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.9)), None);

        // two epochs without improvement
        assert_eq!(scheduler.on_epoch_end(&metrics(0.95)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.9)), Some(5e-4));
        assert_eq!(scheduler.lr(), 5e-4);

        // the wait counter restarts after reduction
        assert_eq!(scheduler.on_epoch_end(&metrics(0.91)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.92)), Some(2.5e-4));

        // clamped by min_lr, then stays
        assert_eq!(scheduler.on_epoch_end(&metrics(0.93)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.94)), Some(2e-4));
        assert_eq!(scheduler.on_epoch_end(&metrics(0.95)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.96)), None);
        assert_eq!(scheduler.lr(), 2e-4);

        Ok(())
    }

    #[test]
    fn reduce_on_plateau_with_cooldown() -> Result<()> {
        let mut scheduler = LrScheduler::new(&plateau(1, 2), None)?;

        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), Some(5e-4));

        // in cooldown
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), None);

        // the last cooldown epoch counts again
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), Some(2.5e-4));

        // an improvement during cooldown updates the best value
        assert_eq!(scheduler.on_epoch_end(&metrics(0.5)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.5)), Some(2e-4));

        Ok(())
    }

    #[test]
    fn plateau_falls_back_to_training_metric() -> Result<()> {
        let config = LearningRateSchedule::ReduceOnPlateau {
            lr: r64(1e-3),
            monitor: Monitor::ValLoss,
            factor: r64(0.5),
            patience: 1,
            min_lr: r64(1e-5),
            min_delta: r64(0.0),
            cooldown: 0,
        };
        let mut scheduler = LrScheduler::new(&config, None)?;
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(1.0)), Some(5e-4));
        Ok(())
    }

    #[test]
    fn restore_plateau_progress() -> Result<()> {
        let mut scheduler = LrScheduler::new(&plateau(2, 0), None)?;
        assert_eq!(scheduler.on_epoch_end(&metrics(0.5)), None);
        assert_eq!(scheduler.on_epoch_end(&metrics(0.6)), None);
        let progress = scheduler.plateau_progress().unwrap();
        assert_eq!(
            progress,
            PlateauProgress {
                lr: 1e-3,
                best: 0.5,
                wait: 1,
                cooldown_counter: 0,
            }
        );

        // the resumed scheduler reduces on the next stale epoch
        let mut resumed = LrScheduler::new(&plateau(2, 0), None)?;
        resumed.restore_plateau(progress);
        assert_eq!(resumed.on_epoch_end(&metrics(0.7)), Some(5e-4));

        // the lr is clamped by min_lr and NaN keeps the initial best
        let mut resumed = LrScheduler::new(&plateau(2, 0), None)?;
        resumed.restore_plateau(PlateauProgress {
            lr: 1e-6,
            best: f64::NAN,
            wait: 0,
            cooldown_counter: 0,
        });
        assert_eq!(resumed.lr(), 2e-4);
        assert_eq!(resumed.on_epoch_end(&metrics(100.0)), None);
        assert_eq!(resumed.plateau_progress().unwrap().best, 100.0);

        let constant = LrScheduler::new(&LearningRateSchedule::Constant { lr: r64(0.1) }, None)?;
        assert!(constant.plateau_progress().is_none());

        Ok(())
    }
}
