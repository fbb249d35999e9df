use crate::{common::*, config::Monitor};

/// Running mean of per-batch values weighted by batch sizes.
#[derive(Debug, Clone, Default)]
pub struct MeanMeter {
    sum: f64,
    count: usize,
}

impl MeanMeter {
    pub fn add(&mut self, value: f64, count: usize) {
        self.sum += value * count as f64;
        self.count += count;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Mean metrics over an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

impl EpochMetrics {
    pub fn get(&self, monitor: Monitor) -> Option<f64> {
        match monitor {
            Monitor::Loss => Some(self.loss),
            Monitor::Accuracy => Some(self.accuracy),
            Monitor::ValLoss => self.val_loss,
            Monitor::ValAccuracy => self.val_accuracy,
        }
    }
}

/// Fraction of predictions equal to targets.
///
/// `logits` is in `[batch, num_classes]` shape and `target` in `[batch]`.
pub fn accuracy(logits: &Tensor, target: &Tensor) -> f64 {
    if target.numel() == 0 {
        return 0.0;
    }
    tch::no_grad(|| {
        f64::from(
            logits
                .argmax(-1, false)
                .eq_tensor(target)
                .to_kind(Kind::Float)
                .mean(Kind::Float),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_meter_weights_by_count() {
        let mut meter = MeanMeter::default();
        assert!(meter.mean().is_none());

        meter.add(1.0, 3);
        meter.add(0.0, 1);
        assert_eq!(meter.count, 4);
        assert!((meter.mean().unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn accuracy_of_logits() {
        let logits = Tensor::of_slice(&[2.0f32, 1.0, 0.0, 1.0, 3.0, -1.0, 0.5, 0.4]).view([4, 2]);
        let target = Tensor::of_slice(&[0i64, 1, 1, 1]);
        assert!((accuracy(&logits, &target) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn metric_lookup() {
        let metrics = EpochMetrics {
            loss: 0.3,
            accuracy: 0.9,
            val_loss: None,
            val_accuracy: Some(0.8),
        };
        assert_eq!(metrics.get(Monitor::Loss), Some(0.3));
        assert_eq!(metrics.get(Monitor::ValLoss), None);
        assert_eq!(metrics.get(Monitor::ValAccuracy), Some(0.8));
    }
}
