//! Per-channel input normalization.

use crate::common::*;

#[derive(Debug)]
pub struct Normalize {
    mean: Tensor,
    std: Tensor,
}

impl Normalize {
    pub fn new(mean: [f64; 3], std: [f64; 3]) -> Result<Self> {
        ensure!(
            std.iter().all(|&val| val > 0.0),
            "std values must be positive"
        );
        let to_tensor = |values: [f64; 3]| {
            let values = values.map(|val| val as f32);
            Tensor::of_slice(&values).view([3, 1, 1])
        };

        Ok(Self {
            mean: to_tensor(mean),
            std: to_tensor(std),
        })
    }

    /// Normalize `[3, H, W]` or `[B, 3, H, W]` images in [0, 1] scale.
    pub fn forward(&self, image: &Tensor) -> Tensor {
        let device = image.device();
        (image - self.mean.to_device(device)) / self.std.to_device(device)
    }

    /// Recover [0, 1] scale images from normalized images.
    pub fn inverse(&self, image: &Tensor) -> Tensor {
        let device = image.device();
        (image * self.std.to_device(device) + self.mean.to_device(device)).clamp(0.0, 1.0)
    }
}

impl Clone for Normalize {
    fn clone(&self) -> Self {
        Self {
            mean: self.mean.shallow_clone(),
            std: self.std.shallow_clone(),
        }
    }
}
