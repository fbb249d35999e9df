//! Random image augmentation.

use crate::common::*;

#[derive(Debug, Clone, PartialEq)]
pub struct RandomAugmentInit {
    pub horizontal_flip_prob: f64,
    pub vertical_flip_prob: f64,
    /// The probability to swap height and width axes of square images.
    pub transpose_prob: f64,
    /// The maximum brightness shift.
    pub brightness_delta: f64,
    /// The output side length of random square crops.
    pub crop_size: usize,
}

impl RandomAugmentInit {
    pub fn new(crop_size: usize) -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            vertical_flip_prob: 0.5,
            transpose_prob: 0.5,
            brightness_delta: 0.1,
            crop_size,
        }
    }

    pub fn build(self) -> Result<RandomAugment> {
        let Self {
            horizontal_flip_prob,
            vertical_flip_prob,
            transpose_prob,
            brightness_delta,
            crop_size,
        } = self;

        for prob in [horizontal_flip_prob, vertical_flip_prob, transpose_prob] {
            ensure!(
                (0.0..=1.0).contains(&prob),
                "probability must be in range [0, 1], but get {}",
                prob
            );
        }
        ensure!(
            brightness_delta >= 0.0,
            "brightness_delta must be non-negative"
        );
        ensure!(crop_size > 0, "crop_size must be positive");

        Ok(RandomAugment {
            horizontal_flip_prob,
            vertical_flip_prob,
            transpose_prob,
            brightness_delta,
            crop_size: crop_size as i64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RandomAugment {
    horizontal_flip_prob: f64,
    vertical_flip_prob: f64,
    transpose_prob: f64,
    brightness_delta: f64,
    crop_size: i64,
}

impl RandomAugment {
    /// Augment a `[3, H, W]` image in [0, 1] scale.
    ///
    /// The output is a `[3, crop_size, crop_size]` image.
    pub fn forward(&self, image: &Tensor) -> Result<Tensor> {
        let mut rng = StdRng::from_entropy();
        self.forward_with_rng(image, &mut rng)
    }

    pub fn forward_with_rng<R>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        tch::no_grad(|| {
            let (channels, height, width) = image.size3()?;
            ensure!(
                channels == 3,
                "channel size must be 3, but get {}",
                channels
            );
            let crop_size = self.crop_size;
            ensure!(
                height >= crop_size && width >= crop_size,
                "image size {}x{} is smaller than crop size {}",
                height,
                width,
                crop_size
            );

            let image = if rng.gen_bool(self.horizontal_flip_prob) {
                image.flip(&[2])
            } else {
                image.shallow_clone()
            };

            let image = if rng.gen_bool(self.vertical_flip_prob) {
                image.flip(&[1])
            } else {
                image
            };

            let image = if height == width && rng.gen_bool(self.transpose_prob) {
                image.transpose(1, 2)
            } else {
                image
            };

            let image = if self.brightness_delta > 0.0 {
                let delta = rng.gen_range(-self.brightness_delta..=self.brightness_delta);
                (image + delta).clamp(0.0, 1.0)
            } else {
                image
            };

            let (_, height, width) = image.size3()?;
            let top = rng.gen_range(0..=(height - crop_size));
            let left = rng.gen_range(0..=(width - crop_size));
            let image = image
                .narrow(1, top, crop_size)
                .narrow(2, left, crop_size)
                .contiguous();

            Ok(image)
        })
    }
}

/// Crop the central square of a `[3, H, W]` image.
pub fn center_crop(image: &Tensor, size: usize) -> Result<Tensor> {
    let (_channels, height, width) = image.size3()?;
    let size = size as i64;
    ensure!(
        height >= size && width >= size,
        "image size {}x{} is smaller than crop size {}",
        height,
        width,
        size
    );

    let top = (height - size) / 2;
    let left = (width - size) / 2;
    Ok(image.narrow(1, top, size).narrow(2, left, size).contiguous())
}
