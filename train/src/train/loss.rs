use crate::{
    common::*,
    config::{ClassWeight, LossConfig},
};
use tch_modules::{
    CategoricalFocalLoss, CategoricalFocalLossInit, CrossEntropyLoss, CrossEntropyLossInit,
};

/// The classification loss selected by configuration.
#[derive(Debug)]
pub enum ClassificationLoss {
    Focal(CategoricalFocalLoss),
    CrossEntropy(CrossEntropyLoss),
}

impl ClassificationLoss {
    /// Build the loss under `path`.
    ///
    /// `balanced_weights` are used when the class weighting is balanced.
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        loss_config: &LossConfig,
        class_weight: ClassWeight,
        balanced_weights: &[f64],
    ) -> Result<Self> {
        let path = path.borrow();

        let class_weight = match class_weight {
            ClassWeight::Uniform => None,
            ClassWeight::Balanced => {
                let weights = balanced_weights.iter().map(|&w| w as f32).collect_vec();
                info!("use class weights {:?}", weights);
                Some(Tensor::of_slice(&weights))
            }
        };

        let loss = match *loss_config {
            LossConfig::FocalLoss { gamma, alpha } => {
                let loss = CategoricalFocalLossInit {
                    gamma: gamma.raw(),
                    alpha: alpha.raw(),
                    class_weight,
                    reduction: Reduction::Mean,
                }
                .build(path)?;
                Self::Focal(loss)
            }
            LossConfig::CrossEntropy => {
                let loss = CrossEntropyLossInit {
                    class_weight,
                    reduction: Reduction::Mean,
                }
                .build(path);
                Self::CrossEntropy(loss)
            }
        };

        Ok(loss)
    }

    /// Compute the mean loss of `[batch, num_classes]` logits against `[batch]` labels.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        match self {
            Self::Focal(loss) => loss.forward(input, target),
            Self::CrossEntropy(loss) => loss.forward(input, target),
        }
    }
}
