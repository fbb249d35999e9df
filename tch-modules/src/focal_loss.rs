use crate::common::*;

/// Categorical focal loss initializer.
#[derive(Debug)]
pub struct CategoricalFocalLossInit {
    /// The focusing parameter. Zero reduces to weighted cross-entropy.
    pub gamma: f64,
    /// The balancing factor applied to every class.
    pub alpha: f64,
    /// Optional per-class weights in shape `[num_classes]`.
    pub class_weight: Option<Tensor>,
    /// The reduction method applied on output loss.
    pub reduction: Reduction,
}

impl CategoricalFocalLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            gamma: 2.0,
            alpha: 0.25,
            class_weight: None,
            reduction,
        }
    }

    /// Build a focal loss calculator.
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<CategoricalFocalLoss> {
        let Self {
            gamma,
            alpha,
            class_weight,
            reduction,
        } = self;

        ensure!(gamma >= 0.0, "gamma must be non-negative");
        ensure!(alpha > 0.0, "alpha must be positive");

        let class_weight = register_class_weight(path.borrow(), class_weight);

        Ok(CategoricalFocalLoss {
            gamma,
            alpha,
            class_weight,
            reduction,
        })
    }
}

/// Categorical focal loss calculator.
///
/// For a sample with target class `t` and softmax probability `p_t`, the loss
/// is `-alpha * (1 - p_t)^gamma * log(p_t)`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CategoricalFocalLoss {
    gamma: f64,
    alpha: f64,
    #[derivative(Debug = "ignore")]
    class_weight: Option<Tensor>,
    reduction: Reduction,
}

impl CategoricalFocalLoss {
    /// Compute focal loss from logits against sparse class indexes.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        let (batch_size, _num_classes) = input.size2().unwrap();
        debug_assert!(
            target.kind() == Kind::Int64 && target.size1().unwrap() == batch_size,
            "expect target a [{}] int64 tensor",
            batch_size
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        let Self {
            gamma,
            alpha,
            ref class_weight,
            reduction,
        } = *self;

        let log_p_t = input
            .log_softmax(-1, Kind::Float)
            .gather(1, &target.view([-1, 1]), false)
            .view([-1]);
        let p_t = log_p_t.exp();
        let modulating_factor = (-&p_t + 1.0).pow(&Tensor::from(gamma));
        let loss: Tensor = -log_p_t * modulating_factor * alpha;
        let loss = match class_weight {
            Some(weight) => loss * weight.index_select(0, target),
            None => loss,
        };

        reduce_loss(loss, reduction)
    }
}
