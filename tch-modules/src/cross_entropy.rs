use crate::common::*;

/// Cross-entropy loss initializer.
#[derive(Debug)]
pub struct CrossEntropyLossInit {
    /// Optional per-class weights in shape `[num_classes]`.
    pub class_weight: Option<Tensor>,
    pub reduction: Reduction,
}

impl CrossEntropyLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            class_weight: None,
            reduction,
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> CrossEntropyLoss {
        let Self {
            class_weight,
            reduction,
        } = self;
        let class_weight = register_class_weight(path.borrow(), class_weight);

        CrossEntropyLoss {
            class_weight,
            reduction,
        }
    }
}

/// Cross-entropy loss on logits against sparse class indexes.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    class_weight: Option<Tensor>,
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        // assume [batch_size, n_classes] input shape
        let (batch_size, num_classes) = input.size2().unwrap();
        debug_assert!(
            target.kind() == Kind::Int64 && target.size1().unwrap() == batch_size,
            "expect target a [{}] int64 tensor",
            batch_size
        );
        debug_assert!(
            batch_size == 0
                || (bool::from(target.ge(0).all()) && bool::from(target.lt(num_classes).all())),
            "target values must be in range of [0, {}]",
            num_classes
        );

        // return zero tensor if (1) input is empty and (2) using mean reduction
        if input.numel() == 0 && self.reduction == Reduction::Mean {
            return Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false);
        }

        let log_prob = input
            .log_softmax(-1, Kind::Float)
            .gather(1, &target.view([-1, 1]), false)
            .view([-1]);
        let loss = -log_prob;
        let loss = match &self.class_weight {
            Some(weight) => loss * weight.index_select(0, target),
            None => loss,
        };

        reduce_loss(loss, self.reduction)
    }
}
