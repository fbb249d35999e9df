use crate::common::*;

/// Classification head initializer.
#[derive(Debug, Clone)]
pub struct ClassifierHeadInit {
    pub in_c: usize,
    pub num_classes: usize,
    /// The dropout probability applied on backbone features.
    pub dropout: f64,
}

impl ClassifierHeadInit {
    pub fn new(in_c: usize, num_classes: usize) -> Self {
        Self {
            in_c,
            num_classes,
            dropout: 0.5,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<ClassifierHead>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_c,
            num_classes,
            dropout,
        } = self;

        ensure!(in_c > 0, "in_c must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            (0.0..1.0).contains(&dropout),
            "dropout must be in range [0, 1)"
        );

        let linear = nn::linear(
            path / "output_layer",
            in_c as i64,
            num_classes as i64,
            Default::default(),
        );

        Ok(ClassifierHead { dropout, linear })
    }
}

/// Dropout, global average pooling and a linear output layer.
///
/// It accepts either `[B, C, H, W]` feature maps or already pooled `[B, C]`
/// features, and outputs `[B, num_classes]` logits.
#[derive(Debug)]
pub struct ClassifierHead {
    dropout: f64,
    linear: nn::Linear,
}

impl nn::ModuleT for ClassifierHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.dropout(self.dropout, train);
        let xs = match xs.dim() {
            4 => {
                let batch_size = xs.size()[0];
                xs.adaptive_avg_pool2d(&[1, 1]).view([batch_size, -1])
            }
            2 => xs,
            dim => panic!("expect 2 or 4 dimensions, but get {}", dim),
        };
        xs.apply(&self.linear)
    }
}

impl ClassifierHead {
    pub fn linear(&self) -> &nn::Linear {
        &self.linear
    }
}
