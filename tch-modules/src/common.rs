pub use anyhow::{ensure, Result};
pub use derivative::Derivative;
pub use std::borrow::Borrow;
pub use tch::{
    nn::{self, ModuleT as _, OptimizerConfig as _},
    Device, Kind, Reduction, Tensor,
};

/// Reduce a per-sample loss tensor.
///
/// The mean is taken over the batch size, so that per-sample weights scale
/// the loss instead of being normalized away.
pub(crate) fn reduce_loss(loss: Tensor, reduction: Reduction) -> Tensor {
    match reduction {
        Reduction::None => loss,
        Reduction::Sum => loss.sum(Kind::Float),
        Reduction::Mean => loss.mean(Kind::Float),
        Reduction::Other(_) => unimplemented!(),
    }
}

/// Store a copy of class weights as non-trainable variables under `path`.
pub(crate) fn register_class_weight(path: &nn::Path, from: Option<Tensor>) -> Option<Tensor> {
    from.map(|from| {
        tch::no_grad(|| {
            let mut weight = path.zeros_no_train("class_weight", &from.size());
            weight.copy_(&from);
            weight
        })
    })
}
