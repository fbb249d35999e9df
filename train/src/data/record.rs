use crate::common::*;

/// The record with image path and class index, but without image pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRecord {
    pub path: PathBuf,
    pub label: usize,
}

/// The stage a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Training,
    Validation,
}

/// The batch that is accepted by training worker.
#[derive(Debug, TensorLike)]
pub struct TrainingRecord {
    pub epoch: usize,
    /// The global training step. Validation batches carry the step of the
    /// last training batch in the same epoch.
    pub step: usize,
    #[tensor_like(clone)]
    pub phase: Phase,
    /// Set on the last batch of an epoch.
    #[tensor_like(clone)]
    pub end_of_epoch: bool,
    /// Normalized images in `[batch, 3, height, width]` shape.
    pub image: Tensor,
    /// Class indexes in `[batch]` shape.
    pub label: Tensor,
}
