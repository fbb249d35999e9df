//! Reusable building blocks for image classification on top of tch.

mod common;
pub mod classifier_head;
pub mod cross_entropy;
pub mod focal_loss;

pub use classifier_head::*;
pub use cross_entropy::*;
pub use focal_loss::*;
