//! Data preprocessing building blocks.

pub mod normalize;
pub mod random_augment;

pub use normalize::*;
pub use random_augment::*;
