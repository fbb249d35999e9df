//! The training worker.

mod loss;
mod worker;

pub use loss::*;
pub use worker::*;
