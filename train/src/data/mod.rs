//! Dataset discovery and record types.

mod dataset;
mod record;

pub use dataset::*;
pub use record::*;
