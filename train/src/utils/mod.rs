//! Misc utilities.

mod checkpoint;
mod lr_scheduler;
mod metrics;
mod rate_counter;

pub use checkpoint::*;
pub use lr_scheduler::*;
pub use metrics::*;
pub use rate_counter::*;
