//! Wire and pipeline types shared across stages.

mod task;

pub use task::{Delivery, FetchOutcome, GlobalConfig, Task};
