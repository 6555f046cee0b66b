//! Logging and statistics.

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::{Counter, DirectionStats, IpStats, NicStats, StackStats};
