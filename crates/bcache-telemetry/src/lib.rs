//! Ambient observability stack: logging setup, per-window counters, and the
//! heat-table producer used by the CLI simulation driver.

pub mod counters;
pub mod heat_sketch;
pub mod logging;

pub use counters::WindowCounters;
pub use heat_sketch::HeatSketch;
pub use logging::init_tracing;
