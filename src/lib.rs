//! Vesper
//!
//! Umbrella crate re-exporting the workspace members so that the end-to-end
//! tests under `tests/` can drive the whole stack through one dependency.

pub use vesper_common as common;
pub use vesper_metrics as metrics;
pub use vesper_server as server;
