// Diagnostics: frame-rate telemetry and pipeline statistics.

pub mod fps;
pub mod stats;
