//! HOOF: homogenization, dealiasing and superobing of weather radar volumes
//!
//! Polar volumes in ODIM_H5 layout are rewritten into one canonical schema,
//! radial velocities are unfolded against a fitted wind model, and both
//! reflectivity and velocity are averaged onto coarser quality-gated bins.

pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    GroupLocation, HoofError, HoofResult, MeasurementKind, MeasurementVolume, QualityTask, Quantity, QuantityKind,
    Snapshot,
};

pub use io::{H5Container, MemoryContainer, RadarContainer, Settings};
pub use pipeline::{process_volume, run_batch, BatchSummary, FileStatus};
