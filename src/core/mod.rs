//! Core radar volume processing modules

pub mod bins;
pub mod classify;
pub mod dealias;
pub mod diagnostics;
pub mod homogenize;
pub mod quantizer;
pub mod resolver;
pub mod superob;
pub mod volume;

// Re-export main types
pub use bins::{BinLayout, BinPlanner};
pub use classify::QuantitySorter;
pub use dealias::{Dealiaser, VelocityUnwrapper, WindCoefficients, WindModelEstimator};
pub use diagnostics::Diagnostics;
pub use homogenize::{HomogenizedWriter, Homogenizer};
pub use quantizer::{quantize, QuantizedField};
pub use resolver::AttributeResolver;
pub use superob::{Aggregator, Superober};
pub use volume::{beam_height, VolumeLoader};
