//! Shape model fits of measured particle outlines.
//!
//! Outlines are centered on their area centroid and fitted with a radius
//! model `r0 · sqrt(o / (o² sin²θ + cos²θ)) · (h cos(nθ + 2πp) + 1)` of
//! increasing complexity: a circle, an oval and a full shape with harmonic
//! waviness. Fits of whole batches are written as CSV tables.

pub mod batch;
pub mod config;
pub mod error;
pub mod fit;
pub mod outline;
pub mod output;
pub mod residual;
pub mod result;
pub mod settings;
pub mod shape;
pub mod solver;
pub mod stats;
pub mod synth;
