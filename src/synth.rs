//! Synthetic outlines with known shape parameters.

use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::config::HEADER_LINES;
use crate::error::{MorphError, Result};
use crate::shape::ShapeParams;


/// Samples `count` outline points at evenly spaced angles on `[0, 2π)`.
///
/// `noise` is the standard deviation of a Gaussian perturbation added to the
/// model radius; zero gives exact model points.
pub fn sample(params: &ShapeParams, count: usize, noise: f64, seed: u64) -> Result<Vec<[f64; 2]>> {
    let normal = Normal::new(0.0, noise)
        .map_err(|e| MorphError::Config(format!("invalid radial noise {}: {}", noise, e)))?;
    let mut rng = StdRng::seed_from_u64(seed);

    Ok((0..count)
        .map(|i| {
            let theta = 2.0 * PI * i as f64 / count as f64;
            let mut r = params.radius_at(theta);
            if noise > 0.0 {
                r += normal.sample(&mut rng);
            }
            [r * theta.cos(), r * theta.sin()]
        })
        .collect())
}

/// Writes points in the measured outline format: a header block, then one
/// whitespace separated `x y` pair per line.
pub fn write_outline(path: &Path, points: &[[f64; 2]]) -> Result<()> {
    let io = |e| MorphError::io(path, e);
    let file = File::create(path).map_err(io)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# synthetic outline").map_err(io)?;
    for _ in 1..HEADER_LINES {
        writeln!(writer, "#").map_err(io)?;
    }
    for [x, y] in points {
        writeln!(writer, "{} {}", x, y).map_err(io)?;
    }
    writer.flush().map_err(io)
}
