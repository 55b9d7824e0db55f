//! Parametric particle shape model.
//!
//! The particle cross-section is described in polar form by an ellipse-like
//! base profile controlled by the ovality `o`, modulated by a cosine ripple of
//! integer order `n`, relative height `h` and phase shift `p`:
//!
//! ```text
//! radius(θ; o, n, h, p) = sqrt(o / (o² sin²θ + cos²θ)) · (h·cos(n·θ + 2π·p) + 1)
//! ```
//!
//! The nominal radius `r0` scales the profile and the rotation is applied by
//! evaluating the profile at `θ - rotation`.
//!
//! # Model Variants
//!
//! - [`Variant::Circular`]: only `r0` is free (`o = 1`, `h = 0`).
//! - [`Variant::Oval`]: `r0`, `o` and the rotation are free (`h = 0`).
//! - [`Variant::Shape`]: `r0`, `o`, `h`, `p` and the rotation are free, the
//!   harmonic order `n` is chosen from a discrete candidate set.

use std::f64::consts::PI;
use std::fmt;

use clap::ValueEnum;
use ndarray::Array1;
use serde::{Deserialize, Serialize};


/// Shape model variant, ordered by increasing complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Circular,
    Oval,
    Shape,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Circular, Variant::Oval, Variant::Shape];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Circular => "circular",
            Variant::Oval => "oval",
            Variant::Shape => "shape",
        }
    }

    /// Columns written to the result table for this variant.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Variant::Circular => &["r0"],
            Variant::Oval => &["r0", "o"],
            Variant::Shape => &["r0", "o", "h", "p", "n"],
        }
    }

    /// Indices into [`ShapeParams::gradient_at`] of the free parameters,
    /// in the order the optimizer sees them.
    pub fn free_components(&self) -> &'static [usize] {
        match self {
            Variant::Circular => &[0],
            Variant::Oval => &[0, 1, 4],
            Variant::Shape => &[0, 1, 2, 3, 4],
        }
    }

    pub fn num_free(&self) -> usize {
        self.free_components().len()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Dimensionless profile radius at polar angle `theta`.
#[inline]
pub fn radius(theta: f64, o: f64, n: u32, h: f64, p: f64) -> f64 {
    let (s, c) = theta.sin_cos();
    (o / (o * o * s * s + c * c)).sqrt() * (h * (n as f64 * theta + 2.0 * PI * p).cos() + 1.0)
}

/// Vectorised [`radius`] over an array of angles.
pub fn radii(thetas: &Array1<f64>, o: f64, n: u32, h: f64, p: f64) -> Array1<f64> {
    thetas.mapv(|theta| radius(theta, o, n, h, p))
}

/// Fitted or prescribed shape parameters.
///
/// Components are addressed by index in the order `(r0, o, h, p, rotation)`;
/// the harmonic order `n` is not a continuous component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeParams {
    pub r0: f64,       // nominal radius
    pub o: f64,        // ovality
    pub h: f64,        // relative wave height
    pub p: f64,        // wave shift, fraction of a cycle
    pub rotation: f64, // orientation of the long axis
    pub n: u32,        // wave count
}

impl ShapeParams {
    pub fn circle(r0: f64) -> Self {
        Self::oval(r0, 1.0, 0.0)
    }

    pub fn oval(r0: f64, o: f64, rotation: f64) -> Self {
        Self::shape(r0, o, 0.0, 0.0, rotation, 0)
    }

    pub fn shape(r0: f64, o: f64, h: f64, p: f64, rotation: f64, n: u32) -> Self {
        Self {
            r0,
            o,
            h,
            p,
            rotation,
            n,
        }
    }

    pub fn component(&self, index: usize) -> f64 {
        match index {
            0 => self.r0,
            1 => self.o,
            2 => self.h,
            3 => self.p,
            4 => self.rotation,
            _ => panic!("shape parameter index {} out of range", index),
        }
    }

    pub fn set_component(&mut self, index: usize, value: f64) {
        match index {
            0 => self.r0 = value,
            1 => self.o = value,
            2 => self.h = value,
            3 => self.p = value,
            4 => self.rotation = value,
            _ => panic!("shape parameter index {} out of range", index),
        }
    }

    /// Model radius at polar angle `theta`.
    #[inline]
    pub fn radius_at(&self, theta: f64) -> f64 {
        self.r0 * radius(theta - self.rotation, self.o, self.n, self.h, self.p)
    }

    pub fn radii(&self, thetas: &Array1<f64>) -> Array1<f64> {
        thetas.mapv(|theta| self.radius_at(theta))
    }

    /// Cartesian model point at polar angle `theta`.
    pub fn point_at(&self, theta: f64) -> [f64; 2] {
        let r = self.radius_at(theta);
        [r * theta.cos(), r * theta.sin()]
    }

    /// Partial derivatives of [`ShapeParams::radius_at`] with respect to
    /// `(r0, o, h, p, rotation)`.
    pub fn gradient_at(&self, theta: f64) -> [f64; 5] {
        let phi = theta - self.rotation;
        let (s, c) = phi.sin_cos();
        let n = self.n as f64;
        let o = self.o;

        let denom = o * o * s * s + c * c;
        let base = (o / denom).sqrt();
        let arg = n * phi + 2.0 * PI * self.p;
        let (wave_sin, wave_cos) = arg.sin_cos();
        let wave = self.h * wave_cos + 1.0;

        let dbase_do = (c * c - o * o * s * s) / (2.0 * base * denom * denom);
        let dbase_dphi = -o * s * c * (o * o - 1.0) / (base * denom * denom);
        let dwave_dphi = -self.h * n * wave_sin;

        [
            base * wave,
            self.r0 * wave * dbase_do,
            self.r0 * base * wave_cos,
            -2.0 * PI * self.r0 * base * self.h * wave_sin,
            -self.r0 * (dbase_dphi * wave + base * dwave_dphi),
        ]
    }

    /// Closed model outline sampled at `count` evenly spaced angles on `[0, 2π]`.
    pub fn outline(&self, count: usize) -> Vec<[f64; 2]> {
        Array1::linspace(0.0, 2.0 * PI, count)
            .iter()
            .map(|&theta| self.point_at(theta))
            .collect()
    }
}

impl fmt::Display for ShapeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r0 = {:.6}, o = {:.6}, h = {:.6}, p = {:.6}, n = {}, rotation = {:.6}",
            self.r0, self.o, self.h, self.p, self.n, self.rotation
        )
    }
}
