//! Multi-start shape fitting.
//!
//! The residual landscape is multi-modal in the rotation parameter: the oval
//! profile repeats every half turn and the ripple every `1/n` turn. A single
//! local solve therefore regularly lands in a poor local minimum. The fitter
//! partitions `[0, 2π)` into equal rotation sectors and runs one bounded
//! solve per sector, with the rotation confined to that sector and started at
//! its midpoint. The shape fit additionally repeats this for every candidate
//! harmonic order, so the order is chosen as a discrete outer decision.
//!
//! # Fit Procedures
//!
//! - **Circular**: one solve for `r0 ∈ [0, r_max]` from `r_max / 2`.
//! - **Oval**: one solve per sector for `(r0, o, rotation)`.
//! - **Shape**: one solve per (order, sector) for `(r0, o, h, p, rotation)`.
//!
//! All candidates are collected in enumeration order (ascending order, then
//! ascending sector) before [`select_best`] picks the strict minimum cost,
//! so the earliest candidate wins ties whether or not the restarts ran in
//! parallel.

use std::f64::consts::PI;

use itertools::iproduct;
use nalgebra::DVector;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::config::{OVALITY_GUESS, WAVE_HEIGHT_GUESS};
use crate::error::{MorphError, Result};
use crate::outline::CenteredOutline;
use crate::residual::ShapeResidual;
use crate::settings::{FitSettings, SolverSettings};
use crate::shape::{ShapeParams, Variant};
use crate::solver::{self, Bounds, SolverOptions, SolverStatus};


/// Equal partition of `[0, 2π)` into `count` rotation sectors.
pub fn rotation_sectors(count: usize) -> Vec<(f64, f64)> {
    let width = 2.0 * PI / count as f64;
    (0..count)
        .map(|i| {
            let lo = i as f64 * width;
            let hi = if i + 1 == count {
                2.0 * PI
            } else {
                (i + 1) as f64 * width
            };
            (lo, hi)
        })
        .collect()
}

/// One local solve of the multi-start search.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub order: u32,
    pub sector: usize,
    pub params: ShapeParams,
    pub cost: f64,
    pub evaluations: usize,
    pub status: SolverStatus,
}

/// Picks the candidate with the strictly lowest cost; on ties the earliest
/// candidate in the given order wins.
pub fn select_best(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(best) if best.cost <= candidate.cost => Some(best),
        _ => Some(candidate),
    })
}

/// Best fit of one outline under one variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeFit {
    pub variant: Variant,
    pub params: ShapeParams,
    /// Sum of squared per-point distances of the selected candidate.
    pub cost: f64,
    /// Whether the selected candidate's solve converged.
    pub converged: bool,
    /// Number of local solves performed.
    pub starts: usize,
    /// Residual evaluations summed over all starts.
    pub evaluations: usize,
}

/// A start point of the search: initial guess and box for one local solve.
struct Start {
    order: u32,
    sector: usize,
    x0: Vec<f64>,
    bounds: Bounds,
}

/// Runs the multi-start fits with fixed search and solver settings.
pub struct MultiStartFitter<'a> {
    settings: &'a FitSettings,
    solver: &'a SolverSettings,
}

impl<'a> MultiStartFitter<'a> {
    pub fn new(settings: &'a FitSettings, solver: &'a SolverSettings) -> Self {
        Self { settings, solver }
    }

    pub fn fit(&self, outline: &CenteredOutline, variant: Variant) -> Result<ShapeFit> {
        let candidates = self.candidates(outline, variant);
        let starts = candidates.len();
        let evaluations = candidates.iter().map(|c| c.evaluations).sum();

        let best = select_best(candidates).ok_or_else(|| {
            MorphError::Config(format!("no {} fit candidates, check sectors and orders", variant))
        })?;
        debug!(
            "best {} fit: order {}, sector {}, cost {:.6e}, status {:?}",
            variant, best.order, best.sector, best.cost, best.status
        );

        Ok(ShapeFit {
            variant,
            params: best.params,
            cost: best.cost,
            converged: best.status.is_converged(),
            starts,
            evaluations,
        })
    }

    pub fn fit_circular(&self, outline: &CenteredOutline) -> Result<ShapeFit> {
        self.fit(outline, Variant::Circular)
    }

    pub fn fit_oval(&self, outline: &CenteredOutline) -> Result<ShapeFit> {
        self.fit(outline, Variant::Oval)
    }

    pub fn fit_shape(&self, outline: &CenteredOutline) -> Result<ShapeFit> {
        self.fit(outline, Variant::Shape)
    }

    /// Runs every start of `variant` and returns the candidates in
    /// enumeration order.
    pub fn candidates(&self, outline: &CenteredOutline, variant: Variant) -> Vec<Candidate> {
        let starts = self.starts(outline, variant);
        let options = self.solver.options();

        if self.settings.parallel_starts {
            starts
                .par_iter()
                .map(|start| run_start(outline, variant, start, &options))
                .collect()
        } else {
            starts
                .iter()
                .map(|start| run_start(outline, variant, start, &options))
                .collect()
        }
    }

    fn starts(&self, outline: &CenteredOutline, variant: Variant) -> Vec<Start> {
        let r_max = outline.r_max();
        let fit = self.settings;

        match variant {
            Variant::Circular => vec![Start {
                order: 0,
                sector: 0,
                x0: vec![r_max / 2.0],
                bounds: Bounds::new(vec![0.0], vec![r_max]),
            }],
            Variant::Oval => rotation_sectors(fit.rotation_sectors)
                .into_iter()
                .enumerate()
                .map(|(sector, (lo, hi))| Start {
                    order: 0,
                    sector,
                    x0: vec![r_max / 2.0, OVALITY_GUESS, (lo + hi) / 2.0],
                    bounds: Bounds::new(vec![0.0, 1.0, lo], vec![r_max, fit.max_ovality, hi]),
                })
                .collect(),
            Variant::Shape => {
                let sectors = rotation_sectors(fit.rotation_sectors);
                iproduct!(fit.orders(), sectors.into_iter().enumerate())
                    .map(|(order, (sector, (lo, hi)))| Start {
                        order,
                        sector,
                        x0: vec![r_max / 2.0, OVALITY_GUESS, WAVE_HEIGHT_GUESS, 0.0, (lo + hi) / 2.0],
                        bounds: Bounds::new(
                            vec![0.0, 1.0, 0.0, 0.0, lo],
                            vec![r_max, fit.max_ovality, fit.max_wave_height, fit.max_wave_shift, hi],
                        ),
                    })
                    .collect()
            }
        }
    }
}

fn run_start(
    outline: &CenteredOutline,
    variant: Variant,
    start: &Start,
    options: &SolverOptions,
) -> Candidate {
    let residual = ShapeResidual::new(outline, variant, start.order);
    let solution = solver::solve(
        &residual,
        &DVector::from_vec(start.x0.clone()),
        &start.bounds,
        options,
    );
    if !solution.status.is_converged() {
        debug!(
            "{} start (order {}, sector {}) stopped early: {:?}, cost {:.6e}",
            variant, start.order, start.sector, solution.status, solution.cost
        );
    }

    Candidate {
        order: start.order,
        sector: start.sector,
        params: residual.params(&solution.x),
        cost: solution.cost,
        evaluations: solution.evaluations,
        status: solution.status,
    }
}
