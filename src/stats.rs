//! Population statistics over the columns of a fit table.
//!
//! Each continuous column is binned into a density histogram whose cumulative
//! sum is matched against a parametric CDF with the bounded least-squares
//! solver. The wave count is discrete and only reported as frequencies.

use chrono::Utc;
use itertools::Itertools;
use nalgebra::DVector;
use ndarray::{s, Array1, ArrayView1, Axis};
use ndarray_stats::QuantileExt;
use serde::Serialize;
use statrs::distribution::{Beta, ContinuousCDF, Uniform, Weibull};
use tracing::{debug, warn};

use crate::error::{MorphError, Result};
use crate::shape::Variant;
use crate::solver::{self, Bounds, LeastSquares, SolverOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::Distribution;

    fn weibull_sample(shape: f64, scale: f64, count: usize, seed: u64) -> Vec<f64> {
        let dist = rand_distr::Weibull::new(scale, shape).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count).map(|_| dist.sample(&mut rng)).collect()
    }

    #[test]
    fn histogram_matches_numpy_binning() {
        let data = [0.0, 0.5, 1.0, 1.5, 2.0, 2.0, 5.0];
        let hist = Histogram::new("x", &data, 4, 0.0).unwrap();
        assert_eq!(hist.edges.to_vec(), vec![0.0, 1.25, 2.5, 3.75, 5.0]);
        // upper edge lands in the last bin
        let counts: Vec<f64> = hist.density.iter().map(|d| d * 7.0 * 1.25).collect();
        for (c, e) in counts.iter().zip([3.0, 3.0, 0.0, 1.0]) {
            assert_relative_eq!(*c, e, epsilon = 1e-12);
        }
        assert_relative_eq!(hist.cumulative()[3], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn values_below_lower_are_excluded() {
        let data = [0.5, 1.0, 1.5, 2.0];
        let hist = Histogram::new("o", &data, 2, 1.0).unwrap();
        assert_relative_eq!(hist.cumulative()[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(hist.density[0] * 0.5, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_histograms_are_rejected() {
        assert!(Histogram::new("x", &[], 10, 0.0).is_err());
        assert!(Histogram::new("x", &[1.0, 1.0], 10, 1.0).is_err());
        assert!(Histogram::new("x", &[1.0, f64::NAN], 10, 0.0).is_err());
        assert!(Histogram::new("x", &[1.0, 2.0], 0, 0.0).is_err());
    }

    #[test]
    fn weibull_fit_recovers_shape_and_scale() {
        let data = weibull_sample(2.0, 3.0, 20_000, 11);
        let fit = fit_weibull("r", &data, 0.0, 50).unwrap();
        match fit.model {
            PopulationModel::Weibull {
                shape,
                scale,
                location,
            } => {
                assert_relative_eq!(shape, 2.0, max_relative = 0.05);
                assert_relative_eq!(scale, 3.0, max_relative = 0.03);
                assert_eq!(location, 0.0);
            }
            other => panic!("unexpected model {:?}", other),
        }
    }

    #[test]
    fn weibull_location_shifts_cdf() {
        let model = PopulationModel::Weibull {
            shape: 1.5,
            scale: 0.4,
            location: 1.0,
        };
        assert_eq!(model.cdf(0.9), 0.0);
        assert_relative_eq!(model.cdf(1.4), 1.0 - (-1.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn beta_fit_recovers_parameters() {
        let dist = rand_distr::Beta::new(2.0, 5.0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let data: Vec<f64> = (0..20_000).map(|_| dist.sample(&mut rng)).collect();
        let fit = fit_beta("h", &data, 20).unwrap();
        match fit.model {
            PopulationModel::Beta { alpha, beta } => {
                assert_relative_eq!(alpha, 2.0, max_relative = 0.1);
                assert_relative_eq!(beta, 5.0, max_relative = 0.1);
            }
            other => panic!("unexpected model {:?}", other),
        }
    }

    #[test]
    fn mixture_fit_improves_on_initial_guess() {
        let mut data = weibull_sample(3.0, 400.0, 1400, 5);
        data.extend(weibull_sample(4.0, 1200.0, 600, 6));
        let hist = Histogram::new("r0", &data, 100, 0.0).unwrap();
        let problem = CdfFit {
            family: Family::WeibullMixture { location: 0.0 },
            points: hist.upper_edges(),
            target: hist.cumulative(),
        };
        let initial = problem.residuals(&DVector::from_column_slice(&MIXTURE_GUESS)).norm_squared();

        let fit = fit_weibull_mixture("r0", &data, 0.0, 100).unwrap();
        assert!(fit.cost <= initial);
        match fit.model {
            PopulationModel::WeibullMixture { weight, .. } => {
                assert!((0.0..=1.0).contains(&weight))
            }
            other => panic!("unexpected model {:?}", other),
        }
    }

    #[test]
    fn mixture_cdf_is_weighted_sum() {
        let mixture = PopulationModel::WeibullMixture {
            shape1: 1.0,
            scale1: 2.0,
            shape2: 3.0,
            scale2: 4.0,
            weight: 0.25,
            location: 0.0,
        };
        let a = PopulationModel::Weibull {
            shape: 1.0,
            scale: 2.0,
            location: 0.0,
        };
        let b = PopulationModel::Weibull {
            shape: 3.0,
            scale: 4.0,
            location: 0.0,
        };
        for x in [0.5, 2.0, 5.0] {
            assert_relative_eq!(
                mixture.cdf(x),
                0.25 * a.cdf(x) + 0.75 * b.cdf(x),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn wave_count_frequencies() {
        let freq = frequencies(&[5.0, 3.0, 5.0, 4.0]);
        assert_eq!(freq.len(), 3);
        assert_eq!(freq[0].value, 3);
        assert_relative_eq!(freq[2].share, 0.5);
        assert_relative_eq!(freq[2].cumulative, 1.0);
    }

    #[test]
    fn summary_skips_unfittable_columns() {
        let r0 = weibull_sample(2.0, 300.0, 200, 1);
        let summary = summarize("b", Variant::Oval, |name| match name {
            "r0" => Some(r0.clone()),
            "o" => Some(vec![1.0; 200]),
            _ => None,
        });
        assert_eq!(summary.count, 200);
        assert!(summary.r0.is_some());
        assert!(summary.o.is_none());
        assert!(summary.h.is_none() && summary.p.is_none() && summary.n.is_none());
    }
}

/// Initial mixture parameters `(k1, s1, k2, s2, w)`, scaled for radii in µm.
const MIXTURE_GUESS: [f64; 5] = [1.0, 500.0, 1.0, 1500.0, 0.8];
/// Smallest admissible shape or scale parameter.
const MIN_PARAMETER: f64 = 1e-6;

pub const RADIUS_BINS: usize = 100;
pub const DEFAULT_BINS: usize = 20;
pub const WAVE_SHIFT_RANGE: (f64, f64) = (0.0, 0.5);

/// Density-normalised histogram over `[lower, max(data)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub edges: Array1<f64>,
    pub density: Array1<f64>,
}

impl Histogram {
    /// Bins `data` into `bins` equal bins. Values below `lower` are ignored
    /// and the maximum falls into the last bin.
    pub fn new(column: &str, data: &[f64], bins: usize, lower: f64) -> Result<Self> {
        let invalid = |reason: &str| MorphError::Statistics {
            column: column.to_string(),
            reason: reason.to_string(),
        };
        if bins == 0 {
            return Err(invalid("at least one bin is required"));
        }
        let upper = *ArrayView1::from(data)
            .max()
            .map_err(|_| invalid("no comparable values"))?;
        if !upper.is_finite() || upper <= lower {
            return Err(invalid("values do not span a range above the lower limit"));
        }

        let width = (upper - lower) / bins as f64;
        let mut counts = Array1::<f64>::zeros(bins);
        for &value in data.iter().filter(|v| (lower..=upper).contains(*v)) {
            let index = (((value - lower) / width) as usize).min(bins - 1);
            counts[index] += 1.0;
        }
        let total = counts.sum();

        Ok(Self {
            edges: Array1::linspace(lower, upper, bins + 1),
            density: counts / (total * width),
        })
    }

    pub fn width(&self) -> f64 {
        self.edges[1] - self.edges[0]
    }

    pub fn upper_edges(&self) -> Array1<f64> {
        self.edges.slice(s![1..]).to_owned()
    }

    /// Empirical CDF at the upper bin edges.
    pub fn cumulative(&self) -> Array1<f64> {
        let mut cumulative = &self.density * self.width();
        cumulative.accumulate_axis_inplace(Axis(0), |&prev, curr| *curr += prev);
        cumulative
    }
}

/// A fitted (or prescribed) population distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum PopulationModel {
    Weibull {
        shape: f64,
        scale: f64,
        location: f64,
    },
    Beta {
        alpha: f64,
        beta: f64,
    },
    WeibullMixture {
        shape1: f64,
        scale1: f64,
        shape2: f64,
        scale2: f64,
        weight: f64,
        location: f64,
    },
    Uniform {
        lower: f64,
        upper: f64,
    },
}

impl PopulationModel {
    /// Cumulative probability at `x`; NaN for invalid parameters.
    pub fn cdf(&self, x: f64) -> f64 {
        match *self {
            PopulationModel::Weibull {
                shape,
                scale,
                location,
            } => weibull_cdf(shape, scale, x - location),
            PopulationModel::Beta { alpha, beta } => Beta::new(alpha, beta)
                .map(|d| d.cdf(x))
                .unwrap_or(f64::NAN),
            PopulationModel::WeibullMixture {
                shape1,
                scale1,
                shape2,
                scale2,
                weight,
                location,
            } => {
                weight * weibull_cdf(shape1, scale1, x - location)
                    + (1.0 - weight) * weibull_cdf(shape2, scale2, x - location)
            }
            PopulationModel::Uniform { lower, upper } => Uniform::new(lower, upper)
                .map(|d| d.cdf(x))
                .unwrap_or(f64::NAN),
        }
    }
}

fn weibull_cdf(shape: f64, scale: f64, x: f64) -> f64 {
    Weibull::new(shape, scale)
        .map(|d| d.cdf(x))
        .unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Copy)]
enum Family {
    Weibull { location: f64 },
    Beta,
    WeibullMixture { location: f64 },
}

impl Family {
    fn model(&self, x: &DVector<f64>) -> PopulationModel {
        match *self {
            Family::Weibull { location } => PopulationModel::Weibull {
                shape: x[0],
                scale: x[1],
                location,
            },
            Family::Beta => PopulationModel::Beta {
                alpha: x[0],
                beta: x[1],
            },
            Family::WeibullMixture { location } => PopulationModel::WeibullMixture {
                shape1: x[0],
                scale1: x[1],
                shape2: x[2],
                scale2: x[3],
                weight: x[4],
                location,
            },
        }
    }
}

/// Misfit between a model CDF and an empirical cumulative histogram.
struct CdfFit {
    family: Family,
    points: Array1<f64>,
    target: Array1<f64>,
}

impl LeastSquares for CdfFit {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let model = self.family.model(x);
        DVector::from_iterator(
            self.points.len(),
            self.points
                .iter()
                .zip(self.target.iter())
                .map(|(p, t)| model.cdf(*p) - t),
        )
    }
}

/// Result of one CDF fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionFit {
    pub model: PopulationModel,
    pub bins: usize,
    pub cost: f64,
    pub converged: bool,
}

fn fit_cdf(hist: &Histogram, family: Family, x0: &[f64], bounds: Bounds) -> DistributionFit {
    let problem = CdfFit {
        family,
        points: hist.upper_edges(),
        target: hist.cumulative(),
    };
    let solution = solver::solve(
        &problem,
        &DVector::from_column_slice(x0),
        &bounds,
        &SolverOptions::default(),
    );
    debug!(
        "{:?} fit: cost {:.3e} after {} evaluations ({:?})",
        family, solution.cost, solution.evaluations, solution.status
    );

    DistributionFit {
        model: family.model(&solution.x),
        bins: hist.density.len(),
        cost: solution.cost,
        converged: solution.status.is_converged(),
    }
}

/// Weibull with fixed location `lower`, fitted from `(k, s) = (1, 1)`.
pub fn fit_weibull(column: &str, data: &[f64], lower: f64, bins: usize) -> Result<DistributionFit> {
    let hist = Histogram::new(column, data, bins, lower)?;
    Ok(fit_cdf(
        &hist,
        Family::Weibull { location: lower },
        &[1.0, 1.0],
        Bounds::new(vec![MIN_PARAMETER; 2], vec![f64::INFINITY; 2]),
    ))
}

/// Beta on `[0, 1]`, binned over `[0, max]` and fitted from `(1, 1)`.
pub fn fit_beta(column: &str, data: &[f64], bins: usize) -> Result<DistributionFit> {
    let hist = Histogram::new(column, data, bins, 0.0)?;
    Ok(fit_cdf(
        &hist,
        Family::Beta,
        &[1.0, 1.0],
        Bounds::new(vec![MIN_PARAMETER; 2], vec![f64::INFINITY; 2]),
    ))
}

/// Two-component Weibull mixture sharing the location `lower`.
pub fn fit_weibull_mixture(
    column: &str,
    data: &[f64],
    lower: f64,
    bins: usize,
) -> Result<DistributionFit> {
    let hist = Histogram::new(column, data, bins, lower)?;
    let mut lower_bounds = vec![MIN_PARAMETER; 4];
    lower_bounds.push(0.0);
    let mut upper_bounds = vec![f64::INFINITY; 4];
    upper_bounds.push(1.0);
    Ok(fit_cdf(
        &hist,
        Family::WeibullMixture { location: lower },
        &MIXTURE_GUESS,
        Bounds::new(lower_bounds, upper_bounds),
    ))
}

/// Share of one wave count in a population.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frequency {
    pub value: u32,
    pub share: f64,
    pub cumulative: f64,
}

/// Relative and cumulative frequencies of integer values, ascending.
pub fn frequencies(data: &[f64]) -> Vec<Frequency> {
    let total = data.len() as f64;
    let mut cumulative = 0.0;
    data.iter()
        .map(|v| v.round() as u32)
        .counts()
        .into_iter()
        .sorted()
        .map(|(value, count)| {
            let share = count as f64 / total;
            cumulative += share;
            Frequency {
                value,
                share,
                cumulative,
            }
        })
        .collect()
}

/// Population distributions of one fit table.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub batch: String,
    pub variant: Variant,
    pub count: usize,
    pub generated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r0: Option<DistributionFit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub o: Option<DistributionFit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<DistributionFit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<PopulationModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<Vec<Frequency>>,
}

/// Fits the population models of every column the variant writes.
///
/// `column` yields the values of a named column. Columns that cannot be
/// fitted (too few distinct values, for instance) are logged and left out.
pub fn summarize<F>(batch: &str, variant: Variant, column: F) -> PopulationSummary
where
    F: Fn(&str) -> Option<Vec<f64>>,
{
    let columns = variant.columns();
    let values = |name: &str| columns.iter().any(|c| *c == name).then(|| column(name)).flatten();
    let keep = |name: &str, fit: Result<DistributionFit>| match fit {
        Ok(fit) => Some(fit),
        Err(e) => {
            warn!("{} / {}: skipping `{}`: {}", batch, variant, name, e);
            None
        }
    };

    let count = values("r0").map_or(0, |v| v.len());
    let r0 = values("r0")
        .and_then(|v| keep("r0", fit_weibull_mixture("r0", &v, 0.0, RADIUS_BINS)));
    let o = values("o").and_then(|v| keep("o", fit_weibull("o", &v, 1.0, DEFAULT_BINS)));
    let h = values("h").and_then(|v| keep("h", fit_beta("h", &v, DEFAULT_BINS)));
    let p = values("p").map(|_| PopulationModel::Uniform {
        lower: WAVE_SHIFT_RANGE.0,
        upper: WAVE_SHIFT_RANGE.1,
    });
    let n = values("n").map(|v| frequencies(&v));

    PopulationSummary {
        batch: batch.to_string(),
        variant,
        count,
        generated_at: Utc::now().to_rfc3339(),
        r0,
        o,
        h,
        p,
        n,
    }
}
