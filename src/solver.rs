//! Box-constrained non-linear least squares.
//!
//! Minimizes `cost(x) = Σ f_i(x)²` subject to `lower ≤ x ≤ upper` with an
//! interior Levenberg–Marquardt iteration:
//!
//! - Marquardt scaling of the damping term by the diagonal of `JᵀJ`, so the
//!   step is invariant to the units of the parameters.
//! - Iterates stay strictly inside the box. A step component that would cross
//!   a bound is cut back to a fixed fraction of the remaining distance, so a
//!   variable only reaches a bound geometrically and never lands on it.
//! - A variable within a tiny gap of a bound is held for the step only while
//!   its gradient points out of the box.
//! - Termination on relative cost reduction (only for steps that are not
//!   damping-limited and whose reduction agrees with the linear model),
//!   relative step size, projected gradient,
//!   evaluation count or an optional wall-clock deadline.
//!
//! A run that stops without converging is not an error: the best point found
//! so far is returned together with a [`SolverStatus`] describing why it
//! stopped.

use std::time::Instant;

use nalgebra::{DMatrix, DVector};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Straight line `y = a·t + b` through noiseless samples.
    struct Line {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquares for Line {
        fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.t.len(),
                self.t.iter().zip(&self.y).map(|(t, y)| x[0] * t + x[1] - y),
            )
        }
    }

    struct Rosenbrock;

    impl LeastSquares for Rosenbrock {
        fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]])
        }

        fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_row_slice(2, 2, &[-20.0 * x[0], 10.0, -1.0, 0.0])
        }
    }

    fn line() -> Line {
        let t: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y = t.iter().map(|t| 3.0 * t - 2.0).collect();
        Line { t, y }
    }

    #[test]
    fn unconstrained_line_fit() {
        let solution = solve(
            &line(),
            &DVector::from_vec(vec![0.0, 0.0]),
            &Bounds::unbounded(2),
            &SolverOptions::default(),
        );
        assert!(solution.status.is_converged(), "{:?}", solution.status);
        assert_relative_eq!(solution.x[0], 3.0, epsilon = 1e-8);
        assert_relative_eq!(solution.x[1], -2.0, epsilon = 1e-8);
        assert!(solution.cost < 1e-12);
    }

    #[test]
    fn active_bound_is_respected() {
        let bounds = Bounds::new(vec![0.0, 0.0], vec![2.0, 10.0]);
        let solution = solve(
            &line(),
            &DVector::from_vec(vec![1.0, 1.0]),
            &bounds,
            &SolverOptions::default(),
        );
        assert_relative_eq!(solution.x[0], 2.0, epsilon = 1e-9);
        assert!(solution.x[0] < 2.0 && solution.x[1] > 0.0);
        assert!(bounds.contains(&solution.x));
        // with the slope pinned at 2 the best offset is the mean misfit
        let line = line();
        let mean: f64 = line.t.iter().zip(&line.y).map(|(t, y)| y - 2.0 * t).sum::<f64>()
            / line.t.len() as f64;
        assert_relative_eq!(solution.x[1], mean.max(0.0), epsilon = 1e-6);
    }

    #[test]
    fn initial_guess_clamped_into_box() {
        let bounds = Bounds::new(vec![-1.0, -1.0], vec![1.0, 1.0]);
        let solution = solve(
            &Rosenbrock,
            &DVector::from_vec(vec![5.0, -5.0]),
            &bounds,
            &SolverOptions::default(),
        );
        assert!(bounds.contains(&solution.x));
        assert_relative_eq!(solution.x[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(solution.x[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rosenbrock_valley() {
        let solution = solve(
            &Rosenbrock,
            &DVector::from_vec(vec![-1.2, 1.0]),
            &Bounds::unbounded(2),
            &SolverOptions::default(),
        );
        assert!(solution.status.is_converged());
        assert_relative_eq!(solution.x[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(solution.x[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn evaluation_limit_reported() {
        let options = SolverOptions {
            max_evaluations: 3,
            ..SolverOptions::default()
        };
        let solution = solve(
            &Rosenbrock,
            &DVector::from_vec(vec![-1.2, 1.0]),
            &Bounds::unbounded(2),
            &options,
        );
        assert_eq!(solution.status, SolverStatus::MaxEvaluations);
        assert!(!solution.status.is_converged());
        assert!(solution.evaluations <= 3);
    }

    #[test]
    fn heavy_damping_does_not_stop_early() {
        let options = SolverOptions {
            ftol: 1e-3,
            initial_damping: 1e6,
            ..SolverOptions::default()
        };
        let solution = solve(
            &line(),
            &DVector::from_vec(vec![0.0, 0.0]),
            &Bounds::unbounded(2),
            &options,
        );
        assert!(solution.status.is_converged(), "{:?}", solution.status);
        assert_relative_eq!(solution.x[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(solution.x[1], -2.0, epsilon = 1e-6);
    }

    #[test]
    fn start_on_bound_is_lifted_inside() {
        let bounds = Bounds::new(vec![0.0, 1.0, -2.0], vec![1.0, 1.0, f64::INFINITY]);
        let x = bounds.strictly_feasible(&DVector::from_vec(vec![0.0, 3.0, -5.0]));
        assert!(x[0] > 0.0 && x[0] < 1e-9);
        assert_eq!(x[1], 1.0);
        assert!(x[2] > -2.0 && x[2] < -2.0 + 1e-9);
    }

    #[test]
    fn overshooting_component_stops_short_of_bound() {
        let bounds = Bounds::new(vec![0.0, 0.0], vec![1.0, 10.0]);
        let x = DVector::from_vec(vec![0.2, 5.0]);
        let trial = bounds.step_inside(&x, &DVector::from_vec(vec![-1.0, 2.0]));
        assert_relative_eq!(trial[0], 0.2 * (1.0 - STEP_BACK), epsilon = 1e-15);
        assert_eq!(trial[1], 7.0);
        assert!(trial[0] > 0.0);
    }

    #[test]
    fn forward_difference_matches_analytic() {
        let x = DVector::from_vec(vec![0.3, -0.7]);
        let numeric = forward_difference(&Rosenbrock, &x);
        let analytic = Rosenbrock.jacobian(&x);
        for (a, b) in numeric.iter().zip(analytic.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
}

/// A vector-valued residual function.
pub trait LeastSquares {
    /// Residual vector at `x`.
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the residuals at `x`, one row per residual.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        forward_difference(self, x)
    }
}

/// Forward-difference Jacobian.
pub fn forward_difference<P: LeastSquares + ?Sized>(problem: &P, x: &DVector<f64>) -> DMatrix<f64> {
    let base = problem.residuals(x);
    let mut jac = DMatrix::zeros(base.len(), x.len());
    let mut probe = x.clone();
    for j in 0..x.len() {
        let step = f64::EPSILON.sqrt() * x[j].abs().max(1.0);
        probe[j] = x[j] + step;
        let shifted = problem.residuals(&probe);
        probe[j] = x[j];
        jac.set_column(j, &((shifted - &base) / step));
    }
    jac
}

/// Box constraints; infinite entries leave a side unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        assert_eq!(lower.len(), upper.len(), "bound vectors differ in length");
        Self {
            lower: DVector::from_vec(lower),
            upper: DVector::from_vec(upper),
        }
    }

    pub fn unbounded(dim: usize) -> Self {
        Self {
            lower: DVector::from_element(dim, f64::NEG_INFINITY),
            upper: DVector::from_element(dim, f64::INFINITY),
        }
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn clamp(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(v, (lo, hi))| v.max(*lo).min(*hi)),
        )
    }

    pub fn contains(&self, x: &DVector<f64>) -> bool {
        x.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(v, (lo, hi))| v >= lo && v <= hi)
    }

    /// Clamps `x` into the box and lifts components off their bounds by a
    /// small relative gap. Degenerate sides (`lower == upper`) stay put.
    pub fn strictly_feasible(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut x = self.clamp(x);
        for j in 0..x.len() {
            let (lo, hi) = (self.lower[j], self.upper[j]);
            if lo == hi {
                continue;
            }
            let half = if lo.is_finite() && hi.is_finite() {
                (hi - lo) / 2.0
            } else {
                f64::INFINITY
            };
            if x[j] <= lo {
                x[j] = lo + (BOUND_GAP * lo.abs().max(1.0)).min(half);
            } else if x[j] >= hi {
                x[j] = hi - (BOUND_GAP * hi.abs().max(1.0)).min(half);
            }
        }
        x
    }

    /// Moves from `x` along `step`; a component that would leave the box
    /// stops at a fixed fraction of its distance to the bound.
    pub fn step_inside(&self, x: &DVector<f64>, step: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            (0..x.len()).map(|j| {
                let target = x[j] + step[j];
                if target > self.upper[j] {
                    x[j] + STEP_BACK * (self.upper[j] - x[j])
                } else if target < self.lower[j] {
                    x[j] + STEP_BACK * (self.lower[j] - x[j])
                } else {
                    target
                }
            }),
        )
    }

    /// Whether variable `j` at `value` is held on a bound: it is within the
    /// bound gap and the gradient points out of the box.
    fn holds(&self, j: usize, value: f64, gradient: f64) -> bool {
        let (lo, hi) = (self.lower[j], self.upper[j]);
        if lo == hi {
            return true;
        }
        let on_lower = lo.is_finite() && value - lo <= BOUND_GAP * lo.abs().max(1.0);
        let on_upper = hi.is_finite() && hi - value <= BOUND_GAP * hi.abs().max(1.0);
        (on_lower && gradient > 0.0) || (on_upper && gradient < 0.0)
    }
}

/// Termination controls.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub max_evaluations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub initial_damping: f64,
    pub deadline: Option<Instant>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_evaluations: 1000,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            initial_damping: 1e-3,
            deadline: None,
        }
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    CostConverged,
    StepConverged,
    GradientConverged,
    MaxEvaluations,
    Stalled,
    Deadline,
}

impl SolverStatus {
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            SolverStatus::CostConverged | SolverStatus::StepConverged | SolverStatus::GradientConverged
        )
    }
}

/// Best point reached by a solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub x: DVector<f64>,
    pub cost: f64,
    pub evaluations: usize,
    pub status: SolverStatus,
}

const MAX_DAMPING: f64 = 1e16;
const MIN_DAMPING: f64 = 1e-15;
/// Fraction of the distance to a bound that a component may travel in one step.
const STEP_BACK: f64 = 0.995;
/// Relative gap to a bound below which a variable counts as sitting on it.
const BOUND_GAP: f64 = 1e-10;
/// Minimum ratio of actual to predicted reduction for the cost test.
const MIN_GAIN_RATIO: f64 = 0.25;
/// Damping at or above which a step is too short for the cost test.
const MAX_COST_TEST_DAMPING: f64 = 1.0;

/// Runs the interior Levenberg–Marquardt iteration from `x0`.
pub fn solve<P: LeastSquares + ?Sized>(
    problem: &P,
    x0: &DVector<f64>,
    bounds: &Bounds,
    options: &SolverOptions,
) -> Solution {
    let dim = x0.len();
    assert_eq!(dim, bounds.dim(), "initial guess and bounds differ in length");

    let mut x = bounds.strictly_feasible(x0);
    let mut residuals = problem.residuals(&x);
    let mut cost = residuals.norm_squared();
    let mut evaluations = 1;
    let mut damping = options.initial_damping;

    let status = 'outer: loop {
        if cost == 0.0 {
            break SolverStatus::CostConverged;
        }
        if evaluations >= options.max_evaluations {
            break SolverStatus::MaxEvaluations;
        }
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            break SolverStatus::Deadline;
        }

        let jac = problem.jacobian(&x);
        let gradient = jac.tr_mul(&residuals);

        // projected gradient: the move a unit gradient step would make inside the box
        let projected = (bounds.clamp(&(&x - &gradient)) - &x).amax();
        if projected <= options.gtol * (1.0 + cost) {
            break SolverStatus::GradientConverged;
        }

        // a variable is held only while it sits on a bound and descent leads out of the box
        let free: Vec<usize> = (0..dim)
            .filter(|&j| !bounds.holds(j, x[j], gradient[j]))
            .collect();
        if free.is_empty() {
            break SolverStatus::GradientConverged;
        }

        let normal = jac.tr_mul(&jac);
        let reduced = normal.select_rows(&free).select_columns(&free);
        let rhs = -DVector::from_iterator(free.len(), free.iter().map(|&j| gradient[j]));
        let diag_max = reduced.diagonal().max().max(f64::MIN_POSITIVE);
        let scale: Vec<f64> = reduced
            .diagonal()
            .iter()
            .map(|d| d.max(1e-12 * diag_max))
            .collect();

        loop {
            let mut system = reduced.clone();
            for (k, s) in scale.iter().enumerate() {
                system[(k, k)] += damping * s;
            }

            let step = match system.cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => {
                    damping *= 4.0;
                    if damping > MAX_DAMPING {
                        break 'outer SolverStatus::Stalled;
                    }
                    continue;
                }
            };

            let mut full = DVector::zeros(dim);
            for (k, &j) in free.iter().enumerate() {
                full[j] = step[k];
            }
            let trial = bounds.step_inside(&x, &full);
            let taken = &trial - &x;

            if taken.norm() <= options.xtol * (options.xtol + x.norm()) {
                break 'outer SolverStatus::StepConverged;
            }

            let trial_residuals = problem.residuals(&trial);
            let trial_cost = trial_residuals.norm_squared();
            evaluations += 1;

            if trial_cost.is_finite() && trial_cost < cost {
                let predicted = cost - (&residuals + &jac * &taken).norm_squared();
                let gain = (cost - trial_cost) / predicted.max(f64::MIN_POSITIVE);
                let reduction = (cost - trial_cost) / cost;
                let undamped = damping < MAX_COST_TEST_DAMPING;
                x = trial;
                residuals = trial_residuals;
                cost = trial_cost;
                damping = (damping / 3.0).max(MIN_DAMPING);
                if reduction <= options.ftol && gain > MIN_GAIN_RATIO && undamped {
                    break 'outer SolverStatus::CostConverged;
                }
                continue 'outer;
            }

            damping *= 4.0;
            if damping > MAX_DAMPING {
                break 'outer SolverStatus::Stalled;
            }
            if evaluations >= options.max_evaluations {
                break 'outer SolverStatus::MaxEvaluations;
            }
        }
    };

    Solution {
        x,
        cost,
        evaluations,
        status,
    }
}
