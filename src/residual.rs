//! Residuals between a centered outline and the shape model.
//!
//! Model and measurement are compared at matched polar angles: for every
//! vertex `(x_i, y_i)` at angle `θ_i` the model point
//! `(r(θ_i)·cos θ_i, r(θ_i)·sin θ_i)` is generated and the Euclidean distance
//! between the two is the residual. This avoids a nearest-point search but
//! requires the outline to be star-shaped with respect to its centroid, i.e.
//! every ray from the centroid crosses the outline once.
//!
//! Both points lie on the same ray, so the distance equals the radial misfit
//! `|r(θ_i) − ρ_i|`. The solver is handed the signed misfit, which has the
//! same cost and a smooth Jacobian.

use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

use crate::outline::CenteredOutline;
use crate::shape::{ShapeParams, Variant};
use crate::solver::LeastSquares;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::Outline;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn ellipse_outline() -> CenteredOutline {
        let truth = ShapeParams::oval(10.0, 1.8, 0.4);
        let points = (0..90)
            .map(|i| truth.point_at(i as f64 * 2.0 * PI / 90.0))
            .collect();
        Outline::from_points(points).unwrap().centered().unwrap()
    }

    #[test]
    fn distances_are_radial_misfits() {
        let outline = ellipse_outline();
        let residual = ShapeResidual::new(&outline, Variant::Circular, 0);
        let x = DVector::from_vec(vec![9.0]);
        let distances = residual.distances(&x);
        let signed = residual.residuals(&x);
        for i in 0..outline.len() {
            assert_relative_eq!(distances[i], signed[i].abs(), epsilon = 1e-9);
            assert_relative_eq!(distances[i], (9.0 - outline.rho[i]).abs(), epsilon = 1e-9);
        }
    }

    #[test]
    fn exact_parameters_give_zero_cost() {
        let outline = ellipse_outline();
        let residual = ShapeResidual::new(&outline, Variant::Oval, 0);
        let cost = residual.cost(&DVector::from_vec(vec![10.0, 1.8, 0.4]));
        assert!(cost < 1e-18, "cost: {}", cost);
    }

    #[test]
    fn parameter_mapping_per_variant() {
        let outline = ellipse_outline();
        let shape = ShapeResidual::new(&outline, Variant::Shape, 7);
        let params = shape.params(&DVector::from_vec(vec![1.0, 2.0, 0.3, 0.1, 0.5]));
        assert_eq!(params, ShapeParams::shape(1.0, 2.0, 0.3, 0.1, 0.5, 7));

        let oval = ShapeResidual::new(&outline, Variant::Oval, 7);
        let params = oval.params(&DVector::from_vec(vec![1.0, 2.0, 0.5]));
        assert_eq!(params, ShapeParams::oval(1.0, 2.0, 0.5));
    }

    #[test]
    fn analytic_jacobian_matches_forward_difference() {
        let outline = ellipse_outline();
        let residual = ShapeResidual::new(&outline, Variant::Shape, 4);
        let x = DVector::from_vec(vec![9.0, 1.5, 0.1, 0.2, 0.3]);
        let analytic = residual.jacobian(&x);
        let numeric = crate::solver::forward_difference(&residual, &x);
        for (a, b) in analytic.iter().zip(numeric.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }
}

/// Residual function of one outline under one model variant.
///
/// For [`Variant::Shape`] the harmonic order is fixed at construction; the
/// fitter builds one residual per candidate order.
#[derive(Debug, Clone)]
pub struct ShapeResidual<'a> {
    outline: &'a CenteredOutline,
    variant: Variant,
    order: u32,
}

impl<'a> ShapeResidual<'a> {
    pub fn new(outline: &'a CenteredOutline, variant: Variant, order: u32) -> Self {
        let order = match variant {
            Variant::Shape => order,
            _ => 0,
        };
        Self {
            outline,
            variant,
            order,
        }
    }

    /// Maps the free parameter vector onto full shape parameters.
    ///
    /// Layout: circular `[r0]`, oval `[r0, o, rotation]`,
    /// shape `[r0, o, h, p, rotation]`.
    pub fn params(&self, x: &DVector<f64>) -> ShapeParams {
        let mut params = ShapeParams::circle(0.0);
        params.n = self.order;
        for (value, &component) in x.iter().zip(self.variant.free_components()) {
            params.set_component(component, *value);
        }
        params
    }

    /// Euclidean distance between each vertex and its model point.
    pub fn distances(&self, x: &DVector<f64>) -> Array1<f64> {
        let params = self.params(x);
        let mut distances = Array1::zeros(self.outline.len());
        for (i, d) in distances.iter_mut().enumerate() {
            let [mx, my] = params.point_at(self.outline.theta[i]);
            *d = (mx - self.outline.x[i]).hypot(my - self.outline.y[i]);
        }
        distances
    }

    /// Sum of squared distances.
    pub fn cost(&self, x: &DVector<f64>) -> f64 {
        self.distances(x).mapv(|d| d * d).sum()
    }
}

impl LeastSquares for ShapeResidual<'_> {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let params = self.params(x);
        DVector::from_iterator(
            self.outline.len(),
            self.outline
                .theta
                .iter()
                .zip(self.outline.rho.iter())
                .map(|(theta, rho)| params.radius_at(*theta) - rho),
        )
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let params = self.params(x);
        let free = self.variant.free_components();
        let mut jac = DMatrix::zeros(self.outline.len(), free.len());
        for (i, theta) in self.outline.theta.iter().enumerate() {
            let gradient = params.gradient_at(*theta);
            for (k, &component) in free.iter().enumerate() {
                jac[(i, k)] = gradient[component];
            }
        }
        jac
    }
}
