use crate::config::{AnalysisConfig, check_basis_size};
use crate::error::{ConfigurationError, InputMismatchError, NumericalDegeneracyError, SensitivityError};
use crate::morphing::basis::ErrorFunctional;
use crate::morphing::components::{evaluate_component_gradients, evaluate_components, monomial_matrix};
use crate::parameters::ParameterSpace;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Inverse, SVD};
use std::sync::OnceLock;

/// Smallest reciprocal condition number for which a morphing matrix still
/// counts as invertible.
pub const MIN_RECIPROCAL_CONDITION: f64 = 1e-13;

/// Closed-form morphing weights for a fixed basis.
///
/// The weight vector at `theta` solves `M^T w = c(theta)`, where `c` holds the
/// component monomials at `theta`. The inverse of `M` is computed on first use
/// and cached.
#[derive(Debug, Clone)]
pub struct Morpher {
    parameters: ParameterSpace,
    components: Array2<u32>,
    basis: Array2<f64>,
    morphing_matrix: Array2<f64>,
    inverse: OnceLock<Array2<f64>>,
}

impl Morpher {
    /// Builds a morpher from a component set and a basis (one benchmark per row).
    pub fn new(
        parameters: ParameterSpace,
        components: Array2<u32>,
        basis: Array2<f64>,
    ) -> Result<Self, SensitivityError> {
        let n_parameters = parameters.len();
        if n_parameters == 0 {
            return Err(ConfigurationError::NoParameters.into());
        }
        for found in [components.ncols(), basis.ncols()] {
            if found != n_parameters {
                return Err(ConfigurationError::ParameterCountMismatch {
                    expected: n_parameters,
                    found,
                }
                .into());
            }
        }
        check_basis_size(components.nrows(), basis.nrows())?;

        let morphing_matrix = monomial_matrix(components.view(), basis.view());
        Ok(Self {
            parameters,
            components,
            basis,
            morphing_matrix,
            inverse: OnceLock::new(),
        })
    }

    /// Builds the morpher from a frozen configuration.
    pub fn from_config(config: &AnalysisConfig) -> Result<Self, SensitivityError> {
        let setup = config
            .morphing()
            .ok_or(ConfigurationError::MorphingNotConfigured)?;
        Self::new(
            config.parameters().clone(),
            setup.components.clone(),
            config.benchmark_matrix(),
        )
    }

    pub fn n_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn n_benchmarks(&self) -> usize {
        self.basis.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn parameters(&self) -> &ParameterSpace {
        &self.parameters
    }

    pub fn labels(&self) -> Vec<String> {
        self.parameters.names()
    }

    pub fn components(&self) -> ArrayView2<'_, u32> {
        self.components.view()
    }

    pub fn basis(&self) -> ArrayView2<'_, f64> {
        self.basis.view()
    }

    pub fn morphing_matrix(&self) -> ArrayView2<'_, f64> {
        self.morphing_matrix.view()
    }

    /// The cached inverse of the morphing matrix.
    pub fn inverse(&self) -> Result<&Array2<f64>, NumericalDegeneracyError> {
        if let Some(inverse) = self.inverse.get() {
            return Ok(inverse);
        }
        let inverse = invert_morphing_matrix(&self.morphing_matrix)?;
        Ok(self.inverse.get_or_init(|| inverse))
    }

    /// Morphing weights at `theta`, one per benchmark.
    ///
    /// Points outside the declared ranges are allowed; they are logged as
    /// extrapolation.
    pub fn weights(&self, theta: ArrayView1<f64>) -> Result<Array1<f64>, SensitivityError> {
        self.parameters.check_point(theta)?;
        self.warn_on_extrapolation(theta);
        Ok(self.solve_weights(theta)?)
    }

    /// Derivatives of the weights, shape `(n_parameters, n_benchmarks)`.
    pub fn weight_gradients(&self, theta: ArrayView1<f64>) -> Result<Array2<f64>, SensitivityError> {
        self.parameters.check_point(theta)?;
        let inverse = self.inverse()?;
        let component_gradients = evaluate_component_gradients(self.components.view(), theta);
        // Row k: (M^-T dc/dtheta_k)^T = dc/dtheta_k^T M^-1
        Ok(component_gradients.dot(inverse))
    }

    /// Squared L2 norm of the weight vector at `theta`.
    pub fn squared_weight_norm(&self, theta: ArrayView1<f64>) -> Result<f64, SensitivityError> {
        let weights = self.weights(theta)?;
        Ok(weights.dot(&weights))
    }

    /// The error functional over a set of test points (one per row).
    pub fn expected_error(
        &self,
        points: ArrayView2<f64>,
        functional: ErrorFunctional,
    ) -> Result<f64, SensitivityError> {
        if points.ncols() != self.n_parameters() {
            return Err(ConfigurationError::ParameterCountMismatch {
                expected: self.n_parameters(),
                found: points.ncols(),
            }
            .into());
        }
        let norms = squared_weight_norms(self.components.view(), self.inverse()?, points);
        Ok(functional.evaluate(norms.view()))
    }

    /// Per-event weights at `theta` from per-benchmark event weights
    /// (`n_events x n_benchmarks`).
    pub fn morph_event_weights(
        &self,
        theta: ArrayView1<f64>,
        benchmark_weights: ArrayView2<f64>,
    ) -> Result<Array1<f64>, SensitivityError> {
        self.check_event_weights(benchmark_weights)?;
        let weights = self.weights(theta)?;
        Ok(benchmark_weights.dot(&weights))
    }

    /// Per-event weight gradients at `theta`, shape `(n_events, n_parameters)`.
    pub fn event_weight_gradients(
        &self,
        theta: ArrayView1<f64>,
        benchmark_weights: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SensitivityError> {
        self.check_event_weights(benchmark_weights)?;
        let gradients = self.weight_gradients(theta)?;
        Ok(benchmark_weights.dot(&gradients.t()))
    }

    pub(crate) fn check_event_weights(
        &self,
        benchmark_weights: ArrayView2<f64>,
    ) -> Result<(), InputMismatchError> {
        if benchmark_weights.ncols() != self.n_benchmarks() {
            return Err(InputMismatchError::BenchmarkCountMismatch {
                expected: self.n_benchmarks(),
                found: benchmark_weights.ncols(),
            });
        }
        Ok(())
    }

    fn solve_weights(&self, theta: ArrayView1<f64>) -> Result<Array1<f64>, NumericalDegeneracyError> {
        let inverse = self.inverse()?;
        let c = evaluate_components(self.components.view(), theta);
        let mut weights = inverse.t().dot(&c);
        // One step of iterative refinement against M^T w = c.
        let residual = &c - &self.morphing_matrix.t().dot(&weights);
        weights += &inverse.t().dot(&residual);
        Ok(weights)
    }

    fn warn_on_extrapolation(&self, theta: ArrayView1<f64>) {
        for index in self.parameters.out_of_range(theta) {
            let parameter = &self.parameters.parameters()[index];
            log::warn!(
                "Extrapolating morphing weights: {} = {} lies outside the declared range [{}, {}].",
                parameter.name,
                theta[index],
                parameter.range.0,
                parameter.range.1
            );
        }
    }
}

/// Inverts a morphing matrix, rejecting it when it is numerically singular.
pub fn invert_morphing_matrix(matrix: &Array2<f64>) -> Result<Array2<f64>, NumericalDegeneracyError> {
    let (_, singular_values, _) = matrix.svd(false, false)?;
    let max_sv = singular_values.iter().fold(0.0_f64, |max, &val| max.max(val));
    let min_sv = singular_values.iter().fold(f64::INFINITY, |min, &val| min.min(val));
    let rcond = if max_sv > 0.0 { min_sv / max_sv } else { 0.0 };
    if !(rcond >= MIN_RECIPROCAL_CONDITION) {
        return Err(NumericalDegeneracyError::SingularMorphingMatrix { rcond });
    }
    Ok(matrix.inv()?)
}

/// Squared weight norms for every row of `points`, given the inverse morphing matrix.
pub(crate) fn squared_weight_norms(
    components: ArrayView2<u32>,
    inverse: &Array2<f64>,
    points: ArrayView2<f64>,
) -> Array1<f64> {
    // Row t of C M^-1 is the weight vector at point t.
    let weights = monomial_matrix(components, points).dot(inverse);
    weights.map_axis(Axis(1), |row| row.dot(&row))
}
