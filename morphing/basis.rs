//! Selection of the morphing basis.
//!
//! Candidate bases keep every fixed benchmark and fill the free slots with
//! points drawn uniformly from the parameter ranges. Each candidate is scored
//! by an error functional over a shared set of random test points: the squared
//! norm of the morphing weight vector, averaged (or maximized) over the test
//! points. Large weights amplify statistical fluctuations of the benchmark
//! samples, so the candidate with the smallest score wins.

use crate::error::{ConfigurationError, SensitivityError};
use crate::morphing::components::monomial_matrix;
use crate::morphing::weights::{invert_morphing_matrix, squared_weight_norms};
use crate::parameters::ParameterSpace;
use ndarray::{Array2, ArrayView1, ArrayView2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How the squared weight norms over the test points are reduced to one score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorFunctional {
    /// Mean of the squared weight norms.
    #[default]
    Mean,
    /// Largest squared weight norm.
    Max,
}

impl ErrorFunctional {
    pub fn evaluate(&self, squared_norms: ArrayView1<f64>) -> f64 {
        match self {
            ErrorFunctional::Mean => squared_norms.mean().unwrap_or(f64::INFINITY),
            ErrorFunctional::Max => squared_norms
                .iter()
                .fold(f64::NEG_INFINITY, |max, &val| max.max(val)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasisOptions {
    /// Number of random candidate bases.
    pub n_trials: usize,
    /// Number of random test points the error functional is evaluated on.
    pub n_test_points: usize,
    pub functional: ErrorFunctional,
    pub seed: u64,
}

impl Default for BasisOptions {
    fn default() -> Self {
        Self {
            n_trials: 100,
            n_test_points: 100,
            functional: ErrorFunctional::Mean,
            seed: 0x5EED_BA5E,
        }
    }
}

/// The winning candidate.
#[derive(Debug, Clone)]
pub struct BasisSolution {
    /// Complete basis, fixed benchmarks first, one point per row.
    pub basis: Array2<f64>,
    /// Components evaluated at the basis points.
    pub morphing_matrix: Array2<f64>,
    pub expected_error: f64,
    /// Index of the winning trial.
    pub trial: usize,
    /// Number of candidates discarded as singular.
    pub n_singular: usize,
}

struct ScoredCandidate {
    trial: usize,
    basis: Array2<f64>,
    morphing_matrix: Array2<f64>,
    error: f64,
}

/// Finds a low-error morphing basis that contains every row of `fixed`.
pub fn optimize_basis(
    parameters: &ParameterSpace,
    components: ArrayView2<u32>,
    fixed: ArrayView2<f64>,
    options: &BasisOptions,
) -> Result<BasisSolution, SensitivityError> {
    if options.n_trials == 0 || options.n_test_points == 0 {
        return Err(ConfigurationError::InvalidOptions(
            "basis optimization needs at least one trial and one test point".to_string(),
        )
        .into());
    }
    let n_parameters = parameters.len();
    if n_parameters == 0 {
        return Err(ConfigurationError::NoParameters.into());
    }
    for found in [components.ncols(), fixed.ncols()] {
        if found != n_parameters {
            return Err(ConfigurationError::ParameterCountMismatch {
                expected: n_parameters,
                found,
            }
            .into());
        }
    }
    let n_components = components.nrows();
    if fixed.nrows() > n_components {
        return Err(ConfigurationError::OverdeterminedBasis {
            components: n_components,
            benchmarks: fixed.nrows(),
        }
        .into());
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let test_points = parameters.sample_uniform(&mut rng, options.n_test_points);
    let n_free = n_components - fixed.nrows();
    // With no free slots every trial would score the same candidate.
    let n_trials = if n_free == 0 { 1 } else { options.n_trials };

    let scored: Vec<Option<ScoredCandidate>> = (0..n_trials)
        .into_par_iter()
        .map(|trial| {
            let mut trial_rng = StdRng::seed_from_u64(internal::trial_seed(options.seed, trial));
            let candidate = internal::draw_candidate(parameters, fixed, n_free, &mut trial_rng);
            internal::score_candidate(
                trial,
                candidate,
                components,
                test_points.view(),
                options.functional,
            )
        })
        .collect();

    let n_singular = scored.iter().filter(|c| c.is_none()).count();
    let best = scored
        .into_iter()
        .flatten()
        .min_by(|a, b| a.error.total_cmp(&b.error).then(a.trial.cmp(&b.trial)))
        .ok_or(ConfigurationError::NoInvertibleBasis { n_trials })?;

    log::info!(
        "Selected morphing basis from trial {} of {}: expected squared weight norm {:.4e} ({} singular candidates discarded).",
        best.trial,
        n_trials,
        best.error,
        n_singular
    );

    Ok(BasisSolution {
        basis: best.basis,
        morphing_matrix: best.morphing_matrix,
        expected_error: best.error,
        trial: best.trial,
        n_singular,
    })
}

mod internal {
    use super::*;
    use rand::Rng;

    /// Independent, schedule-free seed for each trial.
    pub(super) fn trial_seed(seed: u64, trial: usize) -> u64 {
        seed.wrapping_add((trial as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub(super) fn draw_candidate<R: Rng>(
        parameters: &ParameterSpace,
        fixed: ArrayView2<f64>,
        n_free: usize,
        rng: &mut R,
    ) -> Array2<f64> {
        let n_fixed = fixed.nrows();
        let mut candidate = Array2::zeros((n_fixed + n_free, parameters.len()));
        candidate.slice_mut(s![..n_fixed, ..]).assign(&fixed);
        candidate
            .slice_mut(s![n_fixed.., ..])
            .assign(&parameters.sample_uniform(rng, n_free));
        candidate
    }

    pub(super) fn score_candidate(
        trial: usize,
        candidate: Array2<f64>,
        components: ArrayView2<u32>,
        test_points: ArrayView2<f64>,
        functional: ErrorFunctional,
    ) -> Option<ScoredCandidate> {
        let morphing_matrix = monomial_matrix(components, candidate.view());
        let inverse = match invert_morphing_matrix(&morphing_matrix) {
            Ok(inverse) => inverse,
            Err(e) => {
                log::debug!("Discarding candidate basis {trial}: {e}");
                return None;
            }
        };
        let error = functional.evaluate(squared_weight_norms(components, &inverse, test_points).view());
        if !error.is_finite() {
            log::debug!("Discarding candidate basis {trial}: non-finite error {error}");
            return None;
        }
        log::debug!("Candidate basis {trial}: error {error:.4e}");
        Some(ScoredCandidate {
            trial,
            basis: candidate,
            morphing_matrix,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morphing::components::find_components;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_parameter_space() -> ParameterSpace {
        let mut space = ParameterSpace::new();
        space.add_parameter("a", 0, 2, (-50.0, 50.0)).unwrap();
        space.add_parameter("b", 1, 2, (-50.0, 50.0)).unwrap();
        space
    }

    fn options(n_trials: usize) -> BasisOptions {
        BasisOptions {
            n_trials,
            n_test_points: 50,
            ..BasisOptions::default()
        }
    }

    #[test]
    fn test_fixed_benchmarks_are_kept_in_front() {
        let space = two_parameter_space();
        let components = find_components(&[2, 2], 2).unwrap();
        let fixed = array![[0.0, 0.0], [20.0, 0.0]];
        let solution = optimize_basis(&space, components.view(), fixed.view(), &options(50)).unwrap();
        assert_eq!(solution.basis.dim(), (6, 2));
        assert_eq!(solution.basis.slice(s![..2, ..]), fixed);
        for row in solution.basis.slice(s![2.., ..]).rows() {
            assert!(space.out_of_range(row).is_empty());
        }
        assert_eq!(solution.morphing_matrix.dim(), (6, 6));
        assert!(solution.expected_error.is_finite());
    }

    #[test]
    fn test_more_trials_never_score_worse() {
        let space = two_parameter_space();
        let components = find_components(&[2, 2], 2).unwrap();
        let fixed = array![[0.0, 0.0]];
        let few = optimize_basis(&space, components.view(), fixed.view(), &options(5)).unwrap();
        let many = optimize_basis(&space, components.view(), fixed.view(), &options(200)).unwrap();
        // Trial seeds do not depend on the trial count, so the larger search contains the smaller.
        assert!(many.expected_error <= few.expected_error);
    }

    #[test]
    fn test_same_seed_is_deterministic() {
        let space = two_parameter_space();
        let components = find_components(&[2, 2], 2).unwrap();
        let fixed = Array2::zeros((0, 2));
        let first = optimize_basis(&space, components.view(), fixed.view(), &options(40)).unwrap();
        let second = optimize_basis(&space, components.view(), fixed.view(), &options(40)).unwrap();
        assert_eq!(first.basis, second.basis);
        assert_eq!(first.trial, second.trial);
    }

    #[test]
    fn test_fully_fixed_basis_is_scored_once() {
        let mut space = ParameterSpace::new();
        space.add_parameter("g", 0, 2, (-1.0, 1.0)).unwrap();
        let components = find_components(&[2], 2).unwrap();
        let fixed = array![[-1.0], [0.0], [1.0]];
        let solution = optimize_basis(&space, components.view(), fixed.view(), &options(500)).unwrap();
        assert_eq!(solution.basis, fixed);
        assert_eq!(solution.trial, 0);
    }

    #[test]
    fn test_degenerate_fixed_benchmarks_exhaust_all_trials() {
        let space = two_parameter_space();
        let components = find_components(&[2, 2], 2).unwrap();
        let fixed = array![[1.0, 1.0], [1.0, 1.0]];
        let err = optimize_basis(&space, components.view(), fixed.view(), &options(25)).unwrap_err();
        assert!(matches!(
            err,
            SensitivityError::Configuration(ConfigurationError::NoInvertibleBasis { n_trials: 25 })
        ));
    }

    #[test]
    fn test_invalid_requests() {
        let space = two_parameter_space();
        let components = find_components(&[2, 2], 2).unwrap();
        let fixed = Array2::zeros((0, 2));
        assert!(matches!(
            optimize_basis(&space, components.view(), fixed.view(), &options(0)),
            Err(SensitivityError::Configuration(ConfigurationError::InvalidOptions(_)))
        ));
        let seven = Array2::from_shape_fn((7, 2), |(i, j)| (i * 2 + j) as f64);
        assert!(matches!(
            optimize_basis(&space, components.view(), seven.view(), &options(3)),
            Err(SensitivityError::Configuration(ConfigurationError::OverdeterminedBasis { .. }))
        ));
    }

    #[test]
    fn test_functionals() {
        let norms = array![1.0, 4.0, 7.0];
        assert_abs_diff_eq!(ErrorFunctional::Mean.evaluate(norms.view()), 4.0);
        assert_abs_diff_eq!(ErrorFunctional::Max.evaluate(norms.view()), 7.0);
    }
}
