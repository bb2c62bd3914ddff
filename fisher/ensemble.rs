//! Reduction of an ensemble of estimates into a mean and its spread.
//!
//! Each member is produced independently (one estimator, one matrix), so the
//! reduction is a pure function of the member list.

use crate::error::{InputMismatchError, SensitivityError};
use crate::fisher::information::FisherInformation;
use crate::fisher::projection::{
    check_subset, profile_information, profile_unsymmetric, project_information,
};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2};
use serde::Serialize;

/// Relative step of the central differences used to propagate the covariance
/// through profiling.
pub const FINITE_DIFFERENCE_STEP: f64 = 1e-6;

/// Mean Fisher information of an ensemble and the covariance of its entries,
/// `covariance[[i, j, k, l]] = Cov(I_ij, I_kl)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleResult {
    pub mean: Array2<f64>,
    pub covariance: Array4<f64>,
}

/// What gets handed to plotting: labels, the mean matrix and the covariance
/// flattened to `(p * p, p * p)` with row-major entry order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensitivityReport {
    pub labels: Vec<String>,
    pub mean: Array2<f64>,
    pub covariance_matrix: Array2<f64>,
}

impl EnsembleResult {
    pub fn n_parameters(&self) -> usize {
        self.mean.nrows()
    }

    /// `Var(I_ij)` for every entry.
    pub fn variance(&self) -> Array2<f64> {
        let p = self.n_parameters();
        Array2::from_shape_fn((p, p), |(i, j)| self.covariance[[i, j, i, j]])
    }

    /// Restricts mean and covariance to `subset`.
    pub fn project(&self, subset: &[usize]) -> Result<Self, SensitivityError> {
        self.check_shape()?;
        let mean = project_information(self.mean.view(), subset)?;
        let q = subset.len();
        let covariance = Array4::from_shape_fn((q, q, q, q), |(a, b, c, d)| {
            self.covariance[[subset[a], subset[b], subset[c], subset[d]]]
        });
        Ok(Self { mean, covariance })
    }

    /// Profiles the mean onto `subset` and propagates the covariance linearly
    /// through the profiling map.
    pub fn profile(&self, subset: &[usize]) -> Result<Self, SensitivityError> {
        self.check_shape()?;
        let mean = profile_information(self.mean.view(), subset)?;
        let nuisances = check_subset(self.n_parameters(), subset)?;
        let jacobian = profile_jacobian(self.mean.view(), subset, &nuisances)?;
        let propagated = jacobian
            .dot(&flatten_covariance(&self.covariance))
            .dot(&jacobian.t());
        Ok(Self {
            mean,
            covariance: unflatten_covariance(&propagated, subset.len()),
        })
    }

    pub fn report(&self, labels: Vec<String>) -> Result<SensitivityReport, InputMismatchError> {
        self.check_shape()?;
        if labels.len() != self.n_parameters() {
            return Err(InputMismatchError::VectorLength {
                expected: self.n_parameters(),
                found: labels.len(),
            });
        }
        Ok(SensitivityReport {
            labels,
            mean: self.mean.clone(),
            covariance_matrix: flatten_covariance(&self.covariance),
        })
    }

    fn check_shape(&self) -> Result<(), InputMismatchError> {
        let (rows, cols) = self.mean.dim();
        if rows != cols {
            return Err(InputMismatchError::NotSquare { shape: (rows, cols) });
        }
        let expected = [rows; 4];
        let (a, b, c, d) = self.covariance.dim();
        if [a, b, c, d] != expected {
            return Err(InputMismatchError::CovarianceShape {
                expected,
                found: [a, b, c, d],
            });
        }
        Ok(())
    }
}

/// Elementwise mean and the unbiased (`N - 1`) covariance tensor of the members.
/// A single member has zero covariance.
pub fn aggregate_ensemble(members: &[Array2<f64>]) -> Result<EnsembleResult, InputMismatchError> {
    let first = members.first().ok_or(InputMismatchError::EmptyEnsemble)?;
    let expected = first.dim();
    for (member, matrix) in members.iter().enumerate() {
        if matrix.nrows() != matrix.ncols() {
            return Err(InputMismatchError::MemberNotSquare {
                member,
                shape: matrix.dim(),
            });
        }
        if matrix.dim() != expected {
            return Err(InputMismatchError::ShapeMismatch {
                member,
                expected,
                found: matrix.dim(),
            });
        }
    }

    let p = expected.0;
    let n_members = members.len();
    let mut mean = Array2::<f64>::zeros((p, p));
    for matrix in members {
        mean += matrix;
    }
    mean /= n_members as f64;

    let covariance = if n_members < 2 {
        Array4::zeros((p, p, p, p))
    } else {
        let deviations = Array2::from_shape_fn((n_members, p * p), |(m, k)| {
            members[m][[k / p, k % p]] - mean[[k / p, k % p]]
        });
        let flat = deviations.t().dot(&deviations) / (n_members - 1) as f64;
        unflatten_covariance(&flat, p)
    };

    log::debug!("Aggregated an ensemble of {n_members} members over {p} parameters.");
    Ok(EnsembleResult { mean, covariance })
}

/// Like [`aggregate_ensemble`], but every member must carry the parameter
/// labels of the first one, in the same order.
pub fn aggregate_labelled_ensemble(
    members: &[FisherInformation],
) -> Result<EnsembleResult, InputMismatchError> {
    let first = members.first().ok_or(InputMismatchError::EmptyEnsemble)?;
    if let Some((member, info)) = members
        .iter()
        .enumerate()
        .find(|(_, info)| info.labels() != first.labels())
    {
        return Err(InputMismatchError::LabelMismatch {
            member,
            expected: first.labels().to_vec(),
            found: info.labels().to_vec(),
        });
    }
    let matrices: Vec<Array2<f64>> = members.iter().map(|info| info.matrix().to_owned()).collect();
    aggregate_ensemble(&matrices)
}

/// Per-event mean score and per-event covariance across ensemble members.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreAggregate {
    /// `(n_events, n_parameters)`.
    pub mean: Array2<f64>,
    /// `(n_events, n_parameters, n_parameters)`.
    pub covariance: Array3<f64>,
}

/// Averages score predictions (each `n_events x n_parameters`) over members.
pub fn aggregate_scores(predictions: &[Array2<f64>]) -> Result<ScoreAggregate, InputMismatchError> {
    let first = predictions.first().ok_or(InputMismatchError::EmptyEnsemble)?;
    let expected = first.dim();
    if let Some((member, found)) = predictions
        .iter()
        .map(|p| p.dim())
        .enumerate()
        .find(|(_, dim)| *dim != expected)
    {
        return Err(InputMismatchError::ShapeMismatch {
            member,
            expected,
            found,
        });
    }

    let (n_events, n_parameters) = expected;
    let n_members = predictions.len();
    let mut mean = Array2::<f64>::zeros(expected);
    for prediction in predictions {
        mean += prediction;
    }
    mean /= n_members as f64;

    let mut covariance = Array3::<f64>::zeros((n_events, n_parameters, n_parameters));
    if n_members > 1 {
        let norm = 1.0 / (n_members - 1) as f64;
        for prediction in predictions {
            let deviation = prediction - &mean;
            for e in 0..n_events {
                for i in 0..n_parameters {
                    for j in 0..n_parameters {
                        covariance[[e, i, j]] += norm * deviation[[e, i]] * deviation[[e, j]];
                    }
                }
            }
        }
    }
    Ok(ScoreAggregate { mean, covariance })
}

/// Derivative of the profiled entries (rows, `q * q`) with respect to every
/// entry of the full matrix (columns, `p * p`), each perturbed independently.
fn profile_jacobian(
    mean: ArrayView2<f64>,
    subset: &[usize],
    nuisances: &[usize],
) -> Result<Array2<f64>, SensitivityError> {
    let p = mean.nrows();
    let q = subset.len();
    let scale = mean.iter().fold(0.0_f64, |max, &v| max.max(v.abs()));
    let step = FINITE_DIFFERENCE_STEP * if scale > 0.0 { scale } else { 1.0 };

    let mut jacobian = Array2::zeros((q * q, p * p));
    let mut perturbed = mean.to_owned();
    for i in 0..p {
        for j in 0..p {
            let original = perturbed[[i, j]];
            perturbed[[i, j]] = original + step;
            let up = profile_unsymmetric(perturbed.view(), subset, nuisances)?;
            perturbed[[i, j]] = original - step;
            let down = profile_unsymmetric(perturbed.view(), subset, nuisances)?;
            perturbed[[i, j]] = original;

            let derivative: Array1<f64> = (&up - &down)
                .iter()
                .map(|v| v / (2.0 * step))
                .collect();
            jacobian.column_mut(i * p + j).assign(&derivative);
        }
    }
    Ok(jacobian)
}

fn flatten_covariance(covariance: &Array4<f64>) -> Array2<f64> {
    let p = covariance.dim().0;
    Array2::from_shape_fn((p * p, p * p), |(r, c)| {
        covariance[[r / p, r % p, c / p, c % p]]
    })
}

fn unflatten_covariance(flat: &Array2<f64>, p: usize) -> Array4<f64> {
    Array4::from_shape_fn((p, p, p, p), |(i, j, k, l)| flat[[i * p + j, k * p + l]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn members() -> Vec<Array2<f64>> {
        vec![
            array![[2.0, 1.0], [1.0, 2.0]],
            array![[3.0, 0.5], [0.5, 2.0]],
            array![[2.5, 1.2], [1.2, 3.0]],
        ]
    }

    #[test]
    fn test_identical_members_have_zero_covariance() {
        let matrix = array![[2.0, 0.3], [0.3, 1.0]];
        let result = aggregate_ensemble(&vec![matrix.clone(); 4]).unwrap();
        for (a, b) in result.mean.iter().zip(matrix.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-15);
        }
        assert!(result.covariance.iter().all(|&v| v.abs() < 1e-15));
    }

    #[test]
    fn test_single_member_has_zero_covariance() {
        let result = aggregate_ensemble(&[array![[1.0]]]).unwrap();
        assert_eq!(result.mean, array![[1.0]]);
        assert_eq!(result.covariance, Array4::zeros((1, 1, 1, 1)));
    }

    #[test]
    fn test_unbiased_covariance() {
        let a = array![[1.0, 0.0], [0.0, 1.0]];
        let b = array![[3.0, 0.0], [0.0, 1.0]];
        let result = aggregate_ensemble(&[a, b]).unwrap();
        assert_eq!(result.mean, array![[2.0, 0.0], [0.0, 1.0]]);
        // ((1 - 2)^2 + (3 - 2)^2) / (2 - 1)
        assert_abs_diff_eq!(result.covariance[[0, 0, 0, 0]], 2.0);
        assert_abs_diff_eq!(result.covariance[[1, 1, 1, 1]], 0.0);
        assert_eq!(result.variance(), array![[2.0, 0.0], [0.0, 0.0]]);

        let report = result.report(vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(report.covariance_matrix.dim(), (4, 4));
        assert_abs_diff_eq!(report.covariance_matrix[[0, 0]], 2.0);
        assert!(result.report(vec!["a".to_string()]).is_err());
    }

    #[test]
    fn test_covariance_is_symmetric_under_entry_exchange() {
        let result = aggregate_ensemble(&members()).unwrap();
        for ((i, j, k, l), &v) in result.covariance.indexed_iter() {
            assert_abs_diff_eq!(v, result.covariance[[k, l, i, j]], epsilon = 1e-14);
        }
    }

    #[test]
    fn test_malformed_ensembles() {
        assert!(matches!(aggregate_ensemble(&[]), Err(InputMismatchError::EmptyEnsemble)));
        let err = aggregate_ensemble(&[array![[1.0]], array![[1.0]], Array2::eye(2)]).unwrap_err();
        assert!(matches!(
            err,
            InputMismatchError::ShapeMismatch {
                member: 2,
                expected: (1, 1),
                found: (2, 2)
            }
        ));
        let err = aggregate_ensemble(&[Array2::zeros((2, 3))]).unwrap_err();
        assert!(matches!(err, InputMismatchError::MemberNotSquare { member: 0, .. }));
    }

    #[test]
    fn test_projection_slices_covariance() {
        let result = aggregate_ensemble(&members()).unwrap();
        let projected = result.project(&[1]).unwrap();
        assert_eq!(projected.mean, array![[result.mean[[1, 1]]]]);
        assert_eq!(
            projected.covariance[[0, 0, 0, 0]],
            result.covariance[[1, 1, 1, 1]]
        );
    }

    #[test]
    fn test_profile_propagates_covariance_linearly() {
        let result = aggregate_ensemble(&members()).unwrap();
        let profiled = result.profile(&[0]).unwrap();

        // f(a, b, c, d) = a - b c / d for the matrix [[a, b], [c, d]].
        let (a, b, c, d) = (
            result.mean[[0, 0]],
            result.mean[[0, 1]],
            result.mean[[1, 0]],
            result.mean[[1, 1]],
        );
        assert_abs_diff_eq!(profiled.mean[[0, 0]], a - b * c / d, epsilon = 1e-12);
        let jacobian = array![[1.0, -c / d, -b / d, b * c / (d * d)]];
        let expected = jacobian
            .dot(&flatten_covariance(&result.covariance))
            .dot(&jacobian.t());
        assert_abs_diff_eq!(profiled.covariance[[0, 0, 0, 0]], expected[[0, 0]], epsilon = 1e-7);
    }

    #[test]
    fn test_profile_of_block_diagonal_keeps_projected_covariance() {
        let ensemble = vec![
            array![[2.0, 0.0], [0.0, 1.0]],
            array![[2.6, 0.0], [0.0, 1.5]],
            array![[1.7, 0.0], [0.0, 0.8]],
        ];
        let result = aggregate_ensemble(&ensemble).unwrap();
        let profiled = result.profile(&[0]).unwrap();
        let projected = result.project(&[0]).unwrap();
        assert_abs_diff_eq!(
            profiled.covariance[[0, 0, 0, 0]],
            projected.covariance[[0, 0, 0, 0]],
            epsilon = 1e-7
        );
        assert!(matches!(
            result.profile(&[0, 0]),
            Err(SensitivityError::Configuration(ConfigurationError::InvalidParameterSubset(_)))
        ));
    }

    #[test]
    fn test_score_aggregation() {
        let predictions = vec![array![[1.0, 0.0], [2.0, 2.0]], array![[3.0, 2.0], [2.0, 4.0]]];
        let aggregate = aggregate_scores(&predictions).unwrap();
        assert_eq!(aggregate.mean, array![[2.0, 1.0], [2.0, 3.0]]);
        // Event 0 deviations: (-1, -1) and (1, 1).
        assert_abs_diff_eq!(aggregate.covariance[[0, 0, 0]], 2.0);
        assert_abs_diff_eq!(aggregate.covariance[[0, 0, 1]], 2.0);
        // Event 1 deviations: (0, -1) and (0, 1).
        assert_abs_diff_eq!(aggregate.covariance[[1, 0, 0]], 0.0);
        assert_abs_diff_eq!(aggregate.covariance[[1, 1, 1]], 2.0);

        let err = aggregate_scores(&[Array2::zeros((2, 2)), Array2::zeros((3, 2))]).unwrap_err();
        assert!(matches!(err, InputMismatchError::ShapeMismatch { member: 1, .. }));
    }

    #[test]
    fn test_labelled_ensemble_rejects_permuted_parameters() {
        let ordered = FisherInformation::new(
            array![[4.0, 0.0], [0.0, 1.0]],
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap();
        let permuted = FisherInformation::new(
            array![[1.0, 0.0], [0.0, 4.0]],
            vec!["b".to_string(), "a".to_string()],
        )
        .unwrap();

        let err = aggregate_labelled_ensemble(&[ordered.clone(), permuted]).unwrap_err();
        match err {
            InputMismatchError::LabelMismatch {
                member,
                expected,
                found,
            } => {
                assert_eq!(member, 1);
                assert_eq!(expected, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(found, vec!["b".to_string(), "a".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let result = aggregate_labelled_ensemble(&[ordered.clone(), ordered]).unwrap();
        assert_eq!(result.mean, array![[4.0, 0.0], [0.0, 1.0]]);
        assert!(matches!(
            aggregate_labelled_ensemble(&[]),
            Err(InputMismatchError::EmptyEnsemble)
        ));
    }
}
