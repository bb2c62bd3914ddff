use crate::error::{ConfigurationError, NumericalDegeneracyError, SensitivityError};
use crate::fisher::information::checked_symmetric;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, Inverse, UPLO};

/// Eigenvalues of the nuisance block below this fraction of the largest one
/// make the block singular.
pub const NUISANCE_EIGENVALUE_CUTOFF: f64 = 1e-12;

/// Principal submatrix on `subset`, in the order given. The remaining
/// parameters are treated as known. `matrix` must be a valid information
/// matrix (symmetric, positive semi-definite).
pub fn project_information(
    matrix: ArrayView2<f64>,
    subset: &[usize],
) -> Result<Array2<f64>, SensitivityError> {
    let matrix = checked_symmetric(matrix)?;
    check_subset(matrix.nrows(), subset)?;
    Ok(block(matrix.view(), subset, subset))
}

/// Schur complement `I_SS - I_SN I_NN^-1 I_NS` on `subset`, with the remaining
/// parameters `N` treated as nuisance parameters.
pub fn profile_information(
    matrix: ArrayView2<f64>,
    subset: &[usize],
) -> Result<Array2<f64>, SensitivityError> {
    let matrix = checked_symmetric(matrix)?;
    let nuisances = check_subset(matrix.nrows(), subset)?;
    if nuisances.is_empty() {
        return Ok(block(matrix.view(), subset, subset));
    }
    let nuisance_inverse = invert_nuisance_block(&block(matrix.view(), &nuisances, &nuisances))?;
    Ok(schur_complement(matrix.view(), subset, &nuisances, &nuisance_inverse))
}

/// The profiling map for matrices that need not be symmetric, used to
/// differentiate it numerically.
pub(crate) fn profile_unsymmetric(
    matrix: ArrayView2<f64>,
    subset: &[usize],
    nuisances: &[usize],
) -> Result<Array2<f64>, SensitivityError> {
    if nuisances.is_empty() {
        return Ok(block(matrix, subset, subset));
    }
    let nuisance_inverse = block(matrix, nuisances, nuisances).inv()?;
    Ok(schur_complement(matrix, subset, nuisances, &nuisance_inverse))
}

/// Validates `subset` against `n` parameters and returns the remaining indices
/// in ascending order.
pub(crate) fn check_subset(n: usize, subset: &[usize]) -> Result<Vec<usize>, ConfigurationError> {
    if subset.is_empty() {
        return Err(ConfigurationError::InvalidParameterSubset(
            "the subset is empty".to_string(),
        ));
    }
    let mut seen = vec![false; n];
    for &index in subset {
        if index >= n {
            return Err(ConfigurationError::InvalidParameterSubset(format!(
                "index {index} is out of range for {n} parameters"
            )));
        }
        if seen[index] {
            return Err(ConfigurationError::InvalidParameterSubset(format!(
                "index {index} appears more than once"
            )));
        }
        seen[index] = true;
    }
    Ok((0..n).filter(|&i| !seen[i]).collect())
}

fn block(matrix: ArrayView2<f64>, rows: &[usize], cols: &[usize]) -> Array2<f64> {
    matrix.select(Axis(0), rows).select(Axis(1), cols)
}

fn schur_complement(
    matrix: ArrayView2<f64>,
    subset: &[usize],
    nuisances: &[usize],
    nuisance_inverse: &Array2<f64>,
) -> Array2<f64> {
    let correction = block(matrix, subset, nuisances)
        .dot(nuisance_inverse)
        .dot(&block(matrix, nuisances, subset));
    block(matrix, subset, subset) - correction
}

fn invert_nuisance_block(nuisance: &Array2<f64>) -> Result<Array2<f64>, SensitivityError> {
    let (eigenvalues, eigenvectors) = nuisance.eigh(UPLO::Lower)?;
    let max_eigenvalue = eigenvalues.iter().fold(f64::NEG_INFINITY, |max, &v| max.max(v));
    let min_eigenvalue = eigenvalues.iter().fold(f64::INFINITY, |min, &v| min.min(v));
    if !(max_eigenvalue > 0.0) || min_eigenvalue <= NUISANCE_EIGENVALUE_CUTOFF * max_eigenvalue {
        return Err(NumericalDegeneracyError::SingularNuisanceBlock { min_eigenvalue }.into());
    }
    let reciprocal: Array1<f64> = eigenvalues.mapv(|v| 1.0 / v);
    Ok(eigenvectors
        .dot(&Array2::from_diag(&reciprocal))
        .dot(&eigenvectors.t()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InputMismatchError;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn three_parameter_information() -> Array2<f64> {
        array![[4.0, 1.0, 0.5], [1.0, 3.0, -0.7], [0.5, -0.7, 2.0]]
    }

    #[test]
    fn test_projection_selects_in_given_order() {
        let info = three_parameter_information();
        let projected = project_information(info.view(), &[2, 0]).unwrap();
        assert_eq!(projected, array![[2.0, 0.5], [0.5, 4.0]]);
    }

    #[test]
    fn test_nested_projection_equals_direct_projection() {
        let info = three_parameter_information();
        let outer = project_information(info.view(), &[2, 0]).unwrap();
        let nested = project_information(outer.view(), &[1]).unwrap();
        let direct = project_information(info.view(), &[0]).unwrap();
        assert_eq!(nested, direct);
    }

    #[test]
    fn test_profile_two_by_two() {
        let info = array![[2.0, 1.0], [1.0, 2.0]];
        let profiled = profile_information(info.view(), &[0]).unwrap();
        assert_abs_diff_eq!(profiled[[0, 0]], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_profile_of_block_diagonal_equals_projection() {
        let info = array![[3.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]];
        let profiled = profile_information(info.view(), &[0, 1]).unwrap();
        let projected = project_information(info.view(), &[0, 1]).unwrap();
        for (p, q) in profiled.iter().zip(projected.iter()) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_profiling_never_adds_information() {
        let info = three_parameter_information();
        let profiled = profile_information(info.view(), &[0]).unwrap();
        assert!(profiled[[0, 0]] <= info[[0, 0]]);
        assert!(profiled[[0, 0]] > 0.0);

        let everything = profile_information(info.view(), &[0, 1, 2]).unwrap();
        assert_eq!(everything, info);
    }

    #[test]
    fn test_unsymmetric_profile_agrees_on_symmetric_input() {
        let info = three_parameter_information();
        let nuisances = check_subset(3, &[1]).unwrap();
        assert_eq!(nuisances, vec![0, 2]);
        let general = profile_unsymmetric(info.view(), &[1], &nuisances).unwrap();
        let symmetric = profile_information(info.view(), &[1]).unwrap();
        assert_abs_diff_eq!(general[[0, 0]], symmetric[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_singular_nuisance_block_is_rejected() {
        let info = array![[1.0, 0.0, 0.0], [0.0, 1.0, 1.0], [0.0, 1.0, 1.0]];
        assert!(matches!(
            profile_information(info.view(), &[0]),
            Err(SensitivityError::NumericalDegeneracy(
                NumericalDegeneracyError::SingularNuisanceBlock { .. }
            ))
        ));
    }

    #[test]
    fn test_invalid_subsets() {
        let info = three_parameter_information();
        for subset in [&[][..], &[3][..], &[1, 1][..]] {
            assert!(matches!(
                project_information(info.view(), subset),
                Err(SensitivityError::Configuration(ConfigurationError::InvalidParameterSubset(_)))
            ));
        }
        let rectangular = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            profile_information(rectangular.view(), &[0]),
            Err(SensitivityError::InputMismatch(InputMismatchError::NotSquare { .. }))
        ));
    }

    #[test]
    fn test_asymmetric_input_is_flagged() {
        // eigh would only read the lower triangle and drop the 5.
        let info = array![[2.0, 1.0, 0.0], [1.0, 2.0, 5.0], [0.0, 0.0, 1.0]];
        for result in [
            profile_information(info.view(), &[0]),
            project_information(info.view(), &[0]),
        ] {
            assert!(matches!(
                result,
                Err(SensitivityError::NumericalDegeneracy(
                    NumericalDegeneracyError::NotSymmetric { .. }
                ))
            ));
        }
    }

    #[test]
    fn test_indefinite_input_is_flagged() {
        let info = array![[1.0, 2.0], [2.0, 1.0]];
        for result in [
            profile_information(info.view(), &[0]),
            project_information(info.view(), &[1]),
        ] {
            assert!(matches!(
                result,
                Err(SensitivityError::NumericalDegeneracy(
                    NumericalDegeneracyError::NotPositiveSemiDefinite { .. }
                ))
            ));
        }
    }
}
