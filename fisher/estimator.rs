use crate::error::{InputMismatchError, SensitivityError};
use crate::fisher::ensemble::{EnsembleResult, aggregate_labelled_ensemble, aggregate_scores};
use crate::fisher::information::information_from_scores;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, CowArray, Ix2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A trained per-event score estimator, `t(x | theta) = grad_theta log p(x | theta)`.
pub trait ScoreEstimator: Sync {
    fn n_parameters(&self) -> usize;

    /// Observable columns the estimator was trained on. `None` means all of them.
    fn features(&self) -> Option<&[usize]> {
        None
    }

    /// Scores for every row of `observables`, shape `(n_events, n_parameters)`.
    fn evaluate_score(
        &self,
        theta: ArrayView1<f64>,
        observables: ArrayView2<f64>,
    ) -> Result<Array2<f64>, SensitivityError>;
}

/// How an estimator ensemble is turned into one Fisher information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnsembleMode {
    /// One matrix per member, then mean and covariance over the matrices.
    #[default]
    Information,
    /// Average the scores first and compute one matrix from the mean score.
    /// The covariance still comes from the per-member matrices.
    MeanScore,
}

/// Fisher information of unweighted events sampled at `theta` for every member
/// of an estimator ensemble. `labels` fixes the parameter ordering.
pub fn ensemble_information<E: ScoreEstimator>(
    estimators: &[E],
    observables: ArrayView2<f64>,
    theta: ArrayView1<f64>,
    cross_section: f64,
    luminosity: f64,
    labels: &[String],
    mode: EnsembleMode,
) -> Result<EnsembleResult, SensitivityError> {
    if estimators.is_empty() {
        return Err(InputMismatchError::EmptyEnsemble.into());
    }
    let n_parameters = labels.len();
    if theta.len() != n_parameters {
        return Err(InputMismatchError::VectorLength {
            expected: n_parameters,
            found: theta.len(),
        }
        .into());
    }

    let predictions = estimators
        .par_iter()
        .enumerate()
        .map(|(member, estimator)| predict(member, estimator, observables, theta, n_parameters))
        .collect::<Result<Vec<_>, _>>()?;

    let members = predictions
        .par_iter()
        .map(|scores| information_from_scores(scores.view(), cross_section, luminosity, labels.to_vec()))
        .collect::<Result<Vec<_>, _>>()?;
    let spread = aggregate_labelled_ensemble(&members)?;

    let result = match mode {
        EnsembleMode::Information => spread,
        EnsembleMode::MeanScore => {
            let mean_scores = aggregate_scores(&predictions)?.mean;
            let mean =
                information_from_scores(mean_scores.view(), cross_section, luminosity, labels.to_vec())?
                    .into_matrix();
            EnsembleResult {
                mean,
                covariance: spread.covariance,
            }
        }
    };
    log::info!(
        "Computed ensemble Fisher information from {} estimators on {} events ({:?} mode).",
        estimators.len(),
        observables.nrows(),
        mode
    );
    Ok(result)
}

fn predict<E: ScoreEstimator>(
    member: usize,
    estimator: &E,
    observables: ArrayView2<f64>,
    theta: ArrayView1<f64>,
    n_parameters: usize,
) -> Result<Array2<f64>, SensitivityError> {
    if estimator.n_parameters() != n_parameters {
        return Err(InputMismatchError::ScoreDimension {
            member,
            expected: n_parameters,
            found: estimator.n_parameters(),
        }
        .into());
    }
    let input: CowArray<f64, Ix2> = match estimator.features() {
        Some(features) => {
            if let Some(&feature) = features.iter().find(|&&f| f >= observables.ncols()) {
                return Err(InputMismatchError::FeatureOutOfRange {
                    member,
                    feature,
                    n_features: observables.ncols(),
                }
                .into());
            }
            CowArray::from(observables.select(Axis(1), features))
        }
        None => CowArray::from(observables),
    };

    let scores = estimator.evaluate_score(theta, input.view())?;
    if scores.nrows() != observables.nrows() {
        return Err(InputMismatchError::EventCountMismatch {
            expected: observables.nrows(),
            found: scores.nrows(),
        }
        .into());
    }
    if scores.ncols() != n_parameters {
        return Err(InputMismatchError::ScoreDimension {
            member,
            expected: n_parameters,
            found: scores.ncols(),
        }
        .into());
    }
    Ok(scores)
}
