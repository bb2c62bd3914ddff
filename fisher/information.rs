//! Fisher information from morphed event weights or from per-event scores.
//!
//! Every mode reduces to a sum of outer products `v v^T` with a per-term
//! factor, scaled by the integrated luminosity at the end:
//!
//! - truth level: `sum_e grad w_e grad w_e^T / w_e` over events,
//! - rate only: `grad sigma grad sigma^T / sigma` for the total rate,
//! - histogram: the rate formula applied to every bin of an observable,
//! - scores: `sigma * mean_e(t_e t_e^T)` for unweighted events sampled at theta.

use crate::error::{
    ConfigurationError, InputMismatchError, NumericalDegeneracyError, SensitivityError,
};
use crate::fisher::projection::{profile_information, project_information};
use crate::morphing::Morpher;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};

/// Relative tolerance for the symmetry and positive semi-definiteness checks.
pub const RELATIVE_TOLERANCE: f64 = 1e-9;

/// A validated Fisher information matrix with its parameter labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FisherInformation {
    matrix: Array2<f64>,
    labels: Vec<String>,
}

impl FisherInformation {
    /// Checks that `matrix` is square, symmetric and positive semi-definite,
    /// then removes the rounding asymmetry.
    pub fn new(matrix: Array2<f64>, labels: Vec<String>) -> Result<Self, SensitivityError> {
        let matrix = checked_symmetric(matrix.view())?;
        if labels.len() != matrix.nrows() {
            return Err(InputMismatchError::VectorLength {
                expected: matrix.nrows(),
                found: labels.len(),
            }
            .into());
        }
        Ok(Self { matrix, labels })
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_parameters(&self) -> usize {
        self.labels.len()
    }

    /// Positions of the named parameters, in the order given.
    pub fn indices_of(&self, names: &[String]) -> Result<Vec<usize>, ConfigurationError> {
        names
            .iter()
            .map(|name| {
                self.labels
                    .iter()
                    .position(|l| l == name)
                    .ok_or_else(|| ConfigurationError::UnknownParameter(name.clone()))
            })
            .collect()
    }

    /// Information on `subset` with the other parameters held fixed.
    pub fn project(&self, subset: &[usize]) -> Result<Self, SensitivityError> {
        let matrix = project_information(self.matrix.view(), subset)?;
        Ok(Self {
            matrix,
            labels: self.subset_labels(subset),
        })
    }

    /// Information on `subset` with the other parameters treated as nuisances.
    pub fn profile(&self, subset: &[usize]) -> Result<Self, SensitivityError> {
        let matrix = profile_information(self.matrix.view(), subset)?;
        Self::new(matrix, self.subset_labels(subset))
    }

    fn subset_labels(&self, subset: &[usize]) -> Vec<String> {
        subset.iter().map(|&i| self.labels[i].clone()).collect()
    }
}

/// Rejects a matrix that is not a finite, square, symmetric, positive
/// semi-definite information matrix and returns its symmetrized copy.
pub(crate) fn checked_symmetric(matrix: ArrayView2<f64>) -> Result<Array2<f64>, SensitivityError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(InputMismatchError::NotSquare { shape: (rows, cols) }.into());
    }
    if let Some(((row, col), _)) = matrix.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(NumericalDegeneracyError::NonFiniteInformation { row, col }.into());
    }

    let scale = matrix.iter().fold(0.0_f64, |max, &v| max.max(v.abs()));
    let max_asymmetry = (&matrix - &matrix.t())
        .iter()
        .fold(0.0_f64, |max, &v| max.max(v.abs()));
    if max_asymmetry > RELATIVE_TOLERANCE * scale {
        return Err(NumericalDegeneracyError::NotSymmetric { max_asymmetry }.into());
    }
    let symmetric = (&matrix + &matrix.t()) * 0.5;
    if rows == 0 {
        return Ok(symmetric);
    }

    let (eigenvalues, _) = symmetric.eigh(UPLO::Lower)?;
    let max_abs = eigenvalues.iter().fold(0.0_f64, |max, &v| max.max(v.abs()));
    let min_eigenvalue = eigenvalues.iter().fold(f64::INFINITY, |min, &v| min.min(v));
    if min_eigenvalue < -RELATIVE_TOLERANCE * max_abs {
        return Err(NumericalDegeneracyError::NotPositiveSemiDefinite { min_eigenvalue }.into());
    }
    Ok(symmetric)
}

/// Running sum of weighted outer products.
#[derive(Debug, Clone)]
pub struct FisherAccumulator {
    sum: Array2<f64>,
    n_terms: usize,
    skipped: usize,
}

impl FisherAccumulator {
    pub fn new(n_parameters: usize) -> Self {
        Self {
            sum: Array2::zeros((n_parameters, n_parameters)),
            n_terms: 0,
            skipped: 0,
        }
    }

    pub fn n_parameters(&self) -> usize {
        self.sum.nrows()
    }

    /// Number of terms added so far, skipped ones excluded.
    pub fn n_terms(&self) -> usize {
        self.n_terms
    }

    /// Number of weight gradients skipped because their weight was not positive.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Adds `probability_weight * score score^T`.
    pub fn add_score(
        &mut self,
        probability_weight: f64,
        score: ArrayView1<f64>,
    ) -> Result<(), InputMismatchError> {
        self.check_length(score)?;
        self.push(probability_weight, score);
        Ok(())
    }

    /// Adds `gradient gradient^T / weight`, or skips the term when `weight <= 0`.
    pub fn add_weight_gradient(
        &mut self,
        weight: f64,
        gradient: ArrayView1<f64>,
    ) -> Result<(), InputMismatchError> {
        self.check_length(gradient)?;
        self.push_gradient(weight, gradient);
        Ok(())
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.sum += &other.sum;
        self.n_terms += other.n_terms;
        self.skipped += other.skipped;
        self
    }

    /// Scales the sum by the luminosity and validates the result.
    pub fn finish(
        self,
        luminosity: f64,
        labels: Vec<String>,
    ) -> Result<FisherInformation, SensitivityError> {
        check_luminosity(luminosity)?;
        if self.skipped > 0 {
            log::warn!(
                "Skipped {} of {} terms with non-positive weight while accumulating Fisher information.",
                self.skipped,
                self.skipped + self.n_terms
            );
        }
        FisherInformation::new(self.sum * luminosity, labels)
    }

    fn check_length(&self, vector: ArrayView1<f64>) -> Result<(), InputMismatchError> {
        if vector.len() != self.n_parameters() {
            return Err(InputMismatchError::VectorLength {
                expected: self.n_parameters(),
                found: vector.len(),
            });
        }
        Ok(())
    }

    fn push_gradient(&mut self, weight: f64, gradient: ArrayView1<f64>) {
        if weight > 0.0 {
            self.push(1.0 / weight, gradient);
        } else {
            self.skipped += 1;
        }
    }

    fn push(&mut self, factor: f64, vector: ArrayView1<f64>) {
        let n = self.n_parameters();
        for i in 0..n {
            let scaled = factor * vector[i];
            for j in 0..n {
                self.sum[[i, j]] += scaled * vector[j];
            }
        }
        self.n_terms += 1;
    }
}

/// Bin edges of an observable. Values below the first edge land in an
/// underflow bin and values at or above the last edge in an overflow bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    edges: Vec<f64>,
}

impl Binning {
    pub fn new(edges: Vec<f64>) -> Result<Self, ConfigurationError> {
        if edges.len() < 2 {
            return Err(ConfigurationError::InvalidBinning(format!(
                "at least two edges are needed, got {}",
                edges.len()
            )));
        }
        if let Some(bad) = edges.iter().find(|e| !e.is_finite()) {
            return Err(ConfigurationError::InvalidBinning(format!(
                "edge {bad} is not finite"
            )));
        }
        if let Some(pair) = edges.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(ConfigurationError::InvalidBinning(format!(
                "edges must be strictly increasing, but {} is followed by {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self { edges })
    }

    /// `n_bins` equal-width bins covering `[lo, hi)`.
    pub fn uniform(lo: f64, hi: f64, n_bins: usize) -> Result<Self, ConfigurationError> {
        if n_bins == 0 {
            return Err(ConfigurationError::InvalidBinning(
                "at least one bin is needed".to_string(),
            ));
        }
        let width = (hi - lo) / n_bins as f64;
        Self::new((0..=n_bins).map(|i| lo + width * i as f64).collect())
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of bins including underflow and overflow.
    pub fn n_bins(&self) -> usize {
        self.edges.len() + 1
    }

    pub fn bin_index(&self, value: f64) -> usize {
        self.edges.partition_point(|&edge| edge <= value)
    }
}

/// What the information is computed from.
#[derive(Debug, Clone, Copy)]
pub enum InformationInput<'a> {
    /// Kinematic and rate information of weighted events
    /// (`n_events x n_benchmarks` benchmark weights).
    Truth { benchmark_weights: ArrayView2<'a, f64> },
    /// Information in the total rate only.
    Rate { benchmark_weights: ArrayView2<'a, f64> },
    /// Information in a histogram of one observable.
    Histogram {
        benchmark_weights: ArrayView2<'a, f64>,
        observable: ArrayView1<'a, f64>,
        binning: &'a Binning,
    },
    /// Estimated scores (`n_events x n_parameters`) of unweighted events
    /// sampled at theta, whose total cross section is `cross_section`.
    Scores {
        scores: ArrayView2<'a, f64>,
        cross_section: f64,
    },
}

/// Fisher information at `theta` for an integrated luminosity `luminosity`.
pub fn accumulate_fisher_information(
    morpher: &Morpher,
    input: InformationInput<'_>,
    theta: ArrayView1<f64>,
    luminosity: f64,
) -> Result<FisherInformation, SensitivityError> {
    check_luminosity(luminosity)?;
    let n_parameters = morpher.n_parameters();
    let labels = morpher.labels();

    let accumulator = match input {
        InformationInput::Truth { benchmark_weights } => {
            let (weights, gradients) = event_terms(morpher, theta, benchmark_weights)?;
            gradients
                .axis_iter(Axis(0))
                .into_par_iter()
                .enumerate()
                .fold(
                    || FisherAccumulator::new(n_parameters),
                    |mut acc, (event, gradient)| {
                        acc.push_gradient(weights[event], gradient);
                        acc
                    },
                )
                .reduce(|| FisherAccumulator::new(n_parameters), FisherAccumulator::merge)
        }
        InformationInput::Rate { benchmark_weights } => {
            let (weights, gradients) = event_terms(morpher, theta, benchmark_weights)?;
            let mut acc = FisherAccumulator::new(n_parameters);
            acc.push_gradient(weights.sum(), gradients.sum_axis(Axis(0)).view());
            acc
        }
        InformationInput::Histogram {
            benchmark_weights,
            observable,
            binning,
        } => {
            if observable.len() != benchmark_weights.nrows() {
                return Err(InputMismatchError::EventCountMismatch {
                    expected: benchmark_weights.nrows(),
                    found: observable.len(),
                }
                .into());
            }
            if let Some(event) = observable.iter().position(|v| !v.is_finite()) {
                return Err(InputMismatchError::NonFiniteObservable { event }.into());
            }
            let (weights, gradients) = event_terms(morpher, theta, benchmark_weights)?;
            histogram_terms(binning, observable, weights.view(), gradients.view())
        }
        InformationInput::Scores {
            scores,
            cross_section,
        } => {
            morpher.parameters().check_point(theta)?;
            return information_from_scores(scores, cross_section, luminosity, labels);
        }
    };

    log::info!(
        "Accumulated Fisher information from {} terms at luminosity {}.",
        accumulator.n_terms(),
        luminosity
    );
    accumulator.finish(luminosity, labels)
}

/// `L sigma mean_e(t_e t_e^T)` for scores of unweighted events.
pub(crate) fn information_from_scores(
    scores: ArrayView2<f64>,
    cross_section: f64,
    luminosity: f64,
    labels: Vec<String>,
) -> Result<FisherInformation, SensitivityError> {
    check_luminosity(luminosity)?;
    if !(cross_section.is_finite() && cross_section >= 0.0) {
        return Err(ConfigurationError::InvalidCrossSection(cross_section).into());
    }
    let n_parameters = labels.len();
    if scores.ncols() != n_parameters {
        return Err(InputMismatchError::VectorLength {
            expected: n_parameters,
            found: scores.ncols(),
        }
        .into());
    }
    let n_events = scores.nrows();
    if n_events == 0 {
        return Err(InputMismatchError::NoEvents.into());
    }

    let probability = 1.0 / n_events as f64;
    let accumulator = scores
        .axis_iter(Axis(0))
        .into_par_iter()
        .fold(
            || FisherAccumulator::new(n_parameters),
            |mut acc, score| {
                acc.push(probability, score);
                acc
            },
        )
        .reduce(|| FisherAccumulator::new(n_parameters), FisherAccumulator::merge);
    accumulator.finish(luminosity * cross_section, labels)
}

fn check_luminosity(luminosity: f64) -> Result<(), ConfigurationError> {
    if luminosity.is_finite() && luminosity >= 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidLuminosity(luminosity))
    }
}

/// Morphed event weights and their gradients (`n_events x n_parameters`).
fn event_terms(
    morpher: &Morpher,
    theta: ArrayView1<f64>,
    benchmark_weights: ArrayView2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), SensitivityError> {
    if benchmark_weights.nrows() == 0 {
        return Err(InputMismatchError::NoEvents.into());
    }
    let weights = morpher.morph_event_weights(theta, benchmark_weights)?;
    let gradients = morpher.event_weight_gradients(theta, benchmark_weights)?;
    Ok((weights, gradients))
}

fn histogram_terms(
    binning: &Binning,
    observable: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    gradients: ArrayView2<f64>,
) -> FisherAccumulator {
    let n_bins = binning.n_bins();
    let mut bin_counts = vec![0usize; n_bins];
    let mut bin_weights = Array1::<f64>::zeros(n_bins);
    let mut bin_gradients = Array2::<f64>::zeros((n_bins, gradients.ncols()));
    for (event, &value) in observable.iter().enumerate() {
        let bin = binning.bin_index(value);
        bin_counts[bin] += 1;
        bin_weights[bin] += weights[event];
        let mut row = bin_gradients.row_mut(bin);
        row += &gradients.row(event);
    }

    let mut acc = FisherAccumulator::new(gradients.ncols());
    for bin in (0..n_bins).filter(|&b| bin_counts[b] > 0) {
        acc.push_gradient(bin_weights[bin], bin_gradients.row(bin));
    }
    log::debug!(
        "Histogram information: {} of {} bins populated.",
        bin_counts.iter().filter(|&&c| c > 0).count(),
        n_bins
    );
    acc
}
