use thiserror::Error;

/// Misdeclared parameters, benchmarks, options or configuration files.
/// These abort the call; nothing downstream can recover from them.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Parameter '{0}' is already registered.")]
    DuplicateParameter(String),

    #[error("Parameter '{name}' was declared at index {index}, but the next free index is {expected}.")]
    ParameterIndexOutOfOrder {
        name: String,
        index: usize,
        expected: usize,
    },

    #[error("Parameter '{name}' has an invalid range [{lo}, {hi}]: bounds must be finite with lo < hi.")]
    InvalidRange { name: String, lo: f64, hi: f64 },

    #[error("Parameter '{name}' must be allowed to appear with a maximal power of at least 1.")]
    InvalidMaxPower { name: String },

    #[error("No parameters are registered.")]
    NoParameters,

    #[error("Parameters cannot be added once {benchmarks} benchmark(s) have been declared.")]
    ParametersLocked { benchmarks: usize },

    #[error("Expected a value for each of the {expected} parameters, but got {found}.")]
    ParameterCountMismatch { expected: usize, found: usize },

    #[error("Parameter value at index {index} is not finite ({value}).")]
    NonFiniteValue { index: usize, value: f64 },

    #[error("A benchmark named '{0}' already exists.")]
    DuplicateBenchmarkName(String),

    #[error("Benchmark '{name}' sits at the same parameter point as benchmark '{existing}'.")]
    DuplicateBenchmarkPoint { name: String, existing: String },

    #[error("Unknown benchmark '{0}'.")]
    UnknownBenchmark(String),

    #[error("Unknown parameter '{0}'.")]
    UnknownParameter(String),

    #[error("Benchmark '{benchmark}' does not specify a value for parameter '{parameter}'.")]
    MissingParameterValue { benchmark: String, parameter: String },

    #[error(
        "The morphing basis is under-determined: {components} components need {components} benchmarks, but only {benchmarks} were supplied."
    )]
    UnderdeterminedBasis { components: usize, benchmarks: usize },

    #[error(
        "The morphing basis is over-determined: {components} components admit exactly {components} benchmarks, but {benchmarks} were supplied."
    )]
    OverdeterminedBasis { components: usize, benchmarks: usize },

    #[error("None of the {n_trials} candidate bases produced an invertible morphing matrix.")]
    NoInvertibleBasis { n_trials: usize },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Morphing has not been set up for this configuration.")]
    MorphingNotConfigured,

    #[error("The configuration is frozen after morphing setup and cannot be extended.")]
    ConfigurationFrozen,

    #[error("Invalid parameter subset: {0}")]
    InvalidParameterSubset(String),

    #[error("Luminosity must be finite and non-negative, got {0}.")]
    InvalidLuminosity(f64),

    #[error("Cross section must be finite and non-negative, got {0}.")]
    InvalidCrossSection(f64),

    #[error("Invalid binning: {0}")]
    InvalidBinning(String),

    #[error("Invalid prior for parameter {index}: {reason}")]
    InvalidPrior { index: usize, reason: String },

    #[error("Stored configuration is inconsistent: {0}")]
    CorruptConfiguration(String),

    #[error("Could not parse value '{value}' in column '{column}' on line {line} of the event file.")]
    InvalidEventRecord {
        line: u64,
        column: String,
        value: String,
    },

    #[error("Failed to read or write configuration or event file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Failed to read event CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Numerical failures: singular matrices and information matrices that are
/// not symmetric positive semi-definite.
#[derive(Error, Debug)]
pub enum NumericalDegeneracyError {
    #[error(
        "The morphing matrix is singular (reciprocal condition number {rcond:.3e}); benchmarks are degenerate."
    )]
    SingularMorphingMatrix { rcond: f64 },

    #[error(
        "The nuisance block cannot be inverted for profiling (smallest eigenvalue {min_eigenvalue:.3e})."
    )]
    SingularNuisanceBlock { min_eigenvalue: f64 },

    #[error("Information matrix has a non-finite entry at ({row}, {col}).")]
    NonFiniteInformation { row: usize, col: usize },

    #[error("Information matrix is not symmetric (largest asymmetry {max_asymmetry:.3e}).")]
    NotSymmetric { max_asymmetry: f64 },

    #[error(
        "Information matrix is not positive semi-definite (smallest eigenvalue {min_eigenvalue:.3e})."
    )]
    NotPositiveSemiDefinite { min_eigenvalue: f64 },

    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// Inputs whose shapes disagree with each other or with the configuration.
#[derive(Error, Debug)]
pub enum InputMismatchError {
    #[error("The ensemble has no members.")]
    EmptyEnsemble,

    #[error("Ensemble member {member} has shape {found:?}, but member 0 has shape {expected:?}.")]
    ShapeMismatch {
        member: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Ensemble member {member} orders its parameters as {found:?}, expected {expected:?}.")]
    LabelMismatch {
        member: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Ensemble member {member} is not a square matrix (shape {shape:?}).")]
    MemberNotSquare { member: usize, shape: (usize, usize) },

    #[error("Information matrix is not square (shape {shape:?}).")]
    NotSquare { shape: (usize, usize) },

    #[error("Estimator {member} returned scores for {found} parameters, expected {expected}.")]
    ScoreDimension {
        member: usize,
        expected: usize,
        found: usize,
    },

    #[error("Estimator {member} uses feature {feature}, but only {n_features} observables exist.")]
    FeatureOutOfRange {
        member: usize,
        feature: usize,
        n_features: usize,
    },

    #[error("Vector has length {found}, expected {expected}.")]
    VectorLength { expected: usize, found: usize },

    #[error("Expected {expected} events, found {found}.")]
    EventCountMismatch { expected: usize, found: usize },

    #[error("Event weights are given for {found} benchmarks, but the morphing basis has {expected}.")]
    BenchmarkCountMismatch { expected: usize, found: usize },

    #[error("No events were supplied.")]
    NoEvents,

    #[error("Observable value of event {event} is not finite.")]
    NonFiniteObservable { event: usize },

    #[error("Covariance tensor has shape {found:?}, expected {expected:?}.")]
    CovarianceShape {
        expected: [usize; 4],
        found: [usize; 4],
    },
}

/// The category an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NumericalDegeneracy,
    InputMismatch,
}

/// Crate-level error returned by every public operation.
#[derive(Error, Debug)]
pub enum SensitivityError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(#[from] NumericalDegeneracyError),

    #[error("Input mismatch: {0}")]
    InputMismatch(#[from] InputMismatchError),
}

impl SensitivityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SensitivityError::Configuration(_) => ErrorKind::Configuration,
            SensitivityError::NumericalDegeneracy(_) => ErrorKind::NumericalDegeneracy,
            SensitivityError::InputMismatch(_) => ErrorKind::InputMismatch,
        }
    }
}

impl From<ndarray_linalg::error::LinalgError> for SensitivityError {
    fn from(err: ndarray_linalg::error::LinalgError) -> Self {
        SensitivityError::NumericalDegeneracy(NumericalDegeneracyError::Linalg(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_category() {
        let config: SensitivityError = ConfigurationError::NoParameters.into();
        assert_eq!(config.kind(), ErrorKind::Configuration);

        let degenerate: SensitivityError =
            NumericalDegeneracyError::SingularMorphingMatrix { rcond: 0.0 }.into();
        assert_eq!(degenerate.kind(), ErrorKind::NumericalDegeneracy);

        let mismatch: SensitivityError = InputMismatchError::EmptyEnsemble.into();
        assert_eq!(mismatch.kind(), ErrorKind::InputMismatch);
    }

    #[test]
    fn test_messages_name_the_offending_index() {
        let err = InputMismatchError::ShapeMismatch {
            member: 3,
            expected: (2, 2),
            found: (3, 3),
        };
        let message = err.to_string();
        assert!(message.contains("member 3"), "unexpected message: {message}");
        assert!(message.contains("(3, 3)"));
    }
}
