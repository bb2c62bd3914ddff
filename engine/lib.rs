#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod config;
pub mod error;
pub mod events;
pub mod parameters;
pub mod theta;

#[path = "../morphing/mod.rs"]
pub mod morphing;

#[path = "../fisher/mod.rs"]
pub mod fisher;

pub use config::{AnalysisConfig, MorphingOptions, MorphingSetup};
pub use error::{
    ConfigurationError, ErrorKind, InputMismatchError, NumericalDegeneracyError, SensitivityError,
};
pub use events::{CsvEventSource, EventSource, WeightedEvents};
pub use fisher::{
    EnsembleResult, FisherInformation, InformationInput, ScoreEstimator, SensitivityReport,
    accumulate_fisher_information, aggregate_ensemble, aggregate_labelled_ensemble,
    profile_information, project_information,
};
pub use morphing::{BasisOptions, ErrorFunctional, Morpher};
pub use parameters::{Benchmark, BenchmarkKind, Parameter, ParameterSpace};
pub use theta::{Prior, ThetaSpec};
