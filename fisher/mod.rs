pub mod ensemble;
pub mod estimator;
pub mod information;
pub mod projection;

pub use ensemble::{
    EnsembleResult, ScoreAggregate, SensitivityReport, aggregate_ensemble,
    aggregate_labelled_ensemble, aggregate_scores,
};
pub use estimator::{EnsembleMode, ScoreEstimator, ensemble_information};
pub use information::{
    Binning, FisherAccumulator, FisherInformation, InformationInput, accumulate_fisher_information,
};
pub use projection::{profile_information, project_information};
