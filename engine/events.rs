//! Weighted event samples and the sources that load them.
//!
//! An event carries a vector of observables and, for every benchmark of the
//! morphing basis, the weight it would have in a sample generated at that
//! benchmark. Morphing turns those per-benchmark weights into the weight at
//! any parameter point.

use crate::config::AnalysisConfig;
use crate::error::{ConfigurationError, InputMismatchError, SensitivityError};
use ndarray::{Array2, ArrayView1};
use std::path::PathBuf;

/// Prefix of the columns that hold per-benchmark weights in an event file.
pub const WEIGHT_COLUMN_PREFIX: &str = "weight_";

#[derive(Debug, Clone)]
pub struct WeightedEvents {
    /// Shape `(n_events, n_observables)`.
    pub observables: Array2<f64>,
    /// Shape `(n_events, n_benchmarks)`, columns in benchmark order.
    pub benchmark_weights: Array2<f64>,
    pub observable_names: Vec<String>,
}

impl WeightedEvents {
    pub fn new(
        observables: Array2<f64>,
        benchmark_weights: Array2<f64>,
        observable_names: Vec<String>,
    ) -> Result<Self, InputMismatchError> {
        let events = Self {
            observables,
            benchmark_weights,
            observable_names,
        };
        events.validate()?;
        Ok(events)
    }

    pub fn n_events(&self) -> usize {
        self.observables.nrows()
    }

    pub fn validate(&self) -> Result<(), InputMismatchError> {
        if self.observables.nrows() == 0 {
            return Err(InputMismatchError::NoEvents);
        }
        if self.benchmark_weights.nrows() != self.observables.nrows() {
            return Err(InputMismatchError::EventCountMismatch {
                expected: self.observables.nrows(),
                found: self.benchmark_weights.nrows(),
            });
        }
        if self.observable_names.len() != self.observables.ncols() {
            return Err(InputMismatchError::VectorLength {
                expected: self.observables.ncols(),
                found: self.observable_names.len(),
            });
        }
        if let Some(event) = self
            .observables
            .rows()
            .into_iter()
            .position(|row| row.iter().any(|v| !v.is_finite()))
        {
            return Err(InputMismatchError::NonFiniteObservable { event });
        }
        Ok(())
    }

    /// Column of the named observable.
    pub fn observable(&self, name: &str) -> Result<ArrayView1<'_, f64>, ConfigurationError> {
        self.observable_names
            .iter()
            .position(|n| n == name)
            .map(|index| self.observables.column(index))
            .ok_or_else(|| ConfigurationError::InvalidOptions(format!("unknown observable '{name}'")))
    }
}

/// Anything that can produce weighted events for a frozen configuration.
pub trait EventSource {
    fn load_events(&self, config: &AnalysisConfig) -> Result<WeightedEvents, SensitivityError>;
}

/// Reads events from a CSV file with a header row.
///
/// Every column named `weight_<benchmark>` holds the weights for that
/// benchmark; each benchmark of the configuration needs exactly one such
/// column, and a weight column naming an unknown benchmark is an error. All
/// remaining columns are observables.
#[derive(Debug, Clone)]
pub struct CsvEventSource {
    pub path: PathBuf,
}

impl CsvEventSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl EventSource for CsvEventSource {
    fn load_events(&self, config: &AnalysisConfig) -> Result<WeightedEvents, SensitivityError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(ConfigurationError::from)?;
        let headers = reader.headers().map_err(ConfigurationError::from)?.clone();

        let mut weight_columns = Vec::with_capacity(config.benchmarks().len());
        for benchmark in config.benchmarks() {
            let column = format!("{WEIGHT_COLUMN_PREFIX}{}", benchmark.name);
            let index = headers.iter().position(|h| h == column).ok_or_else(|| {
                ConfigurationError::InvalidOptions(format!(
                    "event file {} has no column '{column}'",
                    self.path.display()
                ))
            })?;
            weight_columns.push(index);
        }
        if let Some(stray) = headers.iter().enumerate().find_map(|(i, h)| {
            (h.starts_with(WEIGHT_COLUMN_PREFIX) && !weight_columns.contains(&i)).then_some(h)
        }) {
            return Err(ConfigurationError::InvalidOptions(format!(
                "event file {} has weight column '{stray}' for a benchmark that is not in the configuration",
                self.path.display()
            ))
            .into());
        }
        let observable_columns: Vec<usize> = (0..headers.len())
            .filter(|i| !headers[*i].starts_with(WEIGHT_COLUMN_PREFIX))
            .collect();
        let observable_names = observable_columns
            .iter()
            .map(|&i| headers[i].to_string())
            .collect();

        let mut observables = Vec::new();
        let mut weights = Vec::new();
        let mut n_events = 0;
        for record in reader.records() {
            let record = record.map_err(ConfigurationError::from)?;
            let line = record.position().map_or(0, |p| p.line());
            let parse = |index: usize| -> Result<f64, ConfigurationError> {
                let value = record.get(index).unwrap_or("");
                value
                    .parse::<f64>()
                    .map_err(|_| ConfigurationError::InvalidEventRecord {
                        line,
                        column: headers[index].to_string(),
                        value: value.to_string(),
                    })
            };
            for &index in &observable_columns {
                observables.push(parse(index)?);
            }
            for &index in &weight_columns {
                weights.push(parse(index)?);
            }
            n_events += 1;
        }

        let observables = Array2::from_shape_vec((n_events, observable_columns.len()), observables)
            .map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))?;
        let benchmark_weights = Array2::from_shape_vec((n_events, weight_columns.len()), weights)
            .map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))?;
        log::info!(
            "Loaded {} events with {} observables from {}.",
            n_events,
            observable_columns.len(),
            self.path.display()
        );
        Ok(WeightedEvents::new(
            observables,
            benchmark_weights,
            observable_names,
        )?)
    }
}
