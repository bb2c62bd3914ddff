use crate::error::ConfigurationError;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A theory parameter that the morphing polynomial depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Position in the global parameter ordering. Every matrix index in the
    /// crate refers to this ordering.
    pub index: usize,
    /// Maximal power with which the parameter appears in the squared amplitude.
    pub max_power: u32,
    /// Declared range `(lo, hi)`. Benchmarks and test points are drawn from it.
    pub range: (f64, f64),
}

impl Parameter {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.range.0 && value <= self.range.1
    }
}

/// The ordered registry of parameters.
///
/// The order is fixed at registration time: a parameter must be registered with
/// the index it will occupy, and that index must be the next free slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    parameters: Vec<Parameter>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter at `index` with the given maximal power and range.
    pub fn add_parameter(
        &mut self,
        name: &str,
        index: usize,
        max_power: u32,
        range: (f64, f64),
    ) -> Result<&Parameter, ConfigurationError> {
        if self.index_of(name).is_some() {
            return Err(ConfigurationError::DuplicateParameter(name.to_string()));
        }
        if index != self.parameters.len() {
            return Err(ConfigurationError::ParameterIndexOutOfOrder {
                name: name.to_string(),
                index,
                expected: self.parameters.len(),
            });
        }
        let (lo, hi) = range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(ConfigurationError::InvalidRange {
                name: name.to_string(),
                lo,
                hi,
            });
        }
        if max_power == 0 {
            return Err(ConfigurationError::InvalidMaxPower {
                name: name.to_string(),
            });
        }

        log::debug!("Registered parameter '{name}' at index {index} (max power {max_power}, range [{lo}, {hi}])");
        self.parameters.push(Parameter {
            name: name.to_string(),
            index,
            max_power,
            range,
        });
        Ok(&self.parameters[index])
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn max_powers(&self) -> Vec<u32> {
        self.parameters.iter().map(|p| p.max_power).collect()
    }

    /// Checks that `theta` gives a finite value for every parameter.
    pub fn check_point(&self, theta: ArrayView1<f64>) -> Result<(), ConfigurationError> {
        if theta.len() != self.parameters.len() {
            return Err(ConfigurationError::ParameterCountMismatch {
                expected: self.parameters.len(),
                found: theta.len(),
            });
        }
        if let Some((index, &value)) = theta.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigurationError::NonFiniteValue { index, value });
        }
        Ok(())
    }

    /// Indices of the parameters whose value in `theta` lies outside the declared range.
    pub fn out_of_range(&self, theta: ArrayView1<f64>) -> Vec<usize> {
        self.parameters
            .iter()
            .zip(theta.iter())
            .filter(|(p, v)| !p.contains(**v))
            .map(|(p, _)| p.index)
            .collect()
    }

    /// Builds a parameter point from a name -> value map, in registry order.
    pub fn point_from_map(
        &self,
        values: &HashMap<String, f64>,
        benchmark: &str,
    ) -> Result<Array1<f64>, ConfigurationError> {
        if let Some(unknown) = values.keys().find(|k| self.index_of(k).is_none()) {
            return Err(ConfigurationError::UnknownParameter(unknown.clone()));
        }
        let point = self
            .parameters
            .iter()
            .map(|p| {
                values.get(&p.name).copied().ok_or_else(|| {
                    ConfigurationError::MissingParameterValue {
                        benchmark: benchmark.to_string(),
                        parameter: p.name.clone(),
                    }
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        Ok(Array1::from_vec(point))
    }

    /// Draws `n` points uniformly from the declared ranges, one row per point.
    pub fn sample_uniform<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Array2<f64> {
        let mut points = Array2::zeros((n, self.parameters.len()));
        for mut row in points.rows_mut() {
            for (value, parameter) in row.iter_mut().zip(&self.parameters) {
                *value = rng.gen_range(parameter.range.0..parameter.range.1);
            }
        }
        points
    }
}

/// Where a benchmark came from. User benchmarks are never moved by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BenchmarkKind {
    User,
    Generated,
}

/// A named point in parameter space at which the simulation is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    pub kind: BenchmarkKind,
    /// One value per parameter, in registry order.
    pub values: Vec<f64>,
}

impl Benchmark {
    pub fn point(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(&self.values[..])
    }
}
