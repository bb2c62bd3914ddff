use crate::error::{ConfigurationError, SensitivityError};
use crate::morphing::basis::{BasisOptions, ErrorFunctional, optimize_basis};
use crate::morphing::components::{find_components, monomial_matrix};
use crate::morphing::weights::invert_morphing_matrix;
use crate::parameters::{Benchmark, BenchmarkKind, ParameterSpace};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Relative tolerance when checking a stored morphing matrix against the
/// benchmarks it was built from.
const MORPHING_MATRIX_TOLERANCE: f64 = 1e-9;

/// Options for [`AnalysisConfig::set_morphing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphingOptions {
    /// Maximal total degree of a component monomial.
    pub max_overall_power: u32,
    pub basis: BasisOptions,
}

impl Default for MorphingOptions {
    fn default() -> Self {
        Self {
            max_overall_power: 4,
            basis: BasisOptions::default(),
        }
    }
}

/// The frozen morphing state written after basis selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphingSetup {
    pub max_overall_power: u32,
    /// Exponent vectors, one row per component, one column per parameter.
    pub components: Array2<u32>,
    /// `M[i][j]`: component `j` evaluated at benchmark `i`.
    pub morphing_matrix: Array2<f64>,
    pub error_functional: ErrorFunctional,
    /// Value of the error functional for the selected basis.
    pub expected_error: f64,
}

/// The single configuration object: parameters, benchmarks and (once frozen)
/// the morphing setup. It is passed explicitly to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    parameters: ParameterSpace,
    #[serde(default)]
    benchmarks: Vec<Benchmark>,
    #[serde(default)]
    morphing: Option<MorphingSetup>,
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameters(&self) -> &ParameterSpace {
        &self.parameters
    }

    pub fn benchmarks(&self) -> &[Benchmark] {
        &self.benchmarks
    }

    pub fn benchmark(&self, name: &str) -> Option<&Benchmark> {
        self.benchmarks.iter().find(|b| b.name == name)
    }

    pub fn benchmark_index(&self, name: &str) -> Option<usize> {
        self.benchmarks.iter().position(|b| b.name == name)
    }

    pub fn morphing(&self) -> Option<&MorphingSetup> {
        self.morphing.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.morphing.is_some()
    }

    /// Human-readable parameter labels in matrix order.
    pub fn labels(&self) -> Vec<String> {
        self.parameters.names()
    }

    /// Benchmark points as rows, in benchmark order.
    pub fn benchmark_matrix(&self) -> Array2<f64> {
        let n_parameters = self.parameters.len();
        Array2::from_shape_fn((self.benchmarks.len(), n_parameters), |(i, k)| {
            self.benchmarks[i].values[k]
        })
    }

    pub fn add_parameter(
        &mut self,
        name: &str,
        index: usize,
        max_power: u32,
        range: (f64, f64),
    ) -> Result<(), SensitivityError> {
        if self.is_frozen() {
            return Err(ConfigurationError::ConfigurationFrozen.into());
        }
        if !self.benchmarks.is_empty() {
            return Err(ConfigurationError::ParametersLocked {
                benchmarks: self.benchmarks.len(),
            }
            .into());
        }
        self.parameters.add_parameter(name, index, max_power, range)?;
        Ok(())
    }

    /// Declares a user benchmark. `point` gives one value per parameter, in order.
    pub fn add_benchmark(&mut self, point: &[f64], name: &str) -> Result<&Benchmark, SensitivityError> {
        if self.is_frozen() {
            return Err(ConfigurationError::ConfigurationFrozen.into());
        }
        if self.parameters.is_empty() {
            return Err(ConfigurationError::NoParameters.into());
        }
        self.parameters.check_point(ArrayView1::from(point))?;
        self.push_benchmark(point.to_vec(), name, BenchmarkKind::User)?;
        Ok(&self.benchmarks[self.benchmarks.len() - 1])
    }

    /// Declares a user benchmark from a parameter name -> value map.
    pub fn add_benchmark_from_map(
        &mut self,
        values: &HashMap<String, f64>,
        name: &str,
    ) -> Result<&Benchmark, SensitivityError> {
        let point = self.parameters.point_from_map(values, name)?;
        self.add_benchmark(&point.to_vec(), name)
    }

    fn push_benchmark(
        &mut self,
        values: Vec<f64>,
        name: &str,
        kind: BenchmarkKind,
    ) -> Result<(), ConfigurationError> {
        if self.benchmark(name).is_some() {
            return Err(ConfigurationError::DuplicateBenchmarkName(name.to_string()));
        }
        if let Some(existing) = self.benchmarks.iter().find(|b| b.values == values) {
            return Err(ConfigurationError::DuplicateBenchmarkPoint {
                name: name.to_string(),
                existing: existing.name.clone(),
            });
        }
        self.benchmarks.push(Benchmark {
            name: name.to_string(),
            kind,
            values,
        });
        Ok(())
    }

    /// Chooses the morphing basis and freezes the configuration.
    ///
    /// All declared user benchmarks are kept fixed; the remaining slots are
    /// filled by [`optimize_basis`]. Returns the complete benchmark set.
    pub fn set_morphing(&mut self, options: &MorphingOptions) -> Result<&[Benchmark], SensitivityError> {
        if self.is_frozen() {
            return Err(ConfigurationError::ConfigurationFrozen.into());
        }
        if self.parameters.is_empty() {
            return Err(ConfigurationError::NoParameters.into());
        }

        let components = find_components(&self.parameters.max_powers(), options.max_overall_power)?;
        let fixed = self.benchmark_matrix();
        log::info!(
            "Setting up morphing with {} components, {} fixed benchmarks and {} trials.",
            components.nrows(),
            fixed.nrows(),
            options.basis.n_trials
        );

        let solution = optimize_basis(&self.parameters, components.view(), fixed.view(), &options.basis)?;

        for row in solution.basis.rows().into_iter().skip(fixed.nrows()) {
            let name = self.generated_name();
            self.push_benchmark(row.to_vec(), &name, BenchmarkKind::Generated)?;
        }

        self.morphing = Some(MorphingSetup {
            max_overall_power: options.max_overall_power,
            components,
            morphing_matrix: solution.morphing_matrix,
            error_functional: options.basis.functional,
            expected_error: solution.expected_error,
        });
        Ok(&self.benchmarks)
    }

    /// Freezes the configuration using the declared benchmarks as the complete
    /// basis, without optimization.
    pub fn set_morphing_basis(&mut self, max_overall_power: u32) -> Result<&[Benchmark], SensitivityError> {
        if self.is_frozen() {
            return Err(ConfigurationError::ConfigurationFrozen.into());
        }
        if self.parameters.is_empty() {
            return Err(ConfigurationError::NoParameters.into());
        }
        let components = find_components(&self.parameters.max_powers(), max_overall_power)?;
        check_basis_size(components.nrows(), self.benchmarks.len())?;

        let basis = self.benchmark_matrix();
        let morphing_matrix = monomial_matrix(components.view(), basis.view());
        invert_morphing_matrix(&morphing_matrix)?;

        // A complete fixed basis leaves no free slots, so this scores it once.
        let scoring = BasisOptions::default();
        let solution = optimize_basis(&self.parameters, components.view(), basis.view(), &scoring)?;

        self.morphing = Some(MorphingSetup {
            max_overall_power,
            components,
            morphing_matrix,
            error_functional: scoring.functional,
            expected_error: solution.expected_error,
        });
        Ok(&self.benchmarks)
    }

    fn generated_name(&self) -> String {
        (0..)
            .map(|k| format!("morphing_basis_vector_{k}"))
            .find(|name| self.benchmark(name).is_none())
            .unwrap_or_default()
    }

    /// Saves the configuration to a file in a human-readable TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SensitivityError> {
        let toml_string = toml::to_string_pretty(self).map_err(ConfigurationError::from)?;
        let mut file = BufWriter::new(fs::File::create(path).map_err(ConfigurationError::from)?);
        file.write_all(toml_string.as_bytes())
            .map_err(ConfigurationError::from)?;
        file.flush().map_err(ConfigurationError::from)?;
        Ok(())
    }

    /// Loads a configuration from a TOML file and checks its internal consistency.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SensitivityError> {
        let toml_string = fs::read_to_string(path).map_err(ConfigurationError::from)?;
        let config: AnalysisConfig = toml::from_str(&toml_string).map_err(ConfigurationError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Replays every registration check on a deserialized configuration and
    /// checks the stored morphing setup against the benchmarks.
    fn validate(&self) -> Result<(), SensitivityError> {
        let mut replay = AnalysisConfig::new();
        for (position, parameter) in self.parameters.parameters().iter().enumerate() {
            if parameter.index != position {
                return Err(ConfigurationError::CorruptConfiguration(format!(
                    "parameter '{}' is stored at position {position} but claims index {}",
                    parameter.name, parameter.index
                ))
                .into());
            }
            replay.parameters.add_parameter(
                &parameter.name,
                parameter.index,
                parameter.max_power,
                parameter.range,
            )?;
        }
        for benchmark in &self.benchmarks {
            if benchmark.values.len() != self.parameters.len() {
                return Err(ConfigurationError::CorruptConfiguration(format!(
                    "benchmark '{}' has {} values for {} parameters",
                    benchmark.name,
                    benchmark.values.len(),
                    self.parameters.len()
                ))
                .into());
            }
            replay.parameters.check_point(benchmark.point())?;
            replay.push_benchmark(benchmark.values.clone(), &benchmark.name, benchmark.kind)?;
        }

        let Some(setup) = &self.morphing else {
            return Ok(());
        };
        let n = self.benchmarks.len();
        if setup.components.ncols() != self.parameters.len() {
            return Err(ConfigurationError::CorruptConfiguration(format!(
                "components have {} exponents for {} parameters",
                setup.components.ncols(),
                self.parameters.len()
            ))
            .into());
        }
        if setup.components.nrows() != n || setup.morphing_matrix.dim() != (n, n) {
            return Err(ConfigurationError::CorruptConfiguration(format!(
                "{} components and a {:?} morphing matrix do not match {n} benchmarks",
                setup.components.nrows(),
                setup.morphing_matrix.dim()
            ))
            .into());
        }
        let expected = find_components(&self.parameters.max_powers(), setup.max_overall_power)?;
        if expected != setup.components {
            return Err(ConfigurationError::CorruptConfiguration(format!(
                "stored components differ from those of max overall power {}",
                setup.max_overall_power
            ))
            .into());
        }
        let recomputed = monomial_matrix(setup.components.view(), self.benchmark_matrix().view());
        if let Some(((row, col), stored)) = setup
            .morphing_matrix
            .indexed_iter()
            .find(|((i, j), v)| {
                let exact = recomputed[[*i, *j]];
                !((*v - exact).abs() <= MORPHING_MATRIX_TOLERANCE * exact.abs().max(1.0))
            })
        {
            return Err(ConfigurationError::CorruptConfiguration(format!(
                "stored morphing matrix entry ({row}, {col}) is {stored}, but the benchmarks give {}",
                recomputed[[row, col]]
            ))
            .into());
        }
        Ok(())
    }
}

pub(crate) fn check_basis_size(components: usize, benchmarks: usize) -> Result<(), ConfigurationError> {
    if benchmarks < components {
        Err(ConfigurationError::UnderdeterminedBasis {
            components,
            benchmarks,
        })
    } else if benchmarks > components {
        Err(ConfigurationError::OverdeterminedBasis {
            components,
            benchmarks,
        })
    } else {
        Ok(())
    }
}
