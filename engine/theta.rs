//! Declarative descriptions of where in parameter space something should be
//! evaluated. Every variant resolves to concrete points through [`ThetaSpec::resolve`].

use crate::config::AnalysisConfig;
use crate::error::{ConfigurationError, SensitivityError};
use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// A one-dimensional prior used to draw random parameter points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prior {
    Flat { lo: f64, hi: f64 },
    Gaussian { mean: f64, std: f64 },
}

impl Prior {
    fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        let reason = match *self {
            Prior::Flat { lo, hi } if !(lo.is_finite() && hi.is_finite() && lo < hi) => {
                format!("flat prior needs finite bounds with lo < hi, got [{lo}, {hi}]")
            }
            Prior::Gaussian { mean, std } if !(mean.is_finite() && std.is_finite() && std > 0.0) => {
                format!("gaussian prior needs a finite mean and positive width, got ({mean}, {std})")
            }
            _ => return Ok(()),
        };
        Err(ConfigurationError::InvalidPrior { index, reason })
    }

    fn sample<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<f64, ConfigurationError> {
        match *self {
            Prior::Flat { lo, hi } => Ok(rng.gen_range(lo..hi)),
            Prior::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std).map_err(|e| ConfigurationError::InvalidPrior {
                    index,
                    reason: e.to_string(),
                })?;
                Ok(normal.sample(rng))
            }
        }
    }
}

/// Where to evaluate: named benchmarks, explicit points, or random draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThetaSpec {
    Benchmark { name: String },
    Benchmarks { names: Vec<String> },
    Point { values: Vec<f64> },
    Points { values: Vec<Vec<f64>> },
    /// `n` points, each coordinate drawn from its own prior (one per parameter).
    Random { n: usize, priors: Vec<Prior> },
}

impl ThetaSpec {
    /// Resolves the specification into concrete parameter points, in parameter order.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        config: &AnalysisConfig,
        rng: &mut R,
    ) -> Result<Vec<Array1<f64>>, SensitivityError> {
        let parameters = config.parameters();
        let points = match self {
            ThetaSpec::Benchmark { name } => vec![benchmark_point(config, name)?],
            ThetaSpec::Benchmarks { names } => names
                .iter()
                .map(|name| benchmark_point(config, name))
                .collect::<Result<Vec<_>, _>>()?,
            ThetaSpec::Point { values } => vec![Array1::from_vec(values.clone())],
            ThetaSpec::Points { values } => values
                .iter()
                .map(|v| Array1::from_vec(v.clone()))
                .collect(),
            ThetaSpec::Random { n, priors } => {
                if priors.len() != parameters.len() {
                    return Err(ConfigurationError::ParameterCountMismatch {
                        expected: parameters.len(),
                        found: priors.len(),
                    }
                    .into());
                }
                for (index, prior) in priors.iter().enumerate() {
                    prior.validate(index)?;
                }
                let mut points = Vec::with_capacity(*n);
                for _ in 0..*n {
                    let point = priors
                        .iter()
                        .enumerate()
                        .map(|(index, prior)| prior.sample(index, rng))
                        .collect::<Result<Vec<f64>, _>>()?;
                    points.push(Array1::from_vec(point));
                }
                points
            }
        };

        for point in &points {
            parameters.check_point(point.view())?;
        }
        Ok(points)
    }
}

fn benchmark_point(config: &AnalysisConfig, name: &str) -> Result<Array1<f64>, ConfigurationError> {
    config
        .benchmark(name)
        .map(|b| b.point().to_owned())
        .ok_or_else(|| ConfigurationError::UnknownBenchmark(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::new();
        config.add_parameter("a", 0, 2, (-1.0, 1.0)).unwrap();
        config.add_parameter("b", 1, 2, (-1.0, 1.0)).unwrap();
        config.add_benchmark(&[0.0, 0.0], "sm").unwrap();
        config.add_benchmark(&[0.5, -0.5], "bsm").unwrap();
        config
    }

    #[test]
    fn test_benchmark_specs_resolve_by_name() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(1);
        let points = ThetaSpec::Benchmarks {
            names: vec!["bsm".to_string(), "sm".to_string()],
        }
        .resolve(&config, &mut rng)
        .unwrap();
        assert_eq!(points, vec![ndarray::array![0.5, -0.5], ndarray::array![0.0, 0.0]]);

        let missing = ThetaSpec::Benchmark {
            name: "nope".to_string(),
        }
        .resolve(&config, &mut rng);
        assert!(matches!(
            missing,
            Err(SensitivityError::Configuration(ConfigurationError::UnknownBenchmark(_)))
        ));
    }

    #[test]
    fn test_explicit_points_are_checked() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(1);
        let bad = ThetaSpec::Point {
            values: vec![1.0, 2.0, 3.0],
        }
        .resolve(&config, &mut rng);
        assert!(matches!(
            bad,
            Err(SensitivityError::Configuration(
                ConfigurationError::ParameterCountMismatch { expected: 2, found: 3 }
            ))
        ));
    }

    #[test]
    fn test_random_points_follow_priors() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(11);
        let spec = ThetaSpec::Random {
            n: 2000,
            priors: vec![
                Prior::Flat { lo: 2.0, hi: 3.0 },
                Prior::Gaussian {
                    mean: -4.0,
                    std: 0.5,
                },
            ],
        };
        let points = spec.resolve(&config, &mut rng).unwrap();
        assert_eq!(points.len(), 2000);
        assert!(points.iter().all(|p| (2.0..3.0).contains(&p[0])));
        let mean_b = points.iter().map(|p| p[1]).sum::<f64>() / points.len() as f64;
        assert!((mean_b + 4.0).abs() < 0.05, "gaussian mean drifted to {mean_b}");

        let invalid = ThetaSpec::Random {
            n: 1,
            priors: vec![
                Prior::Flat { lo: 1.0, hi: 1.0 },
                Prior::Gaussian { mean: 0.0, std: 1.0 },
            ],
        };
        assert!(matches!(
            invalid.resolve(&config, &mut rng),
            Err(SensitivityError::Configuration(ConfigurationError::InvalidPrior { index: 0, .. }))
        ));
    }

    #[test]
    fn test_spec_round_trips_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            theta: ThetaSpec,
        }
        let holder = Holder {
            theta: ThetaSpec::Random {
                n: 3,
                priors: vec![Prior::Flat { lo: -1.0, hi: 1.0 }],
            },
        };
        let text = toml::to_string(&holder).unwrap();
        let back: Holder = toml::from_str(&text).unwrap();
        assert_eq!(back.theta, holder.theta);
    }
}
