use approx::assert_abs_diff_eq;
use ndarray::{Array1, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::tempdir;
use thetamorph::morphing::{evaluate_components, find_components};
use thetamorph::{
    AnalysisConfig, BasisOptions, BenchmarkKind, ConfigurationError, ErrorKind, Morpher,
    MorphingOptions, Prior, SensitivityError, ThetaSpec,
};

fn two_parameter_config() -> AnalysisConfig {
    let mut config = AnalysisConfig::new();
    config.add_parameter("cwl2", 0, 2, (-50.0, 50.0)).unwrap();
    config.add_parameter("cpwl2", 1, 2, (-50.0, 50.0)).unwrap();
    config.add_benchmark(&[0.0, 0.0], "sm").unwrap();
    config.add_benchmark(&[20.0, 0.0], "w").unwrap();
    config
}

fn frozen_config() -> AnalysisConfig {
    let mut config = two_parameter_config();
    let options = MorphingOptions {
        max_overall_power: 2,
        basis: BasisOptions {
            n_trials: 1000,
            ..BasisOptions::default()
        },
    };
    config.set_morphing(&options).unwrap();
    config
}

fn assert_one_hot(morpher: &Morpher, config: &AnalysisConfig) {
    for (i, benchmark) in config.benchmarks().iter().enumerate() {
        let weights = morpher.weights(benchmark.point()).unwrap();
        for (j, &w) in weights.iter().enumerate() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(w, expected, epsilon = 1e-9);
        }
    }
}

#[test]
fn two_parameter_setup_keeps_user_benchmarks() {
    let config = frozen_config();
    let benchmarks = config.benchmarks();
    assert_eq!(benchmarks.len(), 6);
    assert_eq!(benchmarks[0].name, "sm");
    assert_eq!(benchmarks[0].values, vec![0.0, 0.0]);
    assert_eq!(benchmarks[1].name, "w");
    assert_eq!(benchmarks[1].values, vec![20.0, 0.0]);
    assert!(benchmarks[..2].iter().all(|b| b.kind == BenchmarkKind::User));
    assert!(benchmarks[2..].iter().all(|b| b.kind == BenchmarkKind::Generated));
    assert_eq!(benchmarks[2].name, "morphing_basis_vector_0");

    let setup = config.morphing().unwrap();
    assert_eq!(setup.components, find_components(&[2, 2], 2).unwrap());
    assert_eq!(setup.morphing_matrix.dim(), (6, 6));
    assert!(setup.expected_error.is_finite());

    let morpher = Morpher::from_config(&config).unwrap();
    assert_one_hot(&morpher, &config);
}

#[test]
fn morphing_reproduces_a_quadratic_cross_section() {
    let config = frozen_config();
    let morpher = Morpher::from_config(&config).unwrap();
    let components = &config.morphing().unwrap().components;

    // Any squared amplitude is a linear combination of the components.
    let coefficients = array![1.3, -0.02, 0.05, 0.004, -0.001, 0.0025];
    let cross_section =
        |theta: &Array1<f64>| evaluate_components(components.view(), theta.view()).dot(&coefficients);
    let at_benchmarks: Array1<f64> = config
        .benchmarks()
        .iter()
        .map(|b| cross_section(&b.point().to_owned()))
        .collect();

    let mut rng = StdRng::seed_from_u64(42);
    let points = ThetaSpec::Random {
        n: 25,
        priors: vec![
            Prior::Flat { lo: -50.0, hi: 50.0 },
            Prior::Gaussian { mean: 0.0, std: 20.0 },
        ],
    }
    .resolve(&config, &mut rng)
    .unwrap();
    for theta in &points {
        let weights = morpher.weights(theta.view()).unwrap();
        let morphed = weights.dot(&at_benchmarks);
        let exact = cross_section(theta);
        assert_abs_diff_eq!(morphed, exact, epsilon = 1e-8 * exact.abs().max(1.0));
    }
}

#[test]
fn frozen_configuration_survives_a_toml_round_trip() {
    let config = frozen_config();
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    config.save(&path).unwrap();

    let reloaded = AnalysisConfig::load(&path).unwrap();
    assert_eq!(reloaded.benchmarks(), config.benchmarks());
    assert_eq!(reloaded.labels(), vec!["cwl2".to_string(), "cpwl2".to_string()]);

    let original = Morpher::from_config(&config).unwrap();
    let restored = Morpher::from_config(&reloaded).unwrap();
    assert_one_hot(&restored, &reloaded);
    for theta in [array![-12.5, 33.0], array![49.0, -49.0], array![0.1, 0.2]] {
        let a = original.weights(theta.view()).unwrap();
        let b = restored.weights(theta.view()).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }
}

#[test]
fn frozen_configuration_rejects_further_declarations() {
    let mut config = frozen_config();
    let err = config.add_benchmark(&[1.0, 1.0], "late").unwrap_err();
    assert!(matches!(
        err,
        SensitivityError::Configuration(ConfigurationError::ConfigurationFrozen)
    ));
    let err = config.add_parameter("cb", 2, 2, (-1.0, 1.0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn too_few_benchmarks_fail_fast() {
    let mut config = two_parameter_config();
    config.add_benchmark(&[0.0, 20.0], "b").unwrap();
    config.add_benchmark(&[-20.0, 10.0], "c").unwrap();
    config.add_benchmark(&[10.0, -30.0], "d").unwrap();
    let err = config.set_morphing_basis(2).unwrap_err();
    assert!(matches!(
        err,
        SensitivityError::Configuration(ConfigurationError::UnderdeterminedBasis {
            components: 6,
            benchmarks: 5
        })
    ));
    assert!(!config.is_frozen());
}

#[test]
fn weights_are_only_defined_after_setup() {
    let config = two_parameter_config();
    assert!(matches!(
        Morpher::from_config(&config),
        Err(SensitivityError::Configuration(ConfigurationError::MorphingNotConfigured))
    ));
}
