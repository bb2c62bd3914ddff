#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::ArrayView2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use thetamorph::fisher::{Binning, FisherInformation, InformationInput};
use thetamorph::morphing::components::describe_component;
use thetamorph::{
    AnalysisConfig, BasisOptions, CsvEventSource, ErrorFunctional, EventSource, Morpher,
    MorphingOptions, ThetaSpec, accumulate_fisher_information, aggregate_labelled_ensemble,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum FunctionalCli {
    Mean,
    Max,
}

impl From<FunctionalCli> for ErrorFunctional {
    fn from(value: FunctionalCli) -> Self {
        match value {
            FunctionalCli::Mean => ErrorFunctional::Mean,
            FunctionalCli::Max => ErrorFunctional::Max,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum InformationMode {
    /// Full truth-level information of the weighted events
    Truth,
    /// Information in the total rate only
    Rate,
    /// Information in a histogram of one observable
    Histogram,
}

#[derive(Args)]
pub struct OptimizeArgs {
    /// Path to the configuration file (.toml) with parameters and user benchmarks
    pub config: PathBuf,

    /// Where to write the frozen configuration (defaults to overwriting the input)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Maximal total degree of a component monomial
    #[arg(long, default_value = "4")]
    pub max_overall_power: u32,

    /// Number of random candidate bases
    #[arg(long, default_value = "100")]
    pub trials: usize,

    /// Number of random test points for the error functional
    #[arg(long, default_value = "100")]
    pub test_points: usize,

    #[arg(long, value_enum, default_value_t = FunctionalCli::Mean)]
    pub functional: FunctionalCli,

    /// Seed for test points and candidate bases
    #[arg(long, default_value_t = BasisOptions::default().seed)]
    pub seed: u64,

    /// Use the declared benchmarks as the complete basis instead of optimizing
    #[arg(long)]
    pub fixed_basis: bool,
}

/// A parameter point given either as values or as a benchmark name.
#[derive(Args)]
pub struct ThetaArgs {
    /// Comma-separated parameter values, in parameter order
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, conflicts_with = "benchmark")]
    pub theta: Option<Vec<f64>>,

    /// Name of a benchmark to evaluate at
    #[arg(long)]
    pub benchmark: Option<String>,
}

impl ThetaArgs {
    fn spec(&self) -> Result<ThetaSpec, Box<dyn std::error::Error>> {
        match (&self.theta, &self.benchmark) {
            (Some(values), None) => Ok(ThetaSpec::Point {
                values: values.clone(),
            }),
            (None, Some(name)) => Ok(ThetaSpec::Benchmark { name: name.clone() }),
            _ => Err("give the parameter point with either --theta or --benchmark".into()),
        }
    }
}

#[derive(Args)]
pub struct WeightsArgs {
    /// Path to a frozen configuration file (.toml)
    pub config: PathBuf,

    #[command(flatten)]
    pub theta: ThetaArgs,
}

#[derive(Args)]
pub struct InformationArgs {
    /// Path to a frozen configuration file (.toml)
    pub config: PathBuf,

    /// CSV file with observable columns and one weight_<benchmark> column per benchmark
    pub events: PathBuf,

    #[command(flatten)]
    pub theta: ThetaArgs,

    /// Integrated luminosity the events are normalized to
    #[arg(long, default_value = "1.0")]
    pub luminosity: f64,

    #[arg(long, value_enum, default_value_t = InformationMode::Truth)]
    pub mode: InformationMode,

    /// Observable column to histogram (histogram mode)
    #[arg(long)]
    pub observable: Option<String>,

    /// Comma-separated bin edges (histogram mode)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub edges: Option<Vec<f64>>,

    /// Keep only these parameters, holding the others fixed
    #[arg(long, value_delimiter = ',', conflicts_with = "profile")]
    pub project: Option<Vec<String>>,

    /// Keep only these parameters, treating the others as nuisance parameters
    #[arg(long, value_delimiter = ',')]
    pub profile: Option<Vec<String>>,

    /// Write a JSON report (labels, matrix, covariance) to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "thetamorph",
    about = "Morphing of event weights and Fisher information in theory parameter space",
    long_about = "Chooses morphing bases for a set of theory parameters, evaluates morphing \
                 weights at arbitrary parameter points, and computes Fisher information \
                 matrices from weighted event samples."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose the morphing basis and freeze the configuration
    #[command(about = "Optimize the morphing basis (outputs: frozen config.toml)")]
    Optimize(OptimizeArgs),
    /// Print the morphing weights at a parameter point
    #[command(about = "Evaluate morphing weights at a parameter point")]
    Weights(WeightsArgs),
    /// Compute the Fisher information from weighted events
    #[command(about = "Compute a Fisher information matrix from an events CSV")]
    Information(InformationArgs),
}

pub fn optimize(args: OptimizeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AnalysisConfig::load(&args.config)?;
    println!(
        "Loaded {} parameters and {} user benchmarks from {}",
        config.parameters().len(),
        config.benchmarks().len(),
        args.config.display()
    );

    if args.fixed_basis {
        config.set_morphing_basis(args.max_overall_power)?;
    } else {
        let options = MorphingOptions {
            max_overall_power: args.max_overall_power,
            basis: BasisOptions {
                n_trials: args.trials,
                n_test_points: args.test_points,
                functional: args.functional.into(),
                seed: args.seed,
            },
        };
        config.set_morphing(&options)?;
    }

    let names = config.labels();
    if let Some(setup) = config.morphing() {
        println!("Components ({}):", setup.components.nrows());
        for row in setup.components.rows() {
            println!("  {}", describe_component(row, &names));
        }
        if setup.expected_error.is_finite() {
            println!("Expected squared weight norm: {:.6e}", setup.expected_error);
        }
    }
    println!("Benchmarks:");
    for benchmark in config.benchmarks() {
        println!(
            "  {:<28} {:?} {:?}",
            benchmark.name, benchmark.kind, benchmark.values
        );
    }

    let output = args.output.unwrap_or(args.config);
    config.save(&output)?;
    println!("Frozen configuration written to {}", output.display());
    Ok(())
}

pub fn weights(args: WeightsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AnalysisConfig::load(&args.config)?;
    let morpher = Morpher::from_config(&config)?;
    let theta = resolve_single(&args.theta, &config)?;
    let weights = morpher.weights(theta.view())?;

    println!("Morphing weights at {:?}:", theta.to_vec());
    for (benchmark, weight) in config.benchmarks().iter().zip(weights.iter()) {
        println!("  {:<28} {:>14.6e}", benchmark.name, weight);
    }
    println!("Squared weight norm: {:.6e}", weights.dot(&weights));
    Ok(())
}

pub fn information(args: InformationArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AnalysisConfig::load(&args.config)?;
    let morpher = Morpher::from_config(&config)?;
    let theta = resolve_single(&args.theta, &config)?;
    let events = CsvEventSource::new(&args.events).load_events(&config)?;

    let weights = events.benchmark_weights.view();
    let binning;
    let input = match args.mode {
        InformationMode::Truth => InformationInput::Truth {
            benchmark_weights: weights,
        },
        InformationMode::Rate => InformationInput::Rate {
            benchmark_weights: weights,
        },
        InformationMode::Histogram => {
            let name = args
                .observable
                .as_deref()
                .ok_or("histogram mode needs --observable")?;
            let edges = args.edges.clone().ok_or("histogram mode needs --edges")?;
            binning = Binning::new(edges)?;
            InformationInput::Histogram {
                benchmark_weights: weights,
                observable: events.observable(name)?,
                binning: &binning,
            }
        }
    };

    let mut info = accumulate_fisher_information(&morpher, input, theta.view(), args.luminosity)?;
    if let Some(names) = &args.project {
        info = info.project(&info.indices_of(names)?)?;
    } else if let Some(names) = &args.profile {
        info = info.profile(&info.indices_of(names)?)?;
    }
    print_information(&info);

    if let Some(path) = &args.report {
        let report = aggregate_labelled_ensemble(std::slice::from_ref(&info))?
            .report(info.labels().to_vec())?;
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &report)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn resolve_single(
    args: &ThetaArgs,
    config: &AnalysisConfig,
) -> Result<ndarray::Array1<f64>, Box<dyn std::error::Error>> {
    // Point and benchmark specifications never draw random numbers.
    let mut rng = StdRng::seed_from_u64(0);
    let mut points = args.spec()?.resolve(config, &mut rng)?;
    points.pop().ok_or_else(|| "no parameter point given".into())
}

fn print_information(info: &FisherInformation) {
    let labels = info.labels();
    let matrix: ArrayView2<f64> = info.matrix();
    print!("{:>14}", "");
    for label in labels {
        print!(" {label:>14}");
    }
    println!();
    for (label, row) in labels.iter().zip(matrix.rows()) {
        print!("{label:>14}");
        for value in row {
            print!(" {value:>14.6e}");
        }
        println!();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Optimize(args)) => optimize(args),
        Some(Commands::Weights(args)) => weights(args),
        Some(Commands::Information(args)) => information(args),
        None => Cli::command().print_help().map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
