#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use gam_columns::basis::{BasisType, KnotSource, generate_basis};
use gam_columns::config::{GamParameters, MissingValuesHandling, PredictorSpec};
use gam_columns::data::{load_all_columns, load_training_frame};
use gam_columns::estimate::fit_gam;
use gam_columns::model::GamModel;
use gam_columns::solver::GaussianPenalizedSolver;
use gam_columns::store::InMemoryStore;

#[derive(Args)]
pub struct FitArgs {
    /// Path to the training TSV file (header row, numeric columns)
    pub training_data: String,

    /// TOML file with the GAM parameters
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Response column; overrides the value in --config
    #[arg(long)]
    pub response: Option<String>,

    /// Predictor to smooth with the default basis settings (repeatable)
    #[arg(long = "gam-column", value_name = "COLUMN")]
    pub gam_columns: Vec<String>,

    /// Knot count for every --gam-column
    #[arg(long, requires = "gam_columns")]
    pub num_knots: Option<usize>,

    /// Standardize smooth predictors before building their bases
    #[arg(long)]
    pub standardize: bool,

    /// Worker threads for basis construction (default: all cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Where to write the fitted model
    #[arg(long, default_value = "gam_model.toml")]
    pub output: PathBuf,

    /// Also write the coefficients as a TSV table
    #[arg(long, value_name = "PATH")]
    pub coefficients: Option<PathBuf>,
}

#[derive(Args)]
pub struct BasisArgs {
    /// Path to a TSV file holding the predictor column
    pub data: String,

    /// The predictor column to expand
    #[arg(long)]
    pub column: String,

    #[arg(long, default_value = "10")]
    pub num_knots: usize,

    /// Where to write the basis columns as TSV
    #[arg(long, default_value = "basis.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "gam-columns",
    about = "Cubic regression spline GAM columns, penalties and Gaussian GAM fits",
    long_about = "Builds cubic regression spline expansions and roughness penalties for smooth \
                 predictors, assembles the penalized design matrix and fits Gaussian GAMs."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a Gaussian GAM from training data
    #[command(about = "Fit a Gaussian GAM (outputs: gam_model.toml)")]
    Fit(FitArgs),

    /// Expand a single predictor into its uncentered spline basis
    #[command(about = "Write the spline basis of one column (outputs: basis.tsv)")]
    Basis(BasisArgs),

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Basis(args)) => basis(args),
        Some(Commands::Version) => {
            println!("gam-columns {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_parameters(args: &FitArgs) -> Result<GamParameters, Box<dyn std::error::Error>> {
    let mut params = match &args.config {
        Some(path) => GamParameters::load(&path.to_string_lossy())?,
        None => GamParameters::default(),
    };
    if let Some(response) = &args.response {
        params.response_column = response.clone();
    }
    for column in &args.gam_columns {
        let mut spec = PredictorSpec::new(column.clone());
        spec.num_knots = args.num_knots;
        params.gam_columns.push(spec);
    }
    if args.standardize {
        params.standardize = true;
    }
    if args.threads.is_some() {
        params.num_threads = args.threads;
    }
    Ok(params)
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let params = resolve_parameters(&args)?;
    let frame = load_all_columns(
        &args.training_data,
        &params.response_column,
        &params.ignored_columns,
        params.missing_values_handling,
    )?;

    let store = InMemoryStore::new();
    let model = fit_gam(&frame, &params, &store, &GaussianPenalizedSolver)?;

    model.save(&args.output.to_string_lossy())?;
    println!("Model saved to: {}", args.output.display());
    if let Some(path) = &args.coefficients {
        model.write_coefficients(path)?;
        println!("Coefficients saved to: {}", path.display());
    }
    print_summary(&model);
    Ok(())
}

fn print_summary(model: &GamModel) {
    let out = &model.output;
    println!(
        "Fitted {} coefficients ({} smooth terms, centered: {}).",
        out.coefficients.len(),
        out.artifacts.len(),
        out.center_gam
    );
    if let Some(intercept) = out.intercept {
        println!("  intercept = {intercept:.6}");
    }
    for (term, names) in out.artifacts.iter().zip(&out.gam_column_names) {
        println!("  s({}): {} columns", term.column, names.len());
    }
    println!("  residual sum of squares = {:.6e}", out.residual_sum_of_squares);
}

pub fn basis(args: BasisArgs) -> Result<(), Box<dyn std::error::Error>> {
    // The expanded column is loaded as the frame's only column, so it may not have gaps.
    let frame = load_training_frame(
        &args.data,
        &args.column,
        &[],
        MissingValuesHandling::MeanImputation,
    )?;
    let values = frame
        .column(&args.column)
        .ok_or_else(|| format!("column '{}' not found", args.column))?;
    let generated = generate_basis(values, KnotSource::Count(args.num_knots), 1.0, false)?;
    write_basis(&args.output, &args.column, &generated.basis)?;
    println!(
        "Wrote {} basis columns for '{}' to {}",
        generated.basis.ncols(),
        args.column,
        args.output.display()
    );
    Ok(())
}

fn write_basis(
    path: &Path,
    column: &str,
    basis: &ndarray::Array2<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let tag = BasisType::CubicRegression.tag();
    let headers: Vec<String> = (0..basis.ncols())
        .map(|j| format!("{column}_{tag}_{j}"))
        .collect();
    wtr.write_record(&headers)?;
    for row in basis.rows() {
        wtr.write_record(row.iter().map(|v| format!("{v:.12}")))?;
    }
    wtr.flush()?;
    Ok(())
}
