#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use ndarray::{Array1, Array2};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use hardthresh::cv::progress::CvProgressStage;
use hardthresh::cv::{CvAxis, CvProgressObserver, RefitSummary, Strategy, cross_validate};
use hardthresh::genotype::PackedGenotypes;
use hardthresh::plink::PlinkFileset;
use hardthresh::{DebiasMode, Family, FitInputs, Link, RunConfig, fit};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Clone, Copy, ValueEnum)]
enum FamilyCli {
    Normal,
    Bernoulli,
    Poisson,
    NegativeBinomial,
    Gamma,
    InverseGaussian,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkCli {
    Identity,
    Logit,
    Probit,
    Log,
    Inverse,
    InverseSquare,
}

#[derive(Clone, Copy, ValueEnum)]
enum DebiasCli {
    Off,
    Joint,
    PerGroup,
}

#[derive(Clone, Copy, ValueEnum)]
enum AxisCli {
    Path,
    Folds,
}

impl LinkCli {
    fn link(self) -> Link {
        match self {
            LinkCli::Identity => Link::Identity,
            LinkCli::Logit => Link::Logit,
            LinkCli::Probit => Link::Probit,
            LinkCli::Log => Link::Log,
            LinkCli::Inverse => Link::Inverse,
            LinkCli::InverseSquare => Link::InverseSquare,
        }
    }
}

/// Options shared by `fit` and `cv`. Anything left unset falls back to `--config`, then
/// to the built-in defaults.
#[derive(Args)]
struct ModelArgs {
    /// PLINK fileset prefix (or path to the .bed file); the phenotype is read from the .fam
    #[arg(value_name = "BFILE")]
    bfile: PathBuf,

    /// CSV with a header row and one numeric column per covariate, rows in .fam order.
    /// An intercept column is always prepended.
    #[arg(long, value_name = "FILE")]
    covariates: Option<PathBuf>,

    /// Number of leading covariates (counting the intercept) that are never thresholded.
    /// All covariates are kept when omitted.
    #[arg(long, value_name = "J")]
    keep_covariates: Option<usize>,

    #[arg(long, value_enum)]
    family: Option<FamilyCli>,

    /// Dispersion `r` of the negative binomial family
    #[arg(long, default_value_t = 1.0)]
    dispersion: f64,

    /// Link function; the canonical link of the family when omitted
    #[arg(long, value_enum)]
    link: Option<LinkCli>,

    #[arg(long, value_enum)]
    debias: Option<DebiasCli>,

    /// Weight predictors by minor allele frequency, capped at MAX
    #[arg(
        long,
        value_name = "MAX",
        num_args = 0..=1,
        default_missing_value = "10"
    )]
    maf_weights: Option<f64>,

    #[arg(long)]
    tol: Option<f64>,

    #[arg(long)]
    max_iter: Option<usize>,

    /// TOML run configuration with `[fit]` and `[cv]` tables
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where to write the TOML report
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct FitArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Number of non-zero predictors
    #[arg(long)]
    k: usize,
}

#[derive(Args)]
struct CvArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Sparsity levels as `lo:hi` or a comma separated list
    #[arg(long, value_name = "SPEC", value_parser = parse_path)]
    path: Option<SparsityPath>,

    #[arg(long)]
    folds: Option<usize>,

    #[arg(long, value_enum)]
    axis: Option<AxisCli>,

    /// Worker threads; 0 uses every logical core, 1 runs serially
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Fit the full data at the selected sparsity level
    #[arg(long)]
    refit: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a sparse model with a fixed number of predictors
    #[command(about = "Fit a sparse GLM by iterative hard thresholding")]
    Fit(FitArgs),

    /// Choose the number of predictors by cross-validation
    #[command(about = "Cross-validate a path of sparsity levels")]
    Cv(CvArgs),

    /// Display version information
    Version,
}

#[derive(Parser)]
#[command(name = "hardthresh", version, about = "Sparse GLMs by iterative hard thresholding")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Cv(args)) => run_cv(args),
        Some(Commands::Version) => {
            println!("hardthresh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let mut command = Cli::command();
            command.print_help().map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

#[derive(Clone, Debug)]
struct SparsityPath(Vec<usize>);

fn parse_path(text: &str) -> Result<SparsityPath, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|e| format!("'{s}' is not a sparsity level: {e}"))
    };
    if let Some((lo, hi)) = text.split_once(':') {
        let (lo, hi) = (parse(lo)?, parse(hi)?);
        if lo > hi {
            return Err(format!("empty range {lo}:{hi}"));
        }
        Ok(SparsityPath((lo..=hi).collect()))
    } else {
        text.split(',').map(parse).collect::<Result<_, _>>().map(SparsityPath)
    }
}

/// Applies the command line overrides on top of the configuration file.
fn load_run_config(args: &ModelArgs) -> CliResult<RunConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading run configuration from {}", path.display());
            RunConfig::load(path)?
        }
        None => RunConfig::default(),
    };
    if let Some(family) = args.family {
        config.fit.family = match family {
            FamilyCli::Normal => Family::Normal,
            FamilyCli::Bernoulli => Family::Bernoulli,
            FamilyCli::Poisson => Family::Poisson,
            FamilyCli::NegativeBinomial => Family::NegativeBinomial { r: args.dispersion },
            FamilyCli::Gamma => Family::Gamma,
            FamilyCli::InverseGaussian => Family::InverseGaussian,
        };
    }
    if let Some(link) = args.link {
        config.fit.link = Some(link.link());
    }
    if let Some(debias) = args.debias {
        config.fit.debias = match debias {
            DebiasCli::Off => DebiasMode::Off,
            DebiasCli::Joint => DebiasMode::Joint,
            DebiasCli::PerGroup => DebiasMode::PerGroup,
        };
    }
    if let Some(tol) = args.tol {
        config.fit.tol = tol;
    }
    if let Some(max_iter) = args.max_iter {
        config.fit.max_iter = max_iter;
    }
    Ok(config)
}

/// Genotypes, response, covariates and optional priors of one run.
struct Dataset {
    genotypes: PackedGenotypes<memmap2::Mmap>,
    y: Array1<f64>,
    z: Array2<f64>,
    priors: Option<Array1<f64>>,
}

impl Dataset {
    fn load(args: &ModelArgs, family: Family) -> CliResult<Self> {
        let fileset = PlinkFileset::open(&args.bfile)?;
        info!(
            "Opened {} ({} samples, {} variants)",
            fileset.bed_path().display(),
            fileset.n_samples(),
            fileset.n_variants()
        );
        let n = fileset.n_samples();
        let mut y = fileset.phenotypes()?;
        if family == Family::Bernoulli && y.iter().all(|&v| v == 1.0 || v == 2.0) {
            info!("Recoding PLINK case/control phenotypes (1/2) to 0/1");
            y.mapv_inplace(|v| v - 1.0);
        }

        let z = match &args.covariates {
            Some(path) => read_covariates(path, n)?,
            None => Array2::ones((n, 1)),
        };
        let genotypes = fileset.into_genotypes();
        let priors = args.maf_weights.map(|max| genotypes.maf_weights(max));
        Ok(Self {
            genotypes,
            y,
            z,
            priors,
        })
    }

    fn inputs(&self, keep: Option<usize>) -> FitInputs<'_> {
        let mut inputs = FitInputs::new(self.y.view(), self.z.view());
        if let Some(kept) = keep {
            inputs = inputs.keep_leading(kept);
        }
        if let Some(priors) = &self.priors {
            inputs = inputs.with_priors(priors.view());
        }
        inputs
    }
}

/// Reads a numeric covariate table and prepends an intercept column.
fn read_covariates(path: &Path, n: usize) -> CliResult<Array2<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let names: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut z = Array2::ones((n, names.len() + 1));
    let mut rows = 0;
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if i >= n {
            return Err(format!("{} has more rows than the {n} samples in the .fam", path.display()).into());
        }
        for (j, field) in record.iter().enumerate() {
            z[[i, j + 1]] = field.parse::<f64>().map_err(|e| {
                format!(
                    "{}: row {} column '{}': cannot parse '{field}': {e}",
                    path.display(),
                    i + 2,
                    names.get(j).map_or("?", String::as_str)
                )
            })?;
        }
        rows += 1;
    }
    if rows != n {
        return Err(format!("{} has {rows} rows, expected {n}", path.display()).into());
    }
    info!("Read {} covariate(s) from {}: {}", names.len(), path.display(), names.join(", "));
    Ok(z)
}

fn write_toml<T: serde::Serialize>(value: &T, path: &Path) -> CliResult<()> {
    std::fs::write(path, toml::to_string_pretty(value)?)?;
    info!("Report written to {}", path.display());
    Ok(())
}

fn run_fit(args: FitArgs) -> CliResult<()> {
    let config = load_run_config(&args.model)?;
    let data = Dataset::load(&args.model, config.fit.family)?;
    let result = fit(
        &data.genotypes,
        &data.inputs(args.model.keep_covariates),
        args.k,
        &config.fit,
    )?;
    if !result.status.is_converged() {
        warn!("Fit stopped after {} iterations without converging", result.iterations);
    }
    info!(
        "k={}: objective {:.6e} after {} iteration(s) in {:.2?}",
        result.k, result.objective, result.iterations, result.elapsed
    );
    let summary = RefitSummary::from(&result);
    for (&j, b) in summary.support.iter().zip(&summary.support_coefficients) {
        println!("variant {j}\t{b:.6}");
    }
    match &args.model.out {
        Some(path) => write_toml(&summary, path),
        None => Ok(()),
    }
}

fn run_cv(args: CvArgs) -> CliResult<()> {
    let mut config = load_run_config(&args.model)?;
    if let Some(SparsityPath(path)) = args.path {
        config.cv.path = path;
    }
    if let Some(folds) = args.folds {
        config.cv.folds = folds;
    }
    if let Some(axis) = args.axis {
        config.cv.axis = match axis {
            AxisCli::Path => CvAxis::Path,
            AxisCli::Folds => CvAxis::Folds,
        };
    }
    if let Some(threads) = args.threads {
        config.cv.strategy = if threads == 1 {
            Strategy::Serial
        } else {
            Strategy::Threads { threads }
        };
    }
    if args.scratch_dir.is_some() {
        config.cv.scratch_dir = args.scratch_dir;
    }
    if let Some(seed) = args.seed {
        config.cv.seed = seed;
    }
    config.cv.refit |= args.refit;

    let data = Dataset::load(&args.model, config.fit.family)?;
    let mut observer = BarObserver::default();
    let report = cross_validate(
        &data.genotypes,
        &data.inputs(args.model.keep_covariates),
        &config.fit,
        &config.cv,
        None,
        &mut observer,
    )?;

    println!("k\tmean_error");
    for (k, error) in report.path.iter().zip(&report.mean_errors) {
        let marker = if *k == report.best_k { "\t*" } else { "" };
        println!("{k}\t{error:.6}{marker}");
    }
    match &args.model.out {
        Some(path) => Ok(report.save(path)?),
        None => Ok(()),
    }
}

/// Renders cross-validation progress on stderr when it is a terminal.
#[derive(Default)]
struct BarObserver {
    bar: Option<ProgressBar>,
}

impl CvProgressObserver for BarObserver {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_units: usize) {
        let bar = ProgressBar::with_draw_target(
            Some(total_units as u64),
            if std::io::stderr().is_terminal() {
                ProgressDrawTarget::stderr_with_hz(20)
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.to_string());
        self.bar = Some(bar);
    }

    fn on_stage_advance(&mut self, _: CvProgressStage, completed_units: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_units as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_path;

    #[test]
    fn sparsity_paths_accept_ranges_and_lists() {
        assert_eq!(parse_path("1:4").unwrap().0, vec![1, 2, 3, 4]);
        assert_eq!(parse_path("2, 5,9").unwrap().0, vec![2, 5, 9]);
        assert!(parse_path("5:2").is_err());
        assert!(parse_path("a:3").is_err());
    }
}
