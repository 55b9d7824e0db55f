use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::*;
use crate::error::MorphError;
use crate::shape::Variant;
use crate::solver::SolverOptions;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_file_is_valid() {
        let settings = load_default_config().unwrap();
        assert_eq!(settings.fit.rotation_sectors, DEFAULT_ROTATION_SECTORS);
        assert_eq!(settings.fit.orders(), (3..=9).collect::<Vec<_>>());
        assert_eq!(settings.variants, Variant::ALL.to_vec());
    }

    #[test]
    fn too_few_sectors_rejected() {
        let mut settings = Settings::new("in", "out");
        settings.fit.rotation_sectors = 2;
        assert!(matches!(validate_config(&settings), Err(MorphError::Config(_))));
        settings.fit.rotation_sectors = 3;
        assert!(validate_config(&settings).is_ok());
    }

    #[test]
    fn inverted_order_range_rejected() {
        let mut settings = Settings::new("in", "out");
        settings.fit.min_order = 6;
        settings.fit.max_order = 5;
        assert!(validate_config(&settings).is_err());
        settings.fit.min_order = 0;
        settings.fit.max_order = 5;
        assert!(validate_config(&settings).is_err());
    }

    #[test]
    fn cli_overrides_applied() {
        let args = CliArgs::parse_from([
            "morphfit",
            "--batches",
            "raw",
            "--variant",
            "oval",
            "--sectors",
            "12",
            "--orders",
            "4",
            "6",
            "--budget",
            "2.5",
            "--stats",
        ]);
        let mut settings = Settings::new("in", "out");
        apply_overrides(&mut settings, &args);
        assert_eq!(settings.batches_dir, PathBuf::from("raw"));
        assert_eq!(settings.variants, vec![Variant::Oval]);
        assert_eq!(settings.fit.rotation_sectors, 12);
        assert_eq!(settings.fit.orders(), vec![4, 5, 6]);
        assert_eq!(settings.solver.fit_budget_secs, Some(2.5));
        assert!(settings.output.statistics);
        assert!(!settings.output.dump_models);
    }

    #[test]
    fn settings_serialize_to_toml() {
        let settings = Settings::new("in", "out");
        let text = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}

/// Multi-start search configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FitSettings {
    /// Number of equal rotation sectors of `[0, 2π)` seeding the oval and shape fits.
    pub rotation_sectors: usize,
    /// Smallest harmonic order tried by the shape fit.
    pub min_order: u32,
    /// Largest harmonic order tried by the shape fit.
    pub max_order: u32,
    pub max_ovality: f64,
    pub max_wave_height: f64,
    pub max_wave_shift: f64,
    /// Run the restarts of one outline in parallel.
    #[serde(default = "default_true")]
    pub parallel_starts: bool,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            rotation_sectors: DEFAULT_ROTATION_SECTORS,
            min_order: DEFAULT_MIN_ORDER,
            max_order: DEFAULT_MAX_ORDER,
            max_ovality: MAX_OVALITY,
            max_wave_height: MAX_WAVE_HEIGHT,
            max_wave_shift: MAX_WAVE_SHIFT,
            parallel_starts: true,
        }
    }
}

impl FitSettings {
    /// Candidate harmonic orders in ascending order.
    pub fn orders(&self) -> Vec<u32> {
        (self.min_order..=self.max_order).collect()
    }
}

/// Least-squares termination controls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SolverSettings {
    pub max_evaluations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// Wall-clock budget for all starts of one outline, in seconds.
    #[serde(default)]
    pub fit_budget_secs: Option<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        let options = SolverOptions::default();
        Self {
            max_evaluations: options.max_evaluations,
            ftol: options.ftol,
            xtol: options.xtol,
            gtol: options.gtol,
            fit_budget_secs: None,
        }
    }
}

impl SolverSettings {
    /// Solver options for one outline fit starting now.
    pub fn options(&self) -> SolverOptions {
        SolverOptions {
            max_evaluations: self.max_evaluations,
            ftol: self.ftol,
            xtol: self.xtol,
            gtol: self.gtol,
            deadline: self
                .fit_budget_secs
                .map(|secs| Instant::now() + Duration::from_secs_f64(secs)),
            ..SolverOptions::default()
        }
    }
}

/// What gets written besides the result tables.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct OutputSettings {
    /// Write measured and model outline coordinates per fitted file.
    #[serde(default)]
    pub dump_models: bool,
    /// Append `rotation` and `cost` columns to the result tables.
    #[serde(default)]
    pub extended_columns: bool,
    /// Fit population distributions to each result table.
    #[serde(default)]
    pub statistics: bool,
}

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    /// Directory whose sub-directories are the batches.
    pub batches_dir: PathBuf,
    /// Directory receiving the result tables.
    pub output_dir: PathBuf,
    /// Extension of outline files inside a batch.
    #[serde(default = "default_extension")]
    pub extension: String,
    pub variants: Vec<Variant>,
    /// Batch names to process; empty means every batch.
    #[serde(default)]
    pub batches: Vec<String>,
    /// Worker threads; defaults to the number of cores.
    #[serde(default)]
    pub threads: Option<usize>,
    pub fit: FitSettings,
    pub solver: SolverSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

fn default_true() -> bool {
    true
}

fn default_extension() -> String {
    DEFAULT_OUTLINE_EXTENSION.to_string()
}

impl Settings {
    /// Default settings for the given input and output directories.
    pub fn new(batches_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            batches_dir: batches_dir.into(),
            output_dir: output_dir.into(),
            extension: default_extension(),
            variants: Variant::ALL.to_vec(),
            batches: Vec::new(),
            threads: None,
            fit: FitSettings::default(),
            solver: SolverSettings::default(),
            output: OutputSettings::default(),
        }
    }

    /// True if `batch` passes the batch filter.
    pub fn selects_batch(&self, batch: &str) -> bool {
        self.batches.is_empty() || self.batches.iter().any(|b| b == batch)
    }
}

/// Loads `config/default.toml` only, ignoring local files, environment and
/// command line.
pub fn load_default_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let settings = build(&root.join("config/default.toml"), false)?;
    validate_config(&settings)?;
    Ok(settings)
}

/// Loads the layered configuration and applies command-line overrides.
pub fn load_config(args: &CliArgs) -> Result<Settings> {
    let config_file = match &args.config {
        Some(path) => path.clone(),
        None => {
            let root = retrieve_project_root()?;
            let default_config_file = root.join("config/default.toml");
            let local_config = root.join("config/local.toml");

            // Check if local config exists, if not use default
            if local_config.exists() {
                local_config
            } else {
                default_config_file
            }
        }
    };
    info!("Using configuration: {}", config_file.display());

    let mut settings = build(&config_file, true)?;
    apply_overrides(&mut settings, args);
    validate_config(&settings)?;

    Ok(settings)
}

fn build(config_file: &Path, with_environment: bool) -> Result<Settings> {
    let mut builder = Config::builder().add_source(File::from(config_file).required(true));
    if with_environment {
        builder = builder.add_source(Environment::with_prefix("MORPHFIT").separator("__"));
    }
    let config = builder
        .build()
        .with_context(|| format!("Error loading configuration {}", config_file.display()))?;
    config
        .try_deserialize()
        .with_context(|| format!("Error deserializing configuration {}", config_file.display()))
}

fn apply_overrides(settings: &mut Settings, args: &CliArgs) {
    if let Some(dir) = &args.batches {
        settings.batches_dir = dir.clone();
    }
    if let Some(dir) = &args.output {
        settings.output_dir = dir.clone();
    }
    if !args.variant.is_empty() {
        settings.variants = args.variant.clone();
    }
    if !args.batch.is_empty() {
        settings.batches = args.batch.clone();
    }
    if let Some(sectors) = args.sectors {
        settings.fit.rotation_sectors = sectors;
    }
    if let Some(orders) = &args.orders {
        settings.fit.min_order = orders[0];
        settings.fit.max_order = orders[1];
    }
    if let Some(threads) = args.threads {
        settings.threads = Some(threads);
    }
    if let Some(budget) = args.budget {
        settings.solver.fit_budget_secs = Some(budget);
    }
    settings.output.dump_models |= args.dump_models;
    settings.output.extended_columns |= args.extended;
    settings.output.statistics |= args.stats;
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the MORPHFIT_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        // When running through cargo (e.g. cargo run, cargo test)
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("MORPHFIT_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }

    let exe_path = env::current_exe().context("Failed to get current executable path")?;
    exe_path
        .ancestors()
        .skip(1)
        .find(|dir| dir.join("config").is_dir())
        .map(Path::to_path_buf)
        .context("Could not find project root directory")
}

/// Checks the invariants the fitting code relies on.
pub fn validate_config(config: &Settings) -> std::result::Result<(), MorphError> {
    let fail = |msg: String| Err(MorphError::Config(msg));
    let fit = &config.fit;

    if fit.rotation_sectors < MIN_ROTATION_SECTORS {
        return fail(format!(
            "rotation_sectors must be at least {}, got {}",
            MIN_ROTATION_SECTORS, fit.rotation_sectors
        ));
    }
    if fit.min_order == 0 || fit.min_order > fit.max_order {
        return fail(format!(
            "harmonic orders must satisfy 1 <= min <= max, got {}..={}",
            fit.min_order, fit.max_order
        ));
    }
    if !(fit.max_ovality > 1.0) {
        return fail(format!("max_ovality must exceed 1, got {}", fit.max_ovality));
    }
    if !(fit.max_wave_height > 0.0) || !(fit.max_wave_shift > 0.0) {
        return fail("wave height and shift bounds must be positive".to_string());
    }
    let solver = &config.solver;
    if solver.max_evaluations == 0 {
        return fail("max_evaluations must be positive".to_string());
    }
    if !(solver.ftol > 0.0 && solver.xtol > 0.0 && solver.gtol > 0.0) {
        return fail("solver tolerances must be positive".to_string());
    }
    if solver.fit_budget_secs.is_some_and(|b| !(b > 0.0)) {
        return fail("fit budget must be positive".to_string());
    }
    if config.variants.is_empty() {
        return fail("at least one fit variant is required".to_string());
    }
    if config.threads == Some(0) {
        return fail("threads must be positive".to_string());
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about = "morphfit - shape model fits of particle outlines")]
pub struct CliArgs {
    /// Configuration file to use instead of config/default.toml or config/local.toml.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory containing one sub-directory per batch of outline files.
    #[arg(short, long)]
    pub batches: Option<PathBuf>,

    /// Directory receiving the result tables.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Fit variant to run; repeat for several. Defaults to the configured list.
    #[arg(long, value_enum)]
    pub variant: Vec<Variant>,

    /// Only process the named batch; repeat for several. "all" is the union of every batch.
    #[arg(long)]
    pub batch: Vec<String>,

    /// Number of equal rotation sectors used as multi-start seeds.
    #[arg(long)]
    pub sectors: Option<usize>,

    /// Smallest and largest harmonic order tried by the shape fit.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
    pub orders: Option<Vec<u32>>,

    /// Number of worker threads.
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Wall-clock budget per outline fit, in seconds.
    #[arg(long)]
    pub budget: Option<f64>,

    /// Write measured and model outline coordinates for every fitted file.
    #[arg(long)]
    pub dump_models: bool,

    /// Append rotation and cost columns to the result tables.
    #[arg(long)]
    pub extended: bool,

    /// Fit population distributions to the result tables.
    #[arg(long)]
    pub stats: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variants: Vec<&str> = self.variants.iter().map(|v| v.name()).collect();
        write!(
            f,
            "Settings:
  - Batches: {}
  - Output: {}
  - Variants: {}
  - Rotation Sectors: {}
  - Harmonic Orders: {}..={}
  - Max Evaluations: {}
  - Fit Budget: {:?}
  ",
            self.batches_dir.display(),
            self.output_dir.display(),
            variants.join(", "),
            self.fit.rotation_sectors,
            self.fit.min_order,
            self.fit.max_order,
            self.solver.max_evaluations,
            self.solver.fit_budget_secs,
        )
    }
}
