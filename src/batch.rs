//! Batch discovery and batch-wide fitting.
//!
//! A batch is a sub-directory of the batches directory; its outline files are
//! fitted under every configured variant and collected into one table per
//! (batch, variant). The synthetic `all` batch is the union of every batch.
//!
//! [`BatchRunner`] follows a solve-then-writeup lifecycle: [`BatchRunner::solve`]
//! fits every selected batch in parallel and keeps the tables in memory,
//! [`BatchRunner::writeup`] persists them. Each file is fitted once per
//! variant per run; `all` and the named batches share those fits.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ALL_BATCH;
use crate::fit::{MultiStartFitter, ShapeFit};
use crate::outline::Outline;
use crate::output;
use crate::result::{FitRow, FitTable};
use crate::settings::Settings;
use crate::shape::Variant;
use crate::stats;


/// Outline files grouped by batch name, including the `all` union.
#[derive(Debug, Clone, Default)]
pub struct Batches {
    batches: BTreeMap<String, Vec<PathBuf>>,
}

impl Batches {
    /// Scans `dir` for batch sub-directories holding files with `extension`.
    ///
    /// Files directly inside `dir` belong to no batch and are ignored.
    pub fn discover(dir: &Path, extension: &str) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read batches directory {}", dir.display()))?;

        let mut batches = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("batch directory {} is not valid UTF-8", path.display()))?
                .to_string();
            if name == ALL_BATCH {
                return Err(anyhow!(
                    "batch directory {} collides with the `{}` batch",
                    path.display(),
                    ALL_BATCH
                ));
            }

            let mut files = Vec::new();
            for file in fs::read_dir(&path)
                .with_context(|| format!("failed to read batch {}", path.display()))?
            {
                let file = file?.path();
                if file.is_file() && file.extension().is_some_and(|e| e == extension) {
                    files.push(file);
                }
            }
            files.sort();
            batches.insert(name, files);
        }

        let all = batches.values().flatten().cloned().collect();
        batches.insert(ALL_BATCH.to_string(), all);

        Ok(Self { batches })
    }

    /// Batch names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.batches.keys().map(String::as_str)
    }

    pub fn files(&self, batch: &str) -> Option<&[PathBuf]> {
        self.batches.get(batch).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PathBuf])> {
        self.batches
            .iter()
            .map(|(name, files)| (name.as_str(), files.as_slice()))
    }
}

/// Table key of an outline file: `"{parent_dir}/{file_stem}"`.
pub fn row_name(path: &Path) -> String {
    let dir = path
        .parent()
        .and_then(Path::file_name)
        .map(|d| d.to_string_lossy())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    format!("{}/{}", dir, stem)
}

/// Loads, centers and fits one outline file.
pub fn fit_file(fitter: &MultiStartFitter, path: &Path, variant: Variant) -> Result<ShapeFit> {
    let outline = Outline::from_file(path)?.centered()?;
    let fit = fitter.fit(&outline, variant)?;
    Ok(fit)
}

/// Fits every selected batch under every configured variant.
#[derive(Debug)]
pub struct BatchRunner {
    pub settings: Settings,
    pub batches: Batches,
    /// Tables in (variant, batch) order, filled by [`BatchRunner::solve`].
    pub tables: Vec<FitTable>,
    cache: HashMap<(PathBuf, Variant), ShapeFit>,
}

impl BatchRunner {
    pub fn new(settings: Settings) -> Result<Self> {
        let batches = Batches::discover(&settings.batches_dir, &settings.extension)?;
        for name in &settings.batches {
            if batches.files(name).is_none() {
                return Err(anyhow!(
                    "unknown batch `{}` in {}",
                    name,
                    settings.batches_dir.display()
                ));
            }
        }

        Ok(Self {
            settings,
            batches,
            tables: Vec::new(),
            cache: HashMap::new(),
        })
    }

    /// Fits all selected batches; the first failing outline aborts the run.
    pub fn solve(&mut self) -> Result<()> {
        match self.settings.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .context("failed to build worker pool")?;
                pool.install(|| self.solve_all())
            }
            None => self.solve_all(),
        }
    }

    fn solve_all(&mut self) -> Result<()> {
        let start = Instant::now();
        self.tables.clear();

        let selected: Vec<(String, Vec<PathBuf>)> = self
            .batches
            .iter()
            .filter(|(name, _)| self.settings.selects_batch(name))
            .map(|(name, files)| (name.to_string(), files.to_vec()))
            .collect();

        for variant in self.settings.variants.clone() {
            for (batch, files) in &selected {
                let table = self.solve_batch(batch, files, variant)?;
                self.tables.push(table);
            }
        }

        info!(
            "Fitted {} tables in {:.2?}",
            self.tables.len(),
            start.elapsed()
        );
        Ok(())
    }

    fn solve_batch(&mut self, batch: &str, files: &[PathBuf], variant: Variant) -> Result<FitTable> {
        let pending: Vec<&PathBuf> = files
            .iter()
            .filter(|path| !self.cache.contains_key(&((*path).clone(), variant)))
            .collect();
        info!(
            "Batch {} / {}: {} outlines, {} cached",
            batch,
            variant,
            files.len(),
            files.len() - pending.len()
        );

        if !pending.is_empty() {
            let fitter = MultiStartFitter::new(&self.settings.fit, &self.settings.solver);
            let pb = ProgressBar::new(pending.len() as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
                )?
                .progress_chars("█▇▆▅▄▃▂▁"),
            );
            pb.set_message(format!("{} {}", batch, variant));

            let fits = pending
                .par_iter()
                .map(|path| {
                    let fit = fit_file(&fitter, path, variant)
                        .with_context(|| format!("failed to fit {}", path.display()))?;
                    debug!("{}: {}", path.display(), fit.params);
                    pb.inc(1);
                    Ok::<_, anyhow::Error>(((*path).clone(), fit))
                })
                .collect::<Result<Vec<_>>>();
            pb.finish_and_clear();

            for (path, fit) in fits.with_context(|| format!("batch {} aborted", batch))? {
                self.cache.insert((path, variant), fit);
            }
        }

        let mut table = FitTable::new(batch, variant);
        for path in files {
            let fit = self
                .cache
                .get(&(path.clone(), variant))
                .ok_or_else(|| anyhow!("no fit recorded for {}", path.display()))?;
            table.rows.push(FitRow {
                name: row_name(path),
                source: path.clone(),
                fit: fit.clone(),
            });
        }

        if table.unconverged() > 0 {
            warn!(
                "Batch {} / {}: {} of {} selected fits did not converge, worst cost {:.6e}",
                batch,
                variant,
                table.unconverged(),
                table.len(),
                table.worst_cost().unwrap_or(f64::NAN)
            );
        }
        Ok(table)
    }

    /// Writes the tables, and optionally model dumps and population summaries.
    pub fn writeup(&self) -> Result<()> {
        let out = &self.settings.output_dir;
        let options = &self.settings.output;

        output::write_settings(&self.settings)?;

        for table in &self.tables {
            let path = output::table_path(out, table.variant, &table.batch);
            output::write_fit_table(&path, table, options.extended_columns)?;
            info!("Wrote {}", path.display());

            if options.dump_models {
                for row in &table.rows {
                    let outline = Outline::from_file(&row.source)?.centered()?;
                    let (dir, stem) = row.name.split_once('/').unwrap_or(("", row.name.as_str()));
                    let path = output::model_path(out, table.variant, &table.batch, dir, stem);
                    output::write_model_outline(&path, &outline, &row.fit.params)?;
                }
            }

            if options.statistics && !table.is_empty() {
                let summary = stats::summarize(&table.batch, table.variant, |name| table.column(name));
                let path = output::summary_path(out, table.variant, &table.batch);
                output::write_json(&path, &summary)?;
                info!("Wrote {}", path.display());
            }
        }

        Ok(())
    }
}
