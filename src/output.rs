use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::config::MODEL_OUTLINE_RESOLUTION;
use crate::outline::CenteredOutline;
use crate::result::FitTable;
use crate::settings::Settings;
use crate::shape::{ShapeParams, Variant};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::ShapeFit;
    use crate::result::FitRow;

    fn table() -> FitTable {
        let mut table = FitTable::new("batch_a", Variant::Shape);
        for (i, name) in ["batch_a/p1", "odd,dir/p2", "line\nbreak/\"p3\""].iter().enumerate() {
            table.rows.push(FitRow {
                name: name.to_string(),
                source: PathBuf::from(format!("{}.data", name)),
                fit: ShapeFit {
                    variant: Variant::Shape,
                    params: ShapeParams::shape(
                        10.0 + i as f64 / 3.0,
                        1.2,
                        0.05,
                        0.125,
                        1.0,
                        4 + i as u32,
                    ),
                    cost: 0.25,
                    converged: true,
                    starts: 63,
                    evaluations: 120,
                },
            });
        }
        table
    }

    #[test]
    fn table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fits_shape").join("batch_a.csv");
        let table = table();
        write_fit_table(&path, &table, false).unwrap();

        let read = read_fit_table(&path).unwrap();
        assert_eq!(read.header, vec!["name", "r0", "o", "h", "p", "n"]);
        assert_eq!(read.names, vec!["batch_a/p1", "odd,dir/p2", "line\nbreak/\"p3\""]);
        assert_eq!(read.column("r0").unwrap(), table.column("r0").unwrap());
        assert_eq!(read.column("n").unwrap(), vec![4.0, 5.0, 6.0]);
        assert!(read.column("rotation").is_none());
    }

    #[test]
    fn extended_columns_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        write_fit_table(&path, &table(), true).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("name,r0,o,h,p,n,rotation,cost"));
        assert_eq!(lines.next(), Some("batch_a/p1,10,1.2,0.05,0.125,4,1,0.25"));
        assert!(lines.next().unwrap().starts_with("\"odd,dir/p2\","));
        assert_eq!(lines.next(), Some("\"line"));
    }

    #[test]
    fn malformed_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "name,r0\nx/y,abc\n").unwrap();
        assert!(read_fit_table(&path).is_err());
        fs::write(&path, "name,r0\nx/y,1,2\n").unwrap();
        assert!(read_fit_table(&path).is_err());
    }

    #[test]
    fn model_dump_has_both_outlines() {
        let truth = ShapeParams::oval(5.0, 1.5, 0.0);
        let outline = crate::outline::Outline::from_points(truth.outline(37))
            .unwrap()
            .centered()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.csv");
        write_model_outline(&path, &outline, &truth).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("kind,x,y"));
        let measured = text.lines().filter(|l| l.starts_with("measured,")).count();
        let model = text.lines().filter(|l| l.starts_with("model,")).count();
        assert_eq!(measured, outline.len());
        assert_eq!(model, MODEL_OUTLINE_RESOLUTION);
    }

    #[test]
    fn output_paths() {
        let root = Path::new("out");
        assert_eq!(
            table_path(root, Variant::Oval, "b1"),
            PathBuf::from("out/fits_oval/b1.csv")
        );
        assert_eq!(
            model_path(root, Variant::Shape, "all", "b1", "p3"),
            PathBuf::from("out/fits_shape/all/b1_p3.csv")
        );
        assert_eq!(
            summary_path(root, Variant::Circular, "b1"),
            PathBuf::from("out/dist_circular/b1.json")
        );
    }
}

/// Path of the table of one (batch, variant).
pub fn table_path(output_dir: &Path, variant: Variant, batch: &str) -> PathBuf {
    output_dir
        .join(format!("fits_{}", variant))
        .join(format!("{}.csv", batch))
}

/// Path of the model dump of one outline, `{dir}_{stem}.csv` under the batch.
pub fn model_path(output_dir: &Path, variant: Variant, batch: &str, dir: &str, stem: &str) -> PathBuf {
    output_dir
        .join(format!("fits_{}", variant))
        .join(batch)
        .join(format!("{}_{}.csv", dir, stem))
}

/// Path of the population summary of one (batch, variant).
pub fn summary_path(output_dir: &Path, variant: Variant, batch: &str) -> PathBuf {
    output_dir
        .join(format!("dist_{}", variant))
        .join(format!("{}.json", batch))
}

fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Writes a fit table as CSV, creating parent directories as needed.
///
/// Rows keep the table's order and floats use the shortest round-trip
/// representation, so identical tables give identical files.
pub fn write_fit_table(path: &Path, table: &FitTable, extended: bool) -> Result<()> {
    let mut writer = csv::Writer::from_writer(create_writer(path)?);

    writer.write_record(table.header(extended))?;
    for row in &table.rows {
        writer.write_record(table.record(row, extended))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

/// A fit table read back from CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumns {
    pub header: Vec<String>,
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl TableColumns {
    /// Values of a named column, excluding the `name` key column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.header.iter().skip(1).position(|h| h == name)?;
        Some(self.values.iter().map(|row| row[index]).collect())
    }
}

pub fn read_fit_table(path: &Path) -> Result<TableColumns> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let header: Vec<String> = reader
        .headers()
        .with_context(|| format!("{} has no header", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    if header.is_empty() {
        return Err(anyhow!("{} is empty", path.display()));
    }

    let mut names = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("malformed table {}", path.display()))?;
        let line = record.position().map_or(0, |p| p.line());
        let row = record
            .iter()
            .skip(1)
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("{}:{}: invalid number", path.display(), line))?;
        names.push(record.get(0).unwrap_or_default().to_string());
        values.push(row);
    }

    Ok(TableColumns {
        header,
        names,
        values,
    })
}

/// Writes the measured (centered) outline next to the fitted model outline.
pub fn write_model_outline(path: &Path, outline: &CenteredOutline, params: &ShapeParams) -> Result<()> {
    let mut writer = csv::Writer::from_writer(create_writer(path)?);

    writer.write_record(["kind", "x", "y"])?;
    for [x, y] in outline.points() {
        writer.serialize(("measured", x, y))?;
    }
    for [x, y] in params.outline(MODEL_OUTLINE_RESOLUTION) {
        writer.serialize(("model", x, y))?;
    }
    writer.flush()?;

    Ok(())
}

/// Dumps the effective settings as TOML to `{output}/settings.toml`.
pub fn write_settings(settings: &Settings) -> Result<PathBuf> {
    let path = settings.output_dir.join("settings.toml");
    let text = toml::to_string_pretty(settings).context("failed to serialise settings")?;
    let mut writer = create_writer(&path)?;
    writer.write_all(text.as_bytes())?;
    writer.flush()?;
    Ok(path)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = create_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
