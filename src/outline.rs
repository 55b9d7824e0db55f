//! Measured particle outlines.
//!
//! Outline files are plain text: a fixed header of [`HEADER_LINES`] lines
//! followed by one `x y` vertex per line. Loading produces an [`Outline`]
//! and [`Outline::centered`] moves it onto its area centroid, precomputing
//! the polar coordinates the fits work with.

use std::path::{Path, PathBuf};

use geo::{Area, Centroid, Translate};
use geo_types::{Coord, LineString, Polygon};
use ndarray::Array1;
use ndarray_stats::QuantileExt;

use crate::config::{HEADER_LINES, MIN_OUTLINE_POINTS};
use crate::error::{MorphError, Result};


/// An ordered, closed polygon of measured vertices, without a repeated
/// closing vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    points: Vec<[f64; 2]>,
    source: PathBuf,
}

impl Outline {
    /// Loads an outline file, skipping the header.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| MorphError::io(path, e))?;
        Self::parse(&text, path)
    }

    /// Parses outline text; `path` is only used for error reporting.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut points = Vec::new();

        for (index, line) in text.lines().enumerate().skip(HEADER_LINES) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(MorphError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason: format!("expected 2 fields, found {}", fields.len()),
                });
            }

            let mut vertex = [0.0; 2];
            for (slot, field) in vertex.iter_mut().zip(fields) {
                *slot = match field.parse::<f64>() {
                    Ok(value) if value.is_finite() => value,
                    _ => {
                        return Err(MorphError::Parse {
                            path: path.to_path_buf(),
                            line: index + 1,
                            reason: format!("'{}' is not a finite number", field),
                        })
                    }
                };
            }
            points.push(vertex);
        }

        Self::with_source(points, path.to_path_buf())
    }

    /// Builds an outline from in-memory vertices.
    pub fn from_points(points: Vec<[f64; 2]>) -> Result<Self> {
        Self::with_source(points, PathBuf::from("<memory>"))
    }

    fn with_source(mut points: Vec<[f64; 2]>, source: PathBuf) -> Result<Self> {
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < MIN_OUTLINE_POINTS {
            return Err(MorphError::TooFewPoints {
                path: source,
                found: points.len(),
            });
        }
        Ok(Self { points, source })
    }

    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn polygon(&self) -> Polygon<f64> {
        to_polygon(self.points.iter().copied())
    }

    /// Translates the outline so its area centroid lies at the origin.
    pub fn centered(&self) -> Result<CenteredOutline> {
        let polygon = self.polygon();
        let degenerate = || MorphError::Degenerate {
            path: self.source.clone(),
        };

        if polygon.unsigned_area() <= 0.0 {
            return Err(degenerate());
        }
        let centroid = polygon.centroid().ok_or_else(degenerate)?;
        let centered = polygon.translate(-centroid.x(), -centroid.y());

        // the exterior ring is closed, drop the repeated first vertex
        let (x, y): (Vec<f64>, Vec<f64>) = centered
            .exterior()
            .coords()
            .take(self.points.len())
            .map(|c| (c.x, c.y))
            .unzip();
        let x = Array1::from(x);
        let y = Array1::from(y);
        let theta = ndarray::Zip::from(&y).and(&x).map_collect(|y, x| y.atan2(*x));
        let rho = ndarray::Zip::from(&x).and(&y).map_collect(|x, y| x.hypot(*y));
        let r_max = *rho.max().map_err(|_| degenerate())?;

        Ok(CenteredOutline {
            x,
            y,
            theta,
            rho,
            r_max,
            offset: [centroid.x(), centroid.y()],
        })
    }
}

/// An outline translated onto its area centroid, with polar coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CenteredOutline {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub theta: Array1<f64>, // polar angle of each vertex
    pub rho: Array1<f64>,   // polar radius of each vertex
    r_max: f64,
    offset: [f64; 2], // centroid of the raw outline
}

impl CenteredOutline {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Largest polar radius of the outline.
    pub fn r_max(&self) -> f64 {
        self.r_max
    }

    /// Centroid of the raw outline, i.e. the translation that was removed.
    pub fn offset(&self) -> [f64; 2] {
        self.offset
    }

    pub fn points(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
        self.x.iter().zip(self.y.iter()).map(|(x, y)| [*x, *y])
    }

    pub fn polygon(&self) -> Polygon<f64> {
        to_polygon(self.points())
    }
}

fn to_polygon(points: impl Iterator<Item = [f64; 2]>) -> Polygon<f64> {
    let exterior: Vec<Coord<f64>> = points.map(|[x, y]| Coord { x, y }).collect();
    Polygon::new(LineString(exterior), vec![])
}
