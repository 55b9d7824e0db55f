/// Number of metadata lines at the top of every outline file.
pub const HEADER_LINES: usize = 4;
/// Minimum number of vertices for a usable outline.
pub const MIN_OUTLINE_POINTS: usize = 3;
/// Default number of equal rotation sectors used as multi-start seeds.
pub const DEFAULT_ROTATION_SECTORS: usize = 9;
/// Smallest number of rotation sectors accepted by the settings validation.
pub const MIN_ROTATION_SECTORS: usize = 3;
/// Default range of harmonic orders tried by the full shape fit.
pub const DEFAULT_MIN_ORDER: u32 = 3;
pub const DEFAULT_MAX_ORDER: u32 = 9;
/// Initial guess for the ovality in the oval and shape fits.
pub const OVALITY_GUESS: f64 = 2.0;
/// Initial guess for the relative wave height in the shape fit.
pub const WAVE_HEIGHT_GUESS: f64 = 0.2;
/// Default upper bound for the ovality.
pub const MAX_OVALITY: f64 = 5.0;
/// Default upper bound for the relative wave height.
pub const MAX_WAVE_HEIGHT: f64 = 0.5;
/// Default upper bound for the wave shift; kept just below the half cycle.
pub const MAX_WAVE_SHIFT: f64 = 0.499;
/// Number of angles used when dumping model outlines.
pub const MODEL_OUTLINE_RESOLUTION: usize = 401;
/// Name of the synthetic batch that unions every other batch.
pub const ALL_BATCH: &str = "all";
/// Default extension of outline files inside a batch directory.
pub const DEFAULT_OUTLINE_EXTENSION: &str = "data";
