use ndarray::{Array2, Array3};
use std::f64::consts::PI;
use std::fmt;

/// Earth radius used for beam height computation (m)
pub const EARTH_RADIUS: f64 = 6_371_200.0;

/// Equivalent-earth refraction factor
pub const REFRACTION_FACTOR: f64 = 4.0 / 3.0;

/// Elevation angles are rounded to this step (degrees)
pub const ELEVATION_STEP: f64 = 0.1;

/// Auxiliary (TH) values at or above this are treated as fill values
pub const TH_SENTINEL_CUTOFF: f64 = 100_000.0;

/// Velocity values at or above this are treated as fill values
pub const VRAD_SENTINEL_CUTOFF: f64 = 1_000_000.0;

/// Round an elevation angle in degrees to the canonical 0.1 degree grid
pub fn round_elevation(degrees: f64) -> f64 {
    (degrees / ELEVATION_STEP).round() * ELEVATION_STEP
}

/// `n` uniformly spaced azimuths over [0, 2π)
pub fn uniform_azimuths(n: usize) -> Vec<f64> {
    (0..n).map(|i| 2.0 * PI * i as f64 / n as f64).collect()
}

/// Canonical quantity kinds written to homogenized files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantityKind {
    Dbz,
    Th,
    Vrad,
    /// Quality group, numbered per source dataset
    Quality(u32),
}

impl QuantityKind {
    pub fn is_quality(&self) -> bool {
        matches!(self, QuantityKind::Quality(_))
    }
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityKind::Dbz => write!(f, "DBZ"),
            QuantityKind::Th => write!(f, "TH"),
            QuantityKind::Vrad => write!(f, "VRAD"),
            QuantityKind::Quality(n) => write!(f, "QUALITY{}", n),
        }
    }
}

/// Processing task that produced a quality group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityTask {
    Ropo,
    Block,
    Sat,
    Total,
}

impl QualityTask {
    /// Map a free-form `how/task` attribute onto a known task
    pub fn from_task_attribute(task: &str) -> Option<Self> {
        if task.contains("ropo") {
            Some(QualityTask::Ropo)
        } else if task.contains("beamblockage") {
            Some(QualityTask::Block)
        } else if task.contains("satfilter") {
            Some(QualityTask::Sat)
        } else if task.contains("qi_total") {
            Some(QualityTask::Total)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityTask::Ropo => "ROPO",
            QualityTask::Block => "BLOCK",
            QualityTask::Sat => "SAT",
            QualityTask::Total => "TOTAL",
        }
    }
}

impl fmt::Display for QualityTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dataset group plus data/quality subgroup inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLocation {
    pub dataset: String,
    pub group: String,
}

impl GroupLocation {
    pub fn new(dataset: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            group: group.into(),
        }
    }

    /// Path of the data/quality subgroup, e.g. `dataset1/data2`
    pub fn path(&self) -> String {
        format!("{}/{}", self.dataset, self.group)
    }
}

/// One data or quality group of a source file
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub kind: QuantityKind,
    /// Elevation angle in degrees, rounded to 0.1
    pub elevation: f64,
    /// Scan start as `YYYYMMDDHHMMSS`
    pub start: String,
    pub task: Option<QualityTask>,
    pub source: GroupLocation,
    pub target: Option<GroupLocation>,
}

impl Quantity {
    /// Same elevation (on the 0.1 degree grid) and same start time
    pub fn same_scan(&self, other: &Quantity) -> bool {
        (self.elevation - other.elevation).abs() < ELEVATION_STEP / 2.0 && self.start == other.start
    }

    pub fn target_dataset(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.dataset.as_str())
    }
}

/// Measurement kind held by a [`MeasurementVolume`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Reflectivity,
    Velocity,
}

/// Dense `[elevation][azimuth][range]` representation of one measurement kind.
///
/// Arrays are sized to the largest azimuth/range count over all elevations;
/// cells beyond `naz[el]`/`nr[el]` are NaN and must not be visited.
#[derive(Debug, Clone)]
pub struct MeasurementVolume {
    pub kind: MeasurementKind,
    /// Homogenized dataset group of every elevation
    pub datasets: Vec<String>,
    /// Elevation angles in radians
    pub elevations: Vec<f64>,
    pub naz: Vec<usize>,
    pub nr: Vec<usize>,
    pub rstart: Vec<f64>,
    pub rscale: Vec<f64>,
    /// Nyquist velocity per elevation (velocity only, NaN otherwise)
    pub nyquist: Vec<f64>,
    pub azimuths: Array2<f64>,
    pub ranges: Array2<f64>,
    pub measurement: Array3<f64>,
    /// Total reflectivity (reflectivity only)
    pub auxiliary: Option<Array3<f64>>,
    pub quality: Array3<f64>,
    /// Beam height above sea level (velocity only)
    pub height: Option<Array3<f64>>,
}

impl MeasurementVolume {
    /// Allocate a volume with NaN fields and the azimuth/range axes filled in
    pub fn new(
        kind: MeasurementKind,
        datasets: Vec<String>,
        elevations: Vec<f64>,
        naz: Vec<usize>,
        nr: Vec<usize>,
        rstart: Vec<f64>,
        rscale: Vec<f64>,
    ) -> Self {
        let nel = datasets.len();
        let max_az = naz.iter().copied().max().unwrap_or(0);
        let max_r = nr.iter().copied().max().unwrap_or(0);

        let mut azimuths = Array2::from_elem((nel, max_az), f64::NAN);
        let mut ranges = Array2::from_elem((nel, max_r), f64::NAN);
        for el in 0..nel {
            for (j, az) in uniform_azimuths(naz[el]).into_iter().enumerate() {
                azimuths[[el, j]] = az;
            }
            for k in 0..nr[el] {
                ranges[[el, k]] = rstart[el] + k as f64 * rscale[el];
            }
        }

        let shape = (nel, max_az, max_r);
        Self {
            kind,
            datasets,
            elevations,
            naz,
            nr,
            rstart,
            rscale,
            nyquist: vec![f64::NAN; nel],
            azimuths,
            ranges,
            measurement: Array3::from_elem(shape, f64::NAN),
            auxiliary: match kind {
                MeasurementKind::Reflectivity => Some(Array3::from_elem(shape, f64::NAN)),
                MeasurementKind::Velocity => None,
            },
            quality: Array3::from_elem(shape, f64::NAN),
            height: match kind {
                MeasurementKind::Reflectivity => None,
                MeasurementKind::Velocity => Some(Array3::from_elem(shape, f64::NAN)),
            },
        }
    }

    /// Number of elevations
    pub fn nel(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Iterate `[el, az, r]` indices inside every elevation's logical extent
    pub fn cells(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        (0..self.nel()).flat_map(move |el| {
            (0..self.naz[el]).flat_map(move |az| (0..self.nr[el]).map(move |r| [el, az, r]))
        })
    }

    /// True when no cell inside the logical extents holds a value
    pub fn all_undefined(&self) -> bool {
        self.cells().all(|idx| self.measurement[idx].is_nan())
    }

    /// Smallest defined measurement, NaN when none is defined
    pub fn min_measurement(&self) -> f64 {
        self.cells()
            .map(|idx| self.measurement[idx])
            .filter(|v| !v.is_nan())
            .fold(f64::NAN, f64::min)
    }

    /// Empty volume with the same elevations at a coarser resolution
    pub fn coarsened(&self, factor_r: usize, factor_a: usize) -> Self {
        let naz = self.naz.iter().map(|n| n / factor_a).collect();
        let nr = self.nr.iter().map(|n| n / factor_r).collect();
        let rscale = self.rscale.iter().map(|s| s * factor_r as f64).collect();
        let mut coarse = Self::new(
            self.kind,
            self.datasets.clone(),
            self.elevations.clone(),
            naz,
            nr,
            self.rstart.clone(),
            rscale,
        );
        coarse.nyquist = self.nyquist.clone();
        coarse
    }
}

/// Height band holding the `[el, az, r]` cells used for one wind fit
#[derive(Debug, Clone, Default)]
pub struct HeightSector {
    /// Lower edge of the band (m)
    pub bottom: f64,
    /// Upper edge of the band (m)
    pub top: f64,
    pub cells: Vec<[usize; 3]>,
}

/// Per-file state shared by the homogenization, dealiasing and superobing stages
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub site: String,
    /// Antenna height above sea level (m)
    pub antenna_height: f64,
    pub reflectivity: MeasurementVolume,
    pub velocity: MeasurementVolume,
    pub sectors: Vec<HeightSector>,
    pub wind_model: Option<Array3<f64>>,
    /// Chosen folding number per cell (NaN where none was chosen)
    pub folding: Option<Array3<f64>>,
    pub dealiased: Option<Array3<f64>>,
    pub superobed_reflectivity: Option<MeasurementVolume>,
    pub superobed_velocity: Option<MeasurementVolume>,
}

/// Error types for radar volume processing
#[derive(Debug, thiserror::Error)]
pub enum HoofError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Namelist error: {0}")]
    Namelist(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for radar volume operations
pub type HoofResult<T> = Result<T, HoofError>;
