//! Radial velocity dealiasing.
//!
//! Velocities are mapped onto a torus (`sin`/`cos` of `π·m/Vny`), which makes
//! the azimuthal derivative independent of folding. A uniform horizontal wind
//! is fitted per height sector by linear least squares, and each cell is
//! unfolded by the multiple of `2·Vny` that brings it closest to the model.

use crate::core::diagnostics::Diagnostics;
use crate::core::quantizer::{quantize, sentinel_code, VALIDITY_GAIN};
use crate::io::container::{AttrValue, RadarContainer};
use crate::io::namelist::{DealiasParams, Settings};
use crate::types::{HeightSector, HoofResult, MeasurementVolume, Snapshot};
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array3};
use std::f64::consts::PI;

/// Per-cell torus mapping terms of a velocity volume
#[derive(Debug, Clone)]
pub struct WindCoefficients {
    pub a: Array3<f64>,
    pub b: Array3<f64>,
    pub f3: Array3<f64>,
    /// Azimuthal derivative of `f3`
    pub d: Array3<f64>,
}

/// Fits sector wind models to folded velocities
pub struct WindModelEstimator<'a> {
    params: &'a DealiasParams,
}

impl<'a> WindModelEstimator<'a> {
    pub fn new(params: &'a DealiasParams) -> Self {
        Self { params }
    }

    /// Compute A, B, F3 and the circular azimuth derivative D
    pub fn coefficients(&self, volume: &MeasurementVolume) -> WindCoefficients {
        let shape = volume.measurement.dim();
        let mut a = Array3::from_elem(shape, f64::NAN);
        let mut b = Array3::from_elem(shape, f64::NAN);
        let mut f3 = Array3::from_elem(shape, f64::NAN);

        for [el, az, r] in volume.cells() {
            let vny = volume.nyquist[el];
            let m = volume.measurement[[el, az, r]];
            let cos_el = volume.elevations[el].cos();
            let azimuth = volume.azimuths[[el, az]];
            let phase = PI * m / vny;

            a[[el, az, r]] = cos_el * azimuth.cos() * phase.sin();
            b[[el, az, r]] = cos_el * azimuth.sin() * phase.sin();
            f3[[el, az, r]] = vny * phase.cos() / PI;
        }

        let mut d = Array3::from_elem(shape, f64::NAN);
        for el in 0..volume.nel() {
            let naz = volume.naz[el];
            for az in 0..naz {
                let prev = (az + naz - 1) % naz;
                let next = (az + 1) % naz;
                // Neighbours across 0/2π are unwrapped onto the same turn
                let az_prev = volume.azimuths[[el, prev]] - if az == 0 { 2.0 * PI } else { 0.0 };
                let az_next = volume.azimuths[[el, next]] + if az == naz - 1 { 2.0 * PI } else { 0.0 };
                let daz = az_next - az_prev;

                for r in 0..volume.nr[el] {
                    d[[el, az, r]] = (f3[[el, next, r]] - f3[[el, prev, r]]) / daz;
                }
            }
        }

        WindCoefficients { a, b, f3, d }
    }

    /// Group usable cells into fixed-width height bands starting at the antenna
    pub fn height_sectors(
        &self,
        volume: &MeasurementVolume,
        antenna_height: f64,
        coefficients: &WindCoefficients,
    ) -> Vec<HeightSector> {
        let height = match volume.height.as_ref() {
            Some(h) => h,
            None => return Vec::new(),
        };

        let data_max = volume
            .cells()
            .map(|idx| height[idx])
            .filter(|z| !z.is_nan())
            .fold(f64::NEG_INFINITY, f64::max);
        let z_max = self.params.max_height.min(data_max);
        let dz = self.params.sector_height;
        if !z_max.is_finite() || !antenna_height.is_finite() || z_max < antenna_height {
            return Vec::new();
        }

        let count = ((z_max - antenna_height) / dz).floor() as usize + 1;
        let mut sectors: Vec<HeightSector> = (0..count)
            .map(|i| HeightSector {
                bottom: antenna_height + i as f64 * dz,
                top: antenna_height + (i + 1) as f64 * dz,
                cells: Vec::new(),
            })
            .collect();

        for idx in volume.cells() {
            let z = height[idx];
            if volume.measurement[idx].is_nan() || coefficients.d[idx].is_nan() || z.is_nan() {
                continue;
            }
            if z >= z_max || z < antenna_height {
                continue;
            }
            let sector = ((z - antenna_height) / dz).floor() as usize;
            if let Some(s) = sectors.get_mut(sector) {
                s.cells.push(idx);
            }
        }

        sectors
    }

    /// Least squares `(u, v)` of `D ≈ -A·u + B·v` for one sector
    pub fn fit(&self, coefficients: &WindCoefficients, sector: &HeightSector) -> Option<(f64, f64)> {
        let n = sector.cells.len();
        if n == 0 || n < self.params.min_points {
            return None;
        }

        let design = DMatrix::from_fn(n, 2, |i, j| {
            let idx = sector.cells[i];
            if j == 0 {
                -coefficients.a[idx]
            } else {
                coefficients.b[idx]
            }
        });
        let rhs = DVector::from_iterator(n, sector.cells.iter().map(|&idx| coefficients.d[idx]));

        let solution = design.svd(true, true).solve(&rhs, 1e-12).ok()?;
        let (u, v) = (solution[0], solution[1]);
        (u.is_finite() && v.is_finite()).then_some((u, v))
    }

    /// Reconstruct the wind model field from the sector fits
    pub fn wind_model(
        &self,
        volume: &MeasurementVolume,
        coefficients: &WindCoefficients,
        sectors: &[HeightSector],
    ) -> Array3<f64> {
        let mut model = Array3::from_elem(volume.measurement.dim(), f64::NAN);
        let mut fitted = 0;

        for sector in sectors {
            let (u, v) = match self.fit(coefficients, sector) {
                Some(wind) => wind,
                None => continue,
            };
            fitted += 1;
            log::debug!(
                "Sector {:.0}-{:.0} m: u = {:.2} m/s, v = {:.2} m/s from {} cells",
                sector.bottom,
                sector.top,
                u,
                v,
                sector.cells.len()
            );

            for &[el, az, r] in &sector.cells {
                let azimuth = volume.azimuths[[el, az]];
                let value = volume.elevations[el].cos() * (u * azimuth.sin() + v * azimuth.cos());
                if value.abs() <= self.params.max_wind {
                    model[[el, az, r]] = value;
                }
            }
        }

        log::info!("Fitted wind models in {} of {} height sectors", fitted, sectors.len());
        model
    }
}

/// Folding number in `[-limit, limit]` bringing `measured` closest to `model`.
///
/// Ties keep the most negative candidate.
pub fn best_fold(measured: f64, nyquist: f64, model: f64, limit: i64) -> i64 {
    let mut best = -limit;
    let mut best_residual = f64::INFINITY;
    for n in -limit..=limit {
        let residual = (measured + 2.0 * nyquist * n as f64 - model).abs();
        if residual < best_residual {
            best_residual = residual;
            best = n;
        }
    }
    best
}

/// Resolves the Nyquist ambiguity of every cell against the wind model
pub struct VelocityUnwrapper<'a> {
    params: &'a DealiasParams,
}

impl<'a> VelocityUnwrapper<'a> {
    pub fn new(params: &'a DealiasParams) -> Self {
        Self { params }
    }

    /// Largest folding number searched, from the smallest Nyquist velocity of the file
    pub fn fold_limit(&self, volume: &MeasurementVolume) -> i64 {
        let min_nyquist = volume
            .nyquist
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .fold(f64::INFINITY, f64::min);
        let limit = (self.params.max_wind / min_nyquist).floor();
        if limit.is_finite() && limit > 0.0 {
            limit as i64
        } else {
            0
        }
    }

    /// Dealiased velocities and the chosen folding numbers (NaN where undefined)
    pub fn unwrap(
        &self,
        volume: &MeasurementVolume,
        model: &Array3<f64>,
        coefficients: &WindCoefficients,
    ) -> (Array3<f64>, Array3<f64>) {
        let limit = self.fold_limit(volume);
        let shape = volume.measurement.dim();
        let mut dealiased = Array3::from_elem(shape, f64::NAN);
        let mut folding = Array3::from_elem(shape, f64::NAN);

        for idx in volume.cells() {
            let measured = volume.measurement[idx];
            let vny = volume.nyquist[idx[0]];
            if measured.is_nan() || model[idx].is_nan() || vny.is_nan() {
                continue;
            }

            let n = best_fold(measured, vny, model[idx], limit);
            folding[idx] = n as f64;
            if !coefficients.d[idx].is_nan() {
                dealiased[idx] = measured + 2.0 * n as f64 * vny;
            }
        }

        (dealiased, folding)
    }
}

/// Second pipeline stage: dealias the velocity volume and rewrite it
pub struct Dealiaser<'a> {
    settings: &'a Settings,
    diagnostics: Diagnostics,
}

impl<'a> Dealiaser<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            diagnostics: Diagnostics::new("Dealiasing"),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Record an error when there is nothing to dealias
    pub fn check_data(&mut self, snapshot: &Snapshot) {
        if snapshot.velocity.is_empty() {
            self.diagnostics.error("no VRAD datasets in file");
        } else if snapshot.velocity.all_undefined() {
            self.diagnostics.error("all data in VRAD datasets are NaN");
        }
    }

    /// Fit wind models and unfold the velocities into the snapshot
    pub fn dealias(&mut self, snapshot: &mut Snapshot) {
        let params = &self.settings.dealias;
        let estimator = WindModelEstimator::new(params);
        let coefficients = estimator.coefficients(&snapshot.velocity);
        let sectors = estimator.height_sectors(&snapshot.velocity, snapshot.antenna_height, &coefficients);
        let model = estimator.wind_model(&snapshot.velocity, &coefficients, &sectors);

        let (dealiased, folding) = VelocityUnwrapper::new(params).unwrap(&snapshot.velocity, &model, &coefficients);
        let unfolded = folding.iter().filter(|n| !n.is_nan() && **n != 0.0).count();
        log::info!("Dealiasing changed {} velocity cells", unfolded);

        snapshot.sectors = sectors;
        snapshot.wind_model = Some(model);
        snapshot.folding = Some(folding);
        snapshot.dealiased = Some(dealiased);
    }

    /// Write dealiased velocities and their validity to the homogenized file
    pub fn write(&mut self, snapshot: &Snapshot, target: &mut dyn RadarContainer) -> HoofResult<()> {
        let dealiased = match snapshot.dealiased.as_ref() {
            Some(d) => d,
            None => {
                self.diagnostics.error("no dealiased velocities to write");
                return Ok(());
            }
        };

        let volume = &snapshot.velocity;
        for (el, dataset) in volume.datasets.iter().enumerate() {
            let data_what = format!("{}/data1/what", dataset);
            let nodata = match target.attr_float(&data_what, "nodata")?.and_then(sentinel_code) {
                Some(code) => code,
                None => {
                    self.diagnostics.error(format!("attribute {}/nodata not found", data_what));
                    continue;
                }
            };

            let field = dealiased.slice(s![el, ..volume.naz[el], ..volume.nr[el]]);
            let encoded = quantize(field, nodata);

            target.set_attr(&data_what, "gain", &AttrValue::Float(encoded.gain))?;
            target.set_attr(&data_what, "offset", &AttrValue::Float(encoded.offset))?;
            target.set_raster(&format!("{}/data1", dataset), "data", &encoded.data)?;

            let quality_what = format!("{}/quality1/what", dataset);
            target.set_attr(&quality_what, "gain", &AttrValue::Float(VALIDITY_GAIN))?;
            target.set_attr(&quality_what, "offset", &AttrValue::Float(0.0))?;
            target.set_attr(&format!("{}/quality1/how", dataset), "task", &AttrValue::from("dealiasing"))?;
            target.set_raster(&format!("{}/quality1", dataset), "data", &encoded.validity)?;
        }

        target.flush()
    }
}
