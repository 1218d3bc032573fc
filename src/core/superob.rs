//! Superobing: quality-gated averaging onto coarse polar bins.

use crate::core::bins::{BinLayout, BinPlanner};
use crate::core::diagnostics::Diagnostics;
use crate::core::quantizer::{quantize, sentinel_code, VALIDITY_GAIN};
use crate::io::container::{AttrValue, RadarContainer};
use crate::io::namelist::{Settings, SuperobParams};
use crate::types::{HoofResult, MeasurementVolume, Snapshot, TH_SENTINEL_CUTOFF, VRAD_SENTINEL_CUTOFF};
use ndarray::{s, Array2, Array3};

/// No-data code of superobed velocities
const VRAD_NODATA: u8 = 255;

/// Circularly shift every elevation of `field` by `shift` rays: `rolled[(j + shift) % naz] = field[j]`
pub fn rotate(field: &Array3<f64>, volume: &MeasurementVolume, shift: usize) -> Array3<f64> {
    let mut rolled = Array3::from_elem(field.dim(), f64::NAN);
    for el in 0..volume.nel() {
        let naz = volume.naz[el];
        for az in 0..naz {
            let to = (az + shift) % naz;
            for r in 0..volume.nr[el] {
                rolled[[el, to, r]] = field[[el, az, r]];
            }
        }
    }
    rolled
}

/// Averaged reflectivity of one coarse bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectivityBin {
    pub value: f64,
    /// Mean total reflectivity of the wet cells, NaN when none had one
    pub auxiliary: f64,
}

/// Per-bin averaging rules for reflectivity and velocity
pub struct Aggregator<'a> {
    params: &'a SuperobParams,
}

impl<'a> Aggregator<'a> {
    pub fn new(params: &'a SuperobParams) -> Self {
        Self { params }
    }

    /// Reflectivity of coarse bin `(j, k)` of elevation `el`, on rotated fields.
    ///
    /// Cells above the quality threshold are wet when above the clear-sky
    /// threshold, dry otherwise. Enough wet cells give their mean; otherwise
    /// any dry cell confirms clear sky and yields `clear_sky_value`.
    #[allow(clippy::too_many_arguments)]
    pub fn reflectivity_bin(
        &self,
        measurement: &Array3<f64>,
        auxiliary: &Array3<f64>,
        quality: &Array3<f64>,
        layout: &BinLayout,
        el: usize,
        j: usize,
        k: usize,
        clear_sky_value: f64,
    ) -> Option<ReflectivityBin> {
        let (r0, r1) = layout.range_span(j);
        let (a0, a1) = layout.azimuth_span(j, k);

        let mut wet = 0usize;
        let mut dry = 0usize;
        let mut wet_sum = 0.0;
        let mut aux_count = 0usize;
        let mut aux_sum = 0.0;

        for az in a0..a1 {
            for r in r0..r1 {
                let idx = [el, az, r];
                let trusted = quality[idx] > self.params.dbz_min_quality;
                if !trusted {
                    continue;
                }
                let d = measurement[idx];
                if d > self.params.dbz_clear_sky {
                    wet += 1;
                    wet_sum += d;
                    let t = auxiliary[idx];
                    if t < TH_SENTINEL_CUTOFF {
                        aux_count += 1;
                        aux_sum += t;
                    }
                } else {
                    dry += 1;
                }
            }
        }

        let total = layout.cell_count(j, k) as f64;
        if wet > 0 && wet as f64 >= self.params.dbz_min_fraction * total {
            Some(ReflectivityBin {
                value: wet_sum / wet as f64,
                auxiliary: if aux_count > 0 {
                    aux_sum / aux_count as f64
                } else {
                    f64::NAN
                },
            })
        } else if dry > 0 {
            Some(ReflectivityBin {
                value: clear_sky_value,
                auxiliary: f64::NAN,
            })
        } else {
            None
        }
    }

    /// Mean velocity of coarse bin `(j, k)`, if enough cells agree closely enough
    pub fn velocity_bin(&self, velocity: &Array3<f64>, layout: &BinLayout, el: usize, j: usize, k: usize) -> Option<f64> {
        let (r0, r1) = layout.range_span(j);
        let (a0, a1) = layout.azimuth_span(j, k);

        let mut good = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for az in a0..a1 {
            for r in r0..r1 {
                let v = velocity[[el, az, r]];
                if v < VRAD_SENTINEL_CUTOFF {
                    good += 1;
                    sum += v;
                    sum_sq += v * v;
                }
            }
        }

        if good == 0 {
            return None;
        }
        let mean = sum / good as f64;
        let variance = (sum_sq - sum * mean) / good as f64;
        let std = if variance > 0.0 { variance.sqrt() } else { 0.0 };

        let total = layout.cell_count(j, k) as f64;
        (good as f64 >= self.params.vrad_min_fraction * total && std < self.params.vrad_max_std).then_some(mean)
    }

    /// Superob a reflectivity volume. Clear-sky bins get the file-wide minimum reflectivity.
    pub fn superob_reflectivity(&self, volume: &MeasurementVolume) -> MeasurementVolume {
        let planner = BinPlanner::new(self.params);
        let shift = planner.sub_rays();
        let mut coarse = volume.coarsened(self.params.range_factor, self.params.azimuth_factor);

        let empty = Array3::from_elem(volume.measurement.dim(), f64::NAN);
        let measurement = rotate(&volume.measurement, volume, shift);
        let auxiliary = rotate(volume.auxiliary.as_ref().unwrap_or(&empty), volume, shift);
        let quality = rotate(&volume.quality, volume, shift);
        let clear_sky_value = volume.min_measurement();

        for el in 0..volume.nel() {
            let layout = planner.plan(volume.naz[el], volume.nr[el], volume.rscale[el]);
            for j in 0..layout.n_range() {
                for k in 0..layout.n_azimuth() {
                    let bin = self.reflectivity_bin(
                        &measurement,
                        &auxiliary,
                        &quality,
                        &layout,
                        el,
                        j,
                        k,
                        clear_sky_value,
                    );
                    if let Some(bin) = bin {
                        coarse.measurement[[el, k, j]] = bin.value;
                        if let Some(aux) = coarse.auxiliary.as_mut() {
                            aux[[el, k, j]] = bin.auxiliary;
                        }
                        coarse.quality[[el, k, j]] = 1.0;
                    }
                }
            }
        }
        coarse
    }

    /// Superob `field` on the geometry of a velocity volume
    pub fn superob_velocity(&self, volume: &MeasurementVolume, field: &Array3<f64>) -> MeasurementVolume {
        let planner = BinPlanner::new(self.params);
        let mut coarse = volume.coarsened(self.params.range_factor, self.params.azimuth_factor);
        let velocity = rotate(field, volume, planner.sub_rays());

        for el in 0..volume.nel() {
            let layout = planner.plan(volume.naz[el], volume.nr[el], volume.rscale[el]);
            for j in 0..layout.n_range() {
                for k in 0..layout.n_azimuth() {
                    if let Some(mean) = self.velocity_bin(&velocity, &layout, el, j, k) {
                        coarse.measurement[[el, k, j]] = mean;
                        coarse.quality[[el, k, j]] = 1.0;
                    }
                }
            }
        }
        coarse
    }
}

/// Third pipeline stage: superob both volumes and rewrite the homogenized file
pub struct Superober<'a> {
    settings: &'a Settings,
    diagnostics: Diagnostics,
}

impl<'a> Superober<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            diagnostics: Diagnostics::new("Superobing"),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Record an error when there is nothing to superob
    pub fn check_data(&mut self, snapshot: &Snapshot) {
        let dbz = &snapshot.reflectivity;
        let vrad = &snapshot.velocity;
        if dbz.is_empty() && vrad.is_empty() {
            self.diagnostics.error("no data to superob");
            return;
        }

        let dbz_nan = dbz.all_undefined();
        let vrad_nan = vrad.all_undefined();
        if dbz_nan && vrad_nan {
            self.diagnostics.error("all data is NaN");
        } else if dbz_nan {
            self.diagnostics.warn("all DBZ data is NaN");
        } else if vrad_nan {
            self.diagnostics.warn("all VRAD data is NaN");
        }
    }

    /// Fill the superobed volumes of the snapshot
    pub fn superob(&mut self, snapshot: &mut Snapshot) {
        let aggregator = Aggregator::new(&self.settings.superob);

        let reflectivity = aggregator.superob_reflectivity(&snapshot.reflectivity);

        let field = match snapshot.dealiased.as_ref() {
            Some(dealiased) if self.settings.dealias.enabled => dealiased,
            _ => &snapshot.velocity.measurement,
        };
        let velocity = aggregator.superob_velocity(&snapshot.velocity, field);

        let defined = |v: &MeasurementVolume| v.cells().filter(|&idx| !v.measurement[idx].is_nan()).count();
        log::info!(
            "Superobed {} reflectivity and {} velocity bins",
            defined(&reflectivity),
            defined(&velocity)
        );

        snapshot.superobed_reflectivity = Some(reflectivity);
        snapshot.superobed_velocity = Some(velocity);
    }

    /// Overwrite measurements and geometry with the superobed volumes
    pub fn write(&mut self, snapshot: &Snapshot, target: &mut dyn RadarContainer) -> HoofResult<()> {
        if let Some(reflectivity) = snapshot.superobed_reflectivity.as_ref() {
            for el in 0..reflectivity.nel() {
                self.write_reflectivity(reflectivity, el, target)?;
            }
        }
        if let Some(velocity) = snapshot.superobed_velocity.as_ref() {
            for el in 0..velocity.nel() {
                self.write_velocity(velocity, el, target)?;
            }
        }
        target.flush()
    }

    fn write_reflectivity(
        &mut self,
        volume: &MeasurementVolume,
        el: usize,
        target: &mut dyn RadarContainer,
    ) -> HoofResult<()> {
        let dataset = &volume.datasets[el];
        let (naz, nr) = (volume.naz[el], volume.nr[el]);

        let nodata_dbz = self.nodata(target, &format!("{}/data1/what", dataset))?;
        let nodata_th = self.nodata(target, &format!("{}/data2/what", dataset))?;
        let (nodata_dbz, nodata_th) = match (nodata_dbz, nodata_th) {
            (Some(d), Some(t)) => (d, t),
            _ => return Ok(()),
        };

        let dbz = quantize(volume.measurement.slice(s![el, ..naz, ..nr]), nodata_dbz);
        let th = match volume.auxiliary.as_ref() {
            Some(aux) => quantize(aux.slice(s![el, ..naz, ..nr]), nodata_th),
            None => quantize(Array2::from_elem((naz, nr), f64::NAN).view(), nodata_th),
        };

        write_geometry(target, dataset, naz, nr, volume.rscale[el])?;
        target.set_attr(&format!("{}/data1/what", dataset), "undetect", &AttrValue::Float(0.0))?;
        write_scaling(target, &format!("{}/data1/what", dataset), dbz.gain, dbz.offset)?;
        write_scaling(target, &format!("{}/data2/what", dataset), th.gain, th.offset)?;
        write_validity(target, dataset)?;

        target.set_raster(&format!("{}/data1", dataset), "data", &dbz.data)?;
        target.set_raster(&format!("{}/data2", dataset), "data", &th.data)?;
        target.set_raster(&format!("{}/quality1", dataset), "data", &dbz.validity)?;
        Ok(())
    }

    fn write_velocity(&mut self, volume: &MeasurementVolume, el: usize, target: &mut dyn RadarContainer) -> HoofResult<()> {
        let dataset = &volume.datasets[el];
        let (naz, nr) = (volume.naz[el], volume.nr[el]);
        let vrad = quantize(volume.measurement.slice(s![el, ..naz, ..nr]), VRAD_NODATA);

        let data_what = format!("{}/data1/what", dataset);
        write_geometry(target, dataset, naz, nr, volume.rscale[el])?;
        target.set_attr(&data_what, "undetect", &AttrValue::Float(0.0))?;
        target.set_attr(&data_what, "nodata", &AttrValue::Float(VRAD_NODATA as f64))?;
        write_scaling(target, &data_what, vrad.gain, vrad.offset)?;
        write_validity(target, dataset)?;

        target.set_raster(&format!("{}/data1", dataset), "data", &vrad.data)?;
        target.set_raster(&format!("{}/quality1", dataset), "data", &vrad.validity)?;
        Ok(())
    }

    fn nodata(&mut self, target: &dyn RadarContainer, group: &str) -> HoofResult<Option<u8>> {
        let code = target.attr_float(group, "nodata")?.and_then(sentinel_code);
        if code.is_none() {
            self.diagnostics.error(format!("attribute {}/nodata not found", group));
        }
        Ok(code)
    }
}

fn write_geometry(target: &mut dyn RadarContainer, dataset: &str, naz: usize, nr: usize, rscale: f64) -> HoofResult<()> {
    let group = format!("{}/where", dataset);
    target.set_attr(&group, "nbins", &AttrValue::Int(nr as i64))?;
    target.set_attr(&group, "nrays", &AttrValue::Int(naz as i64))?;
    target.set_attr(&group, "rscale", &AttrValue::Float(rscale))
}

fn write_scaling(target: &mut dyn RadarContainer, group: &str, gain: f64, offset: f64) -> HoofResult<()> {
    target.set_attr(group, "gain", &AttrValue::Float(gain))?;
    target.set_attr(group, "offset", &AttrValue::Float(offset))
}

fn write_validity(target: &mut dyn RadarContainer, dataset: &str) -> HoofResult<()> {
    write_scaling(target, &format!("{}/quality1/what", dataset), VALIDITY_GAIN, 0.0)?;
    target.set_attr(&format!("{}/quality1/how", dataset), "task", &AttrValue::from("superobing"))
}
