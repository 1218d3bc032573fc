//! Decoding of homogenized rasters into dense measurement volumes

use crate::core::diagnostics::Diagnostics;
use crate::core::quantizer::{decode, sentinel_code};
use crate::core::resolver::AttributeResolver;
use crate::io::container::RadarContainer;
use crate::io::namelist::Settings;
use crate::types::{
    HoofResult, MeasurementKind, MeasurementVolume, QualityTask, Quantity, QuantityKind, Snapshot, EARTH_RADIUS,
    REFRACTION_FACTOR,
};
use ndarray::{Array2, Array3};

/// Beam height above sea level at slant range `range` (m) and elevation `elevation` (rad)
pub fn beam_height(range: f64, elevation: f64, antenna_height: f64) -> f64 {
    let kr = REFRACTION_FACTOR * EARTH_RADIUS;
    (range * range + kr * kr + range * 2.0 * kr * elevation.sin()).sqrt() - (kr - antenna_height)
}

/// Per-dataset scan geometry read from `where`
struct ScanGeometry {
    naz: usize,
    nr: usize,
    elevation: f64,
    rstart: f64,
    rscale: f64,
}

/// Builds the measurement snapshot from a homogenized file
pub struct VolumeLoader<'a> {
    settings: &'a Settings,
}

impl<'a> VolumeLoader<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Load reflectivity and velocity volumes. Missing metadata is recorded as an error.
    pub fn load(
        &self,
        resolver: &AttributeResolver,
        source: &dyn RadarContainer,
        target: &dyn RadarContainer,
        quantities: &[Quantity],
        diagnostics: &mut Diagnostics,
    ) -> HoofResult<Snapshot> {
        let antenna_height = match resolver.resolve_float(source, "where", "height")? {
            Some(h) => h,
            None => {
                diagnostics.error("antenna height where/height not found");
                f64::NAN
            }
        };

        let datasets_of = |kind: QuantityKind| -> Vec<String> {
            quantities
                .iter()
                .filter(|q| q.kind == kind)
                .filter_map(|q| q.target_dataset().map(str::to_string))
                .collect()
        };
        let dbz_datasets = datasets_of(QuantityKind::Dbz);
        let vrad_datasets = datasets_of(QuantityKind::Vrad);

        // Superobing gates reflectivity on the total quality index
        let quality_groups: Vec<Option<String>> = dbz_datasets
            .iter()
            .map(|dataset| {
                quantities
                    .iter()
                    .filter(|q| q.kind.is_quality() && q.task == Some(QualityTask::Total))
                    .find(|q| q.target_dataset() == Some(dataset.as_str()))
                    .and_then(|q| q.target.as_ref().map(|t| t.group.clone()))
            })
            .collect();

        let reflectivity = self.load_volume(
            target,
            MeasurementKind::Reflectivity,
            dbz_datasets,
            &quality_groups,
            antenna_height,
            diagnostics,
        )?;
        let velocity = self.load_volume(
            target,
            MeasurementKind::Velocity,
            vrad_datasets.clone(),
            &vec![None; vrad_datasets.len()],
            antenna_height,
            diagnostics,
        )?;

        log::info!(
            "Loaded {} reflectivity and {} velocity elevations",
            reflectivity.nel(),
            velocity.nel()
        );

        Ok(Snapshot {
            site: resolver.site().to_string(),
            antenna_height,
            reflectivity,
            velocity,
            sectors: Vec::new(),
            wind_model: None,
            folding: None,
            dealiased: None,
            superobed_reflectivity: None,
            superobed_velocity: None,
        })
    }

    fn load_volume(
        &self,
        target: &dyn RadarContainer,
        kind: MeasurementKind,
        datasets: Vec<String>,
        quality_groups: &[Option<String>],
        antenna_height: f64,
        diagnostics: &mut Diagnostics,
    ) -> HoofResult<MeasurementVolume> {
        let mut geometry = Vec::with_capacity(datasets.len());
        for dataset in &datasets {
            geometry.push(read_geometry(target, dataset, diagnostics)?);
        }

        let mut volume = MeasurementVolume::new(
            kind,
            datasets.clone(),
            geometry.iter().map(|g| g.elevation).collect(),
            geometry.iter().map(|g| g.naz).collect(),
            geometry.iter().map(|g| g.nr).collect(),
            geometry.iter().map(|g| g.rstart).collect(),
            geometry.iter().map(|g| g.rscale).collect(),
        );

        for (el, dataset) in datasets.iter().enumerate() {
            let data_group = format!("{}/data1", dataset);
            let nodata = match read_field(target, &data_group, &[], diagnostics)? {
                Some((values, nodata)) => {
                    fill(&mut volume.measurement, el, &values, volume.naz[el], volume.nr[el]);
                    nodata
                }
                None => None,
            };

            match kind {
                MeasurementKind::Reflectivity => {
                    if let Some((values, _)) = read_field(target, &format!("{}/data2", dataset), &[], diagnostics)? {
                        if let Some(auxiliary) = volume.auxiliary.as_mut() {
                            fill(auxiliary, el, &values, volume.naz[el], volume.nr[el]);
                        }
                    }

                    if !self.settings.superob.enabled {
                        continue;
                    }
                    // Quality rasters carry the no-data code of their DBZ
                    let undefined: Vec<u8> = nodata.into_iter().collect();
                    match quality_groups.get(el).cloned().flatten() {
                        Some(group) => {
                            let quality_group = format!("{}/{}", dataset, group);
                            if let Some(values) = read_quality(target, &quality_group, &undefined, diagnostics)? {
                                fill(&mut volume.quality, el, &values, volume.naz[el], volume.nr[el]);
                            }
                        }
                        None => diagnostics.warn(format!("{} has no TOTAL quality group", dataset)),
                    }
                }
                MeasurementKind::Velocity => {
                    match target.attr_float(&format!("{}/how", dataset), "NI")? {
                        Some(ni) => volume.nyquist[el] = ni,
                        None => diagnostics.error(format!("attribute {}/how/NI not found", dataset)),
                    }

                    if let Some(height) = volume.height.as_mut() {
                        for r in 0..volume.nr[el] {
                            let z = beam_height(volume.ranges[[el, r]], volume.elevations[el], antenna_height);
                            for az in 0..volume.naz[el] {
                                height[[el, az, r]] = z;
                            }
                        }
                    }
                }
            }
        }

        Ok(volume)
    }
}

fn read_geometry(target: &dyn RadarContainer, dataset: &str, diagnostics: &mut Diagnostics) -> HoofResult<ScanGeometry> {
    let group = format!("{}/where", dataset);
    let mut required = |name: &str| -> HoofResult<Option<f64>> {
        let value = target.attr_float(&group, name)?;
        if value.is_none() {
            diagnostics.error(format!("attribute {}/{} not found", group, name));
        }
        Ok(value)
    };

    let naz = required("nrays")?;
    let nr = required("nbins")?;
    let elevation = required("elangle")?;
    let rstart = required("rstart")?;
    let rscale = required("rscale")?;

    let count = |v: Option<f64>| v.filter(|x| *x > 0.0).map(|x| x as usize).unwrap_or(0);
    Ok(ScanGeometry {
        naz: count(naz),
        nr: count(nr),
        elevation: elevation.unwrap_or(f64::NAN).to_radians(),
        rstart: rstart.unwrap_or(0.0),
        rscale: rscale.unwrap_or(f64::NAN),
    })
}

/// Decode `<group>/data`; returns the values and the group's no-data code
fn read_field(
    target: &dyn RadarContainer,
    group: &str,
    extra_undefined: &[u8],
    diagnostics: &mut Diagnostics,
) -> HoofResult<Option<(Array2<f64>, Option<u8>)>> {
    let what = format!("{}/what", group);
    let gain = target.attr_float(&what, "gain")?;
    let offset = target.attr_float(&what, "offset")?;
    let nodata = target.attr_float(&what, "nodata")?;
    let undetect = target.attr_float(&what, "undetect")?;

    let (gain, offset, nodata, undetect) = match (gain, offset, nodata, undetect) {
        (Some(g), Some(o), Some(n), Some(u)) => (g, o, n, u),
        _ => {
            diagnostics.error(format!("gain, offset, nodata or undetect not found in {}", what));
            return Ok(None);
        }
    };

    let raw = match target.raster(group, "data")? {
        Some(raw) => raw,
        None => {
            diagnostics.error(format!("raster {}/data not found", group));
            return Ok(None);
        }
    };

    let nodata = sentinel_code(nodata);
    let mut undefined: Vec<u8> = [nodata, sentinel_code(undetect)].into_iter().flatten().collect();
    undefined.extend_from_slice(extra_undefined);
    Ok(Some((decode(raw.view(), gain, offset, &undefined), nodata)))
}

fn read_quality(
    target: &dyn RadarContainer,
    group: &str,
    undefined: &[u8],
    diagnostics: &mut Diagnostics,
) -> HoofResult<Option<Array2<f64>>> {
    let what = format!("{}/what", group);
    let (gain, offset) = match (target.attr_float(&what, "gain")?, target.attr_float(&what, "offset")?) {
        (Some(g), Some(o)) => (g, o),
        _ => {
            diagnostics.error(format!("gain or offset not found in {}", what));
            return Ok(None);
        }
    };
    match target.raster(group, "data")? {
        Some(raw) => Ok(Some(decode(raw.view(), gain, offset, undefined))),
        None => {
            diagnostics.error(format!("raster {}/data not found", group));
            Ok(None)
        }
    }
}

/// Copy decoded values into one elevation, within both the raster and the logical extent
fn fill(field: &mut Array3<f64>, el: usize, values: &Array2<f64>, naz: usize, nr: usize) {
    let rows = naz.min(values.nrows());
    let cols = nr.min(values.ncols());
    for az in 0..rows {
        for r in 0..cols {
            field[[el, az, r]] = values[[az, r]];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryContainer;
    use crate::types::GroupLocation;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_beam_height_at_antenna() {
        assert_abs_diff_eq!(beam_height(0.0, 0.1, 250.0), 250.0, epsilon = 1e-6);
        // 100 km at 0.5 deg: roughly 873 m beam rise plus 588 m earth curvature
        let z = beam_height(100_000.0, 0.5f64.to_radians(), 0.0);
        assert!(z > 1400.0 && z < 1500.0, "{}", z);
    }

    fn velocity_file(nyquist: Option<f64>) -> MemoryContainer {
        let raw = Array2::from_shape_vec((2, 3), vec![0u8, 128, 255, 10, 20, 30]).unwrap();
        let container = match nyquist {
            Some(ni) => MemoryContainer::new().with_attr("dataset1/how", "NI", ni),
            None => MemoryContainer::new(),
        };
        container
            .with_attr("dataset1/where", "nrays", 2i64)
            .with_attr("dataset1/where", "nbins", 3i64)
            .with_attr("dataset1/where", "elangle", 0.5)
            .with_attr("dataset1/where", "rstart", 0.0)
            .with_attr("dataset1/where", "rscale", 500.0)
            .with_attr("dataset1/data1/what", "gain", 0.5)
            .with_attr("dataset1/data1/what", "offset", -64.0)
            .with_attr("dataset1/data1/what", "nodata", 255.0)
            .with_attr("dataset1/data1/what", "undetect", 0.0)
            .with_raster("dataset1/data1", "data", raw)
    }

    #[test]
    fn test_load_velocity_volume() {
        let settings = Settings::default();
        let resolver = AttributeResolver::new(&settings, "11812");
        let source = MemoryContainer::new().with_attr("where", "height", 120.0);
        let target = velocity_file(Some(13.0));
        let quantities = vec![Quantity {
            kind: QuantityKind::Vrad,
            elevation: 0.5,
            start: "20240601120000".into(),
            task: None,
            source: GroupLocation::new("dataset1", "data1"),
            target: Some(GroupLocation::new("dataset1", "data1")),
        }];

        let mut diagnostics = Diagnostics::new("Homogenization");
        let snapshot = VolumeLoader::new(&settings)
            .load(&resolver, &source, &target, &quantities, &mut diagnostics)
            .unwrap();

        assert!(!diagnostics.has_errors(), "{:?}", diagnostics.errors());
        let velocity = &snapshot.velocity;
        assert_eq!(velocity.nel(), 1);
        assert!(snapshot.reflectivity.is_empty());
        assert_abs_diff_eq!(snapshot.antenna_height, 120.0);
        assert_abs_diff_eq!(velocity.nyquist[0], 13.0);
        assert_abs_diff_eq!(velocity.elevations[0], 0.5f64.to_radians(), epsilon = 1e-12);
        assert!(velocity.measurement[[0, 0, 0]].is_nan());
        assert_abs_diff_eq!(velocity.measurement[[0, 0, 1]], 0.0);
        assert!(velocity.measurement[[0, 0, 2]].is_nan());
        assert_abs_diff_eq!(velocity.measurement[[0, 1, 2]], -49.0);

        let height = velocity.height.as_ref().unwrap();
        assert_abs_diff_eq!(height[[0, 1, 0]], 120.0, epsilon = 1e-6);
        assert!(height[[0, 1, 2]] > height[[0, 1, 1]]);
    }

    #[test]
    fn test_missing_nyquist_is_error() {
        let settings = Settings::default();
        let resolver = AttributeResolver::new(&settings, "11812");
        let source = MemoryContainer::new().with_attr("where", "height", 120.0);
        let target = velocity_file(None);
        let quantities = vec![Quantity {
            kind: QuantityKind::Vrad,
            elevation: 0.5,
            start: "20240601120000".into(),
            task: None,
            source: GroupLocation::new("dataset1", "data1"),
            target: Some(GroupLocation::new("dataset1", "data1")),
        }];

        let mut diagnostics = Diagnostics::new("Homogenization");
        VolumeLoader::new(&settings)
            .load(&resolver, &source, &target, &quantities, &mut diagnostics)
            .unwrap();
        assert_eq!(diagnostics.errors(), ["attribute dataset1/how/NI not found"]);
    }
}
