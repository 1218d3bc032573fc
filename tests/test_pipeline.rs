use approx::assert_abs_diff_eq;
use hoof::io::container::{RadarContainer, SubgroupKind};
use hoof::{process_volume, FileStatus, MemoryContainer, Settings};
use ndarray::Array2;

const NAMELIST: &str = "\
[File extensions to read]
{.h5}

[Radar moment names to save]
DBZ = {DBZH DBZ}
TH = {TH}
VRAD = {VRAD VRADH}

[Required DBZ moment quality groups]
{ROPO TOTAL}

[Common attributes and default values]
S /what/object = PVOL
S /what/source = None
F /where/height = None
S /dataset/what/startdate = None
S /dataset/what/starttime = None
F /dataset/where/elangle = None
I /dataset/where/nrays = None
I /dataset/where/nbins = None
F /dataset/where/rstart = 0
F /dataset/where/rscale = None
F /dataset/how/NI = None
S /dataset/data/what/quantity = None
F /dataset/data/what/gain = None
F /dataset/data/what/offset = None
F /dataset/data/what/nodata = 255
F /dataset/data/what/undetect = 0
F /dataset/quality/what/gain = None
F /dataset/quality/what/offset = 0
S /dataset/quality/how/task = None

[Height sector size in m]
200
[Minimum good points in height sector]
10
[Range bin factor]
2
[Ray angle factor]
3
[Max arc size in m]
1000000000
[DBZ min quality]
0.5
[DBZ clear sky threshold]
5
[DBZ min percentage of good points]
0.5
[VRAD min percentage of good points]
0.5
[VRAD max standard deviation]
10
";

const DBZ_RAYS: usize = 12;
const DBZ_BINS: usize = 8;
const VRAD_RAYS: usize = 36;
const VRAD_BINS: usize = 10;

fn settings(dealias: bool, superob: bool) -> Settings {
    let mut settings = Settings::parse(NAMELIST).unwrap();
    settings.dealias.enabled = dealias;
    settings.superob.enabled = superob;
    settings
}

fn root() -> MemoryContainer {
    MemoryContainer::new()
        .with_attr("", "Conventions", "ODIM_H5/V2_2")
        .with_attr("what", "object", "PVOL")
        .with_attr("what", "source", "WMO:11812,NOD:skjav")
        .with_attr("where", "height", 100.0)
}

fn scan(c: MemoryContainer, dataset: &str, time: &str, rays: usize, bins: usize) -> MemoryContainer {
    c.with_attr(&format!("{}/where", dataset), "elangle", 0.5)
        .with_attr(&format!("{}/where", dataset), "nrays", rays as i64)
        .with_attr(&format!("{}/where", dataset), "nbins", bins as i64)
        .with_attr(&format!("{}/where", dataset), "rstart", 0.0)
        .with_attr(&format!("{}/where", dataset), "rscale", 1000.0)
        .with_attr(&format!("{}/what", dataset), "startdate", "20240601")
        .with_attr(&format!("{}/what", dataset), "starttime", time)
        .with_attr(&format!("{}/how", dataset), "NI", 20.0)
}

fn moment(c: MemoryContainer, group: &str, quantity: &str, gain: f64, offset: f64, raster: Array2<u8>) -> MemoryContainer {
    c.with_attr(&format!("{}/what", group), "quantity", quantity)
        .with_attr(&format!("{}/what", group), "gain", gain)
        .with_attr(&format!("{}/what", group), "offset", offset)
        .with_attr(&format!("{}/what", group), "nodata", 255.0)
        .with_attr(&format!("{}/what", group), "undetect", 0.0)
        .with_raster(group, "data", raster)
}

fn quality(c: MemoryContainer, group: &str, task: &str, code: u8, rays: usize, bins: usize) -> MemoryContainer {
    c.with_attr(&format!("{}/what", group), "gain", 1.0 / 255.0)
        .with_attr(&format!("{}/what", group), "offset", 0.0)
        .with_attr(&format!("{}/how", group), "task", task)
        .with_raster(group, "data", Array2::from_elem((rays, bins), code))
}

/// Reflectivity rising by 2 dBZ per range bin from 18 dBZ, TH 23 dBZ, with ROPO and TOTAL quality
fn reflectivity(c: MemoryContainer, dataset: &str, time: &str) -> MemoryContainer {
    let dbz = Array2::from_shape_fn((DBZ_RAYS, DBZ_BINS), |(_, r)| 100 + 4 * r as u8);
    let th = Array2::from_elem((DBZ_RAYS, DBZ_BINS), 110u8);
    let c = scan(c, dataset, time, DBZ_RAYS, DBZ_BINS);
    let c = moment(c, &format!("{}/data1", dataset), "DBZH", 0.5, -32.0, dbz);
    let c = moment(c, &format!("{}/data2", dataset), "TH", 0.5, -32.0, th);
    let c = quality(c, &format!("{}/quality1", dataset), "fi.fmi.ropo.detector.classification", 255, DBZ_RAYS, DBZ_BINS);
    quality(c, &format!("{}/quality2", dataset), "pl.imgw.quality.qi_total", 200, DBZ_RAYS, DBZ_BINS)
}

/// Radial velocity of a 6 m/s westerly, well inside the Nyquist interval
fn velocity(c: MemoryContainer, dataset: &str, time: &str) -> MemoryContainer {
    let elevation = 0.5f64.to_radians();
    let raw = Array2::from_shape_fn((VRAD_RAYS, VRAD_BINS), |(az, _)| {
        let azimuth = 2.0 * std::f64::consts::PI * az as f64 / VRAD_RAYS as f64;
        let v = elevation.cos() * 6.0 * azimuth.sin();
        ((v + 12.8) / 0.1).round() as u8
    });
    let c = scan(c, dataset, time, VRAD_RAYS, VRAD_BINS);
    moment(c, &format!("{}/data1", dataset), "VRAD", 0.1, -12.8, raw)
}

fn run(settings: &Settings, source: &MemoryContainer) -> (FileStatus, MemoryContainer, String) {
    let mut target = MemoryContainer::new();
    let mut log = Vec::new();
    let status = process_volume(settings, "11812", source, &mut target, &mut log).unwrap();
    (status, target, String::from_utf8(log).unwrap())
}

/// Quantity name and raster of every data/quality group, in container order
fn layout(container: &MemoryContainer) -> Vec<(String, Option<String>, Option<Array2<u8>>)> {
    let mut groups = Vec::new();
    for dataset in container.dataset_groups().unwrap() {
        for kind in [SubgroupKind::Data, SubgroupKind::Quality] {
            for group in container.subgroups(&dataset, kind).unwrap() {
                let path = format!("{}/{}", dataset, group);
                let quantity = container.attr_str(&format!("{}/what", path), "quantity").unwrap();
                let raster = container.raster(&path, "data").unwrap();
                groups.push((path, quantity, raster));
            }
        }
    }
    groups
}

fn decoded(container: &MemoryContainer, group: &str) -> Array2<f64> {
    let what = format!("{}/what", group);
    let gain = container.attr_float(&what, "gain").unwrap().unwrap();
    let offset = container.attr_float(&what, "offset").unwrap().unwrap();
    container.raster(group, "data").unwrap().unwrap().map(|&c| gain * c as f64 + offset)
}

#[test]
fn test_homogenization_orders_and_renumbers() {
    let settings = settings(false, false);
    // Out of time order, with an unknown moment and a DBZ lacking its TH
    let source = velocity(root(), "dataset1", "120500");
    let source = reflectivity(source, "dataset2", "121000");
    let source = reflectivity(source, "dataset3", "120000");
    let source = moment(
        source,
        "dataset3/data3",
        "ZDR",
        0.1,
        0.0,
        Array2::zeros((DBZ_RAYS, DBZ_BINS)),
    );
    let source = scan(source, "dataset4", "121500", DBZ_RAYS, DBZ_BINS);
    let source = moment(
        source,
        "dataset4/data1",
        "DBZH",
        0.5,
        -32.0,
        Array2::from_elem((DBZ_RAYS, DBZ_BINS), 7u8),
    );

    let (status, target, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed);
    assert!(log.contains("WARNING: Homogenization - DBZ in dataset4/data1 dropped: no TH found"));
    assert!(!log.contains("ERROR"));

    assert_eq!(target.dataset_groups().unwrap(), vec!["dataset1", "dataset2", "dataset3"]);
    assert_eq!(target.attr_str("dataset1/data1/what", "quantity").unwrap().as_deref(), Some("DBZ"));
    assert_eq!(target.attr_str("dataset1/data2/what", "quantity").unwrap().as_deref(), Some("TH"));
    assert_eq!(target.attr_str("dataset1/what", "starttime").unwrap().as_deref(), Some("120000"));
    assert_eq!(target.attr_str("dataset2/what", "starttime").unwrap().as_deref(), Some("121000"));
    assert_eq!(target.attr_str("dataset3/data1/what", "quantity").unwrap().as_deref(), Some("VRAD"));
    assert_eq!(target.subgroups("dataset1", SubgroupKind::Data).unwrap(), vec!["data1", "data2"]);
    assert_eq!(
        target.subgroups("dataset1", SubgroupKind::Quality).unwrap(),
        vec!["quality1", "quality2"]
    );
    assert_eq!(
        target.attr_str("dataset1/quality2/how", "task").unwrap().as_deref(),
        Some("pl.imgw.quality.qi_total")
    );

    // Rasters are copied byte for byte
    assert_eq!(
        target.raster("dataset1/data1", "data").unwrap(),
        source.raster("dataset3/data1", "data").unwrap()
    );
    assert_eq!(
        target.raster("dataset3/data1", "data").unwrap(),
        source.raster("dataset1/data1", "data").unwrap()
    );
    assert_eq!(target.attr_float("where", "height").unwrap(), Some(100.0));
    assert_eq!(target.attr_str("", "Conventions").unwrap().as_deref(), Some("ODIM_H5/V2_2"));
}

#[test]
fn test_homogenization_is_idempotent() {
    let settings = settings(false, false);
    let source = reflectivity(root(), "dataset1", "120000");
    let source = velocity(source, "dataset2", "120500");

    let (status, first, _) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed);
    let (status, second, _) = run(&settings, &first);
    assert_eq!(status, FileStatus::Completed);

    assert_eq!(layout(&first), layout(&second));
    assert_eq!(first.attr_names("dataset1/where"), second.attr_names("dataset1/where"));
}

#[test]
fn test_missing_required_quality_abandons_file() {
    let settings = settings(false, false);
    let source = reflectivity(root(), "dataset1", "120000").with_attr("dataset1/quality2/how", "task", "unrelated");

    let (status, _, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Abandoned { stage: "Homogenization" });
    assert!(log.contains("DBZ in dataset1/data1 dropped: missing quality groups TOTAL"));
    assert!(log.contains("ERROR: Homogenization - no quantities to write to output file"));
}

#[test]
fn test_th_dimension_mismatch_drops_pair() {
    let settings = settings(false, false);
    // DBZ and its TH of the same scan stored in datasets of different size
    let source = scan(root(), "dataset1", "120000", DBZ_RAYS, DBZ_BINS);
    let source = moment(
        source,
        "dataset1/data1",
        "DBZH",
        0.5,
        -32.0,
        Array2::from_elem((DBZ_RAYS, DBZ_BINS), 100u8),
    );
    let source = scan(source, "dataset2", "120000", 10, DBZ_BINS);
    let source = moment(source, "dataset2/data1", "TH", 0.5, -32.0, Array2::from_elem((10, DBZ_BINS), 110u8));
    let source = velocity(source, "dataset3", "120500");

    let (status, target, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed);
    assert!(log.contains(
        "WARNING: Homogenization - DBZ in dataset1/data1 and TH in dataset2/data1 dropped: dimensions 12x8 and 10x8 differ"
    ));
    assert_eq!(target.dataset_groups().unwrap(), vec!["dataset1"]);
    assert_eq!(target.attr_str("dataset1/data1/what", "quantity").unwrap().as_deref(), Some("VRAD"));
}

#[test]
fn test_second_th_of_a_scan_is_dropped() {
    let settings = settings(false, false);
    let source = reflectivity(root(), "dataset1", "120000");
    let source = scan(source, "dataset2", "120000", DBZ_RAYS, DBZ_BINS);
    let source = moment(
        source,
        "dataset2/data1",
        "TH",
        0.5,
        -32.0,
        Array2::from_elem((DBZ_RAYS, DBZ_BINS), 1u8),
    );

    let (status, target, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed);
    assert!(log.contains("TH in dataset2/data1 dropped: its DBZ already has a TH"));
    assert_eq!(target.dataset_groups().unwrap(), vec!["dataset1"]);
    assert_eq!(
        target.raster("dataset1/data2", "data").unwrap(),
        source.raster("dataset1/data2", "data").unwrap()
    );
}

#[test]
fn test_undefined_velocity_abandons_dealiasing() {
    let settings = settings(true, false);
    let source = scan(root(), "dataset1", "120500", VRAD_RAYS, VRAD_BINS);
    let source = moment(
        source,
        "dataset1/data1",
        "VRAD",
        0.1,
        -12.8,
        Array2::from_elem((VRAD_RAYS, VRAD_BINS), 255u8),
    );

    let (status, _, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Abandoned { stage: "Dealiasing" });
    assert!(log.contains("ERROR: Dealiasing - all data in VRAD datasets are NaN"));
}

#[test]
fn test_dealiasing_keeps_unfolded_velocities() {
    let settings = settings(true, false);
    let source = velocity(root(), "dataset1", "120500");

    let (status, target, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed, "{}", log);
    assert_eq!(
        target.attr_str("dataset1/quality1/how", "task").unwrap().as_deref(),
        Some("dealiasing")
    );

    let original = decoded(&source, "dataset1/data1");
    let dealiased = decoded(&target, "dataset1/data1");
    let gain = target.attr_float("dataset1/data1/what", "gain").unwrap().unwrap();
    let validity = target.raster("dataset1/quality1", "data").unwrap().unwrap();
    let mut defined = 0;
    for ((idx, &value), &valid) in dealiased.indexed_iter().zip(validity.iter()) {
        if valid == 255 {
            defined += 1;
            assert_abs_diff_eq!(value, original[idx], epsilon = gain / 2.0 + 1e-9);
        }
    }
    // Everything inside the single height sector is dealiased
    assert!(defined >= VRAD_RAYS * (VRAD_BINS - 2), "{}", defined);
}

#[test]
fn test_full_pipeline_superobs_both_volumes() {
    let settings = settings(true, true);
    let source = reflectivity(root(), "dataset1", "120000");
    let source = velocity(source, "dataset2", "120500");

    let (status, target, log) = run(&settings, &source);
    assert_eq!(status, FileStatus::Completed, "{}", log);
    assert!(!log.contains("ERROR"));

    // Coarse geometry
    assert_eq!(target.attr_int("dataset1/where", "nrays").unwrap(), Some(4));
    assert_eq!(target.attr_int("dataset1/where", "nbins").unwrap(), Some(4));
    assert_eq!(target.attr_float("dataset1/where", "rscale").unwrap(), Some(2000.0));
    assert_eq!(target.attr_int("dataset2/where", "nrays").unwrap(), Some(12));
    assert_eq!(target.attr_int("dataset2/where", "nbins").unwrap(), Some(5));
    assert_eq!(
        target.attr_str("dataset1/quality1/how", "task").unwrap().as_deref(),
        Some("superobing")
    );
    assert_eq!(
        target.attr_str("dataset2/quality1/how", "task").unwrap().as_deref(),
        Some("superobing")
    );
    assert_eq!(target.attr_float("dataset2/data1/what", "nodata").unwrap(), Some(255.0));

    // Every coarse reflectivity bin averages two range bins of 2 dBZ steps
    let dbz = decoded(&target, "dataset1/data1");
    let gain = target.attr_float("dataset1/data1/what", "gain").unwrap().unwrap();
    assert_eq!(dbz.dim(), (4, 4));
    for ((_, j), &value) in dbz.indexed_iter() {
        assert_abs_diff_eq!(value, 19.0 + 4.0 * j as f64, epsilon = gain / 2.0 + 1e-9);
    }
    assert_eq!(target.raster("dataset1/data2", "data").unwrap().unwrap().dim(), (4, 4));
    assert!(target
        .raster("dataset1/quality1", "data")
        .unwrap()
        .unwrap()
        .iter()
        .all(|&q| q == 255));

    let vrad = target.raster("dataset2/data1", "data").unwrap().unwrap();
    assert_eq!(vrad.dim(), (12, 5));
    let validity = target.raster("dataset2/quality1", "data").unwrap().unwrap();
    assert!(validity.iter().all(|&q| q == 255));
    for value in decoded(&target, "dataset2/data1").iter() {
        assert!(value.abs() < 6.5, "{}", value);
    }
}
