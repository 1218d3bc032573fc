//! Classification and canonical ordering of the quantities of a source file.
//!
//! The sorter runs in fixed order: enumerate, time-sort with provisional
//! slots, link TH to DBZ, validate DBZ/TH pairs, link quality groups, enforce
//! the required DBZ quality tasks, renumber. The result lists every retained
//! DBZ, then TH, then QUALITY, then VRAD quantity with its final target.

use crate::core::diagnostics::Diagnostics;
use crate::core::resolver::AttributeResolver;
use crate::io::container::{RadarContainer, SubgroupKind};
use crate::io::namelist::Settings;
use crate::types::{round_elevation, GroupLocation, HoofResult, QualityTask, Quantity, QuantityKind};
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Classifies, links and renumbers source quantities
pub struct QuantitySorter<'a> {
    settings: &'a Settings,
    resolver: &'a AttributeResolver<'a>,
}

impl<'a> QuantitySorter<'a> {
    pub fn new(settings: &'a Settings, resolver: &'a AttributeResolver<'a>) -> Self {
        Self { settings, resolver }
    }

    /// Run all sorting stages on a source file
    pub fn sort(&self, source: &dyn RadarContainer, diagnostics: &mut Diagnostics) -> HoofResult<Vec<Quantity>> {
        let quantities = self.enumerate(source, diagnostics)?;

        let mut dbz = Vec::new();
        let mut th = Vec::new();
        let mut vrad = Vec::new();
        let mut quality = Vec::new();
        for quantity in quantities {
            match quantity.kind {
                QuantityKind::Dbz => dbz.push(quantity),
                QuantityKind::Th => th.push(quantity),
                QuantityKind::Vrad => vrad.push(quantity),
                QuantityKind::Quality(_) => quality.push(quantity),
            }
        }
        log::debug!(
            "Classified {} DBZ, {} TH, {} VRAD and {} quality groups",
            dbz.len(),
            th.len(),
            vrad.len(),
            quality.len()
        );

        assign_provisional_slots(&mut dbz, &mut vrad);
        let th = link_th(th, &dbz, diagnostics);
        let (dbz, th) = validate_pairs(source, dbz, th, diagnostics)?;
        let quality = link_quality(quality, &dbz, &vrad, diagnostics);
        let (dbz, th, quality) = enforce_required_quality(&self.settings.dbz_quality_tasks, dbz, th, quality, diagnostics);

        Ok(renumber(dbz, th, quality, vrad))
    }

    /// Read and classify every data and quality group of the file
    pub fn enumerate(&self, source: &dyn RadarContainer, diagnostics: &mut Diagnostics) -> HoofResult<Vec<Quantity>> {
        let mut quantities = Vec::new();

        for dataset in source.dataset_groups()? {
            let elevation = self
                .resolver
                .resolve_float(source, &format!("{}/where", dataset), "elangle")?;
            let elevation = match elevation {
                Some(e) if e.is_finite() => round_elevation(e),
                _ => {
                    diagnostics.warn(format!("{} skipped: elevation angle not found", dataset));
                    continue;
                }
            };
            let start = match self.start_timestamp(source, &dataset)? {
                Some(s) => s,
                None => {
                    diagnostics.warn(format!("{} skipped: start date and time not found", dataset));
                    continue;
                }
            };

            for data in source.subgroups(&dataset, SubgroupKind::Data)? {
                let name = source.attr_str(&format!("{}/{}/what", dataset, data), "quantity")?;
                match name.as_deref().and_then(|n| self.settings.names.classify(n)) {
                    Some(kind) => quantities.push(Quantity {
                        kind,
                        elevation,
                        start: start.clone(),
                        task: None,
                        source: GroupLocation::new(dataset.as_str(), data.as_str()),
                        target: None,
                    }),
                    None => log::debug!("Ignoring {}/{} ({})", dataset, data, name.as_deref().unwrap_or("")),
                }
            }

            let mut index = 0;
            for group in source.subgroups(&dataset, SubgroupKind::Quality)? {
                let task = self
                    .resolver
                    .resolve_str(source, &format!("{}/{}/how", dataset, group), "task")?;
                let task = match task.as_deref().and_then(QualityTask::from_task_attribute) {
                    Some(t) if self.settings.dbz_quality_tasks.iter().any(|k| k == t.label()) => t,
                    _ => continue,
                };
                index += 1;
                quantities.push(Quantity {
                    kind: QuantityKind::Quality(index),
                    elevation,
                    start: start.clone(),
                    task: Some(task),
                    source: GroupLocation::new(dataset.as_str(), group.as_str()),
                    target: None,
                });
            }
        }

        Ok(quantities)
    }

    /// `YYYYMMDDHHMMSS` start of a dataset, `None` when absent or malformed
    fn start_timestamp(&self, source: &dyn RadarContainer, dataset: &str) -> HoofResult<Option<String>> {
        let group = format!("{}/what", dataset);
        let date = self.resolver.resolve_str(source, &group, "startdate")?;
        let time = self.resolver.resolve_str(source, &group, "starttime")?;
        let (date, time) = match (date, time) {
            (Some(d), Some(t)) => (d, t),
            _ => return Ok(None),
        };

        let stamp = format!("{}{}", date.trim(), time.trim());
        match NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S") {
            Ok(_) if stamp.len() == 14 => Ok(Some(stamp)),
            _ => {
                log::debug!("Malformed start time '{}' in {}", stamp, dataset);
                Ok(None)
            }
        }
    }
}

/// Sort DBZ and VRAD by start time and give each a provisional dataset slot
fn assign_provisional_slots(dbz: &mut [Quantity], vrad: &mut [Quantity]) {
    dbz.sort_by(|a, b| a.start.cmp(&b.start));
    vrad.sort_by(|a, b| a.start.cmp(&b.start));

    for (slot, quantity) in dbz.iter_mut().chain(vrad.iter_mut()).enumerate() {
        quantity.target = Some(GroupLocation::new(format!("dataset{}", slot + 1), "data1"));
    }
}

/// Attach every TH to the DBZ of the same scan
fn link_th(th: Vec<Quantity>, dbz: &[Quantity], diagnostics: &mut Diagnostics) -> Vec<Quantity> {
    let mut linked = Vec::new();

    for mut quantity in th {
        let candidates: Vec<&Quantity> = dbz.iter().filter(|d| d.same_scan(&quantity)).collect();
        let owner = match candidates.len() {
            0 => {
                diagnostics.warn(format!(
                    "TH in {} dropped: no DBZ with the same elevation and start time",
                    quantity.source.path()
                ));
                None
            }
            1 => Some(candidates[0]),
            n => {
                diagnostics.warn(format!(
                    "TH in {} matches {} DBZ quantities, using the one from the same dataset",
                    quantity.source.path(),
                    n
                ));
                let owner = candidates
                    .into_iter()
                    .find(|d| d.source.dataset == quantity.source.dataset);
                if owner.is_none() {
                    diagnostics.warn(format!("TH in {} dropped: no DBZ in the same dataset", quantity.source.path()));
                }
                owner
            }
        };

        if let Some(dataset) = owner.and_then(|o| o.target_dataset()) {
            quantity.target = Some(GroupLocation::new(dataset, "data2"));
            linked.push(quantity);
        }
    }

    linked
}

/// Keep only DBZ/TH pairs whose ray and bin counts agree
fn validate_pairs(
    source: &dyn RadarContainer,
    dbz: Vec<Quantity>,
    mut th: Vec<Quantity>,
    diagnostics: &mut Diagnostics,
) -> HoofResult<(Vec<Quantity>, Vec<Quantity>)> {
    let mut kept_dbz = Vec::new();
    let mut kept_th = Vec::new();

    for quantity in dbz {
        let position = th.iter().position(|t| t.target_dataset() == quantity.target_dataset());
        let pair = match position {
            Some(p) => th.remove(p),
            None => {
                diagnostics.warn(format!("DBZ in {} dropped: no TH found", quantity.source.path()));
                continue;
            }
        };

        match (dimensions(source, &quantity.source.dataset)?, dimensions(source, &pair.source.dataset)?) {
            (Some(a), Some(b)) if a == b => {
                kept_dbz.push(quantity);
                kept_th.push(pair);
            }
            (Some(a), Some(b)) => diagnostics.warn(format!(
                "DBZ in {} and TH in {} dropped: dimensions {}x{} and {}x{} differ",
                quantity.source.path(),
                pair.source.path(),
                a.0,
                a.1,
                b.0,
                b.1
            )),
            _ => diagnostics.warn(format!(
                "DBZ in {} and TH in {} dropped: ray or bin count not found",
                quantity.source.path(),
                pair.source.path()
            )),
        }
    }

    for orphan in th {
        diagnostics.warn(format!("TH in {} dropped: its DBZ already has a TH", orphan.source.path()));
    }

    Ok((kept_dbz, kept_th))
}

fn dimensions(source: &dyn RadarContainer, dataset: &str) -> HoofResult<Option<(i64, i64)>> {
    let group = format!("{}/where", dataset);
    Ok(match (source.attr_int(&group, "nrays")?, source.attr_int(&group, "nbins")?) {
        (Some(rays), Some(bins)) => Some((rays, bins)),
        _ => None,
    })
}

/// Attach quality groups to the DBZ and/or VRAD of the same scan
fn link_quality(
    quality: Vec<Quantity>,
    dbz: &[Quantity],
    vrad: &[Quantity],
    diagnostics: &mut Diagnostics,
) -> Vec<Quantity> {
    let mut linked = Vec::new();

    for quantity in quality {
        let group = match quantity.kind {
            QuantityKind::Quality(n) => format!("quality{}", n),
            _ => continue,
        };

        let owners = [dbz.iter().find(|d| d.same_scan(&quantity)), vrad.iter().find(|v| v.same_scan(&quantity))];
        let mut matched = false;
        for dataset in owners.iter().flatten().filter_map(|o| o.target_dataset()) {
            let mut copy = quantity.clone();
            copy.target = Some(GroupLocation::new(dataset, group.as_str()));
            linked.push(copy);
            matched = true;
        }

        if !matched {
            diagnostics.warn(format!(
                "quality group {} dropped: no DBZ or VRAD with the same elevation and start time",
                quantity.source.path()
            ));
        }
    }

    linked
}

/// Drop DBZ scans lacking one of the required quality tasks, with their TH and quality groups
fn enforce_required_quality(
    required: &[String],
    dbz: Vec<Quantity>,
    mut th: Vec<Quantity>,
    mut quality: Vec<Quantity>,
    diagnostics: &mut Diagnostics,
) -> (Vec<Quantity>, Vec<Quantity>, Vec<Quantity>) {
    let mut kept = Vec::new();

    for quantity in dbz {
        let slot = quantity.target_dataset();
        let tasks: Vec<&str> = quality
            .iter()
            .filter(|q| q.target_dataset() == slot)
            .filter_map(|q| q.task.map(|t| t.label()))
            .collect();
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|r| !tasks.contains(r))
            .collect();

        if missing.is_empty() {
            kept.push(quantity);
            continue;
        }

        diagnostics.warn(format!(
            "DBZ in {} dropped: missing quality groups {}",
            quantity.source.path(),
            missing.join(", ")
        ));
        let slot = slot.map(str::to_string);
        th.retain(|t| t.target_dataset() != slot.as_deref());
        quality.retain(|q| q.target_dataset() != slot.as_deref());
    }

    (kept, th, quality)
}

/// Assign contiguous final slots, DBZ first, and order the output
fn renumber(
    mut dbz: Vec<Quantity>,
    mut th: Vec<Quantity>,
    mut quality: Vec<Quantity>,
    mut vrad: Vec<Quantity>,
) -> Vec<Quantity> {
    let mut slots: HashMap<String, (usize, String)> = HashMap::new();
    for (index, owner) in dbz.iter().chain(vrad.iter()).enumerate() {
        if let Some(old) = owner.target_dataset() {
            slots.insert(old.to_string(), (index, format!("dataset{}", index + 1)));
        }
    }

    let retarget = |quantity: &mut Quantity| {
        if let Some(target) = quantity.target.as_mut() {
            if let Some((_, new)) = slots.get(&target.dataset) {
                target.dataset = new.clone();
            }
        }
    };

    // Owner order first, then quality number
    quality.sort_by_key(|q| {
        let owner = q
            .target_dataset()
            .and_then(|d| slots.get(d))
            .map(|(index, _)| *index)
            .unwrap_or(usize::MAX);
        let number = match q.kind {
            QuantityKind::Quality(n) => n,
            _ => 0,
        };
        (owner, number)
    });

    dbz.iter_mut()
        .chain(th.iter_mut())
        .chain(quality.iter_mut())
        .chain(vrad.iter_mut())
        .for_each(retarget);

    dbz.into_iter().chain(th).chain(quality).chain(vrad).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryContainer;

    fn settings() -> Settings {
        Settings::parse(
            "\
[Radar moment names to save]
DBZ = {DBZH}
TH = {TH}
VRAD = {VRAD}
[Required DBZ moment quality groups]
{ROPO}
",
        )
        .unwrap()
    }

    fn scan(container: MemoryContainer, dataset: &str, elangle: f64, time: &str) -> MemoryContainer {
        container
            .with_attr(&format!("{}/where", dataset), "elangle", elangle)
            .with_attr(&format!("{}/where", dataset), "nrays", 360i64)
            .with_attr(&format!("{}/where", dataset), "nbins", 250i64)
            .with_attr(&format!("{}/what", dataset), "startdate", "20240601")
            .with_attr(&format!("{}/what", dataset), "starttime", time)
    }

    fn data(container: MemoryContainer, group: &str, quantity: &str) -> MemoryContainer {
        container.with_attr(&format!("{}/what", group), "quantity", quantity)
    }

    fn quality(container: MemoryContainer, group: &str, task: &str) -> MemoryContainer {
        container.with_attr(&format!("{}/how", group), "task", task)
    }

    #[test]
    fn test_enumerate_skips_incomplete_datasets() {
        let settings = settings();
        let resolver = AttributeResolver::new(&settings, "00000");
        let sorter = QuantitySorter::new(&settings, &resolver);

        let source = scan(MemoryContainer::new(), "dataset1", 0.48, "120000");
        let source = data(source, "dataset1/data1", "DBZH");
        let source = data(source, "dataset1/data2", "ZDR");
        let source = quality(source, "dataset1/quality1", "fi.fmi.ropo.detector");
        let source = quality(source, "dataset1/quality2", "se.smhi.beamblockage");
        let source = data(source, "dataset2/data1", "DBZH").with_attr("dataset2/where", "elangle", 1.0);

        let mut diagnostics = Diagnostics::new("Homogenization");
        let quantities = sorter.enumerate(&source, &mut diagnostics).unwrap();

        assert_eq!(quantities.len(), 2);
        assert_eq!(quantities[0].kind, QuantityKind::Dbz);
        assert!((quantities[0].elevation - 0.5).abs() < 1e-9);
        assert_eq!(quantities[0].start, "20240601120000");
        assert_eq!(quantities[1].kind, QuantityKind::Quality(1));
        assert_eq!(quantities[1].task, Some(QualityTask::Ropo));
        assert_eq!(diagnostics.warnings().len(), 1);
    }

    #[test]
    fn test_malformed_time_is_missing() {
        let settings = settings();
        let resolver = AttributeResolver::new(&settings, "00000");
        let sorter = QuantitySorter::new(&settings, &resolver);
        let source = scan(MemoryContainer::new(), "dataset1", 0.5, "126000");
        let source = data(source, "dataset1/data1", "DBZH");

        let mut diagnostics = Diagnostics::new("Homogenization");
        assert!(sorter.enumerate(&source, &mut diagnostics).unwrap().is_empty());
        assert_eq!(diagnostics.warnings().len(), 1);
    }

    #[test]
    fn test_provisional_slots_dbz_first() {
        let q = |kind, start: &str| Quantity {
            kind,
            elevation: 0.5,
            start: start.to_string(),
            task: None,
            source: GroupLocation::new("dataset1", "data1"),
            target: None,
        };
        let mut dbz = vec![q(QuantityKind::Dbz, "20240101001000"), q(QuantityKind::Dbz, "20240101000000")];
        let mut vrad = vec![q(QuantityKind::Vrad, "20240101000500")];
        assign_provisional_slots(&mut dbz, &mut vrad);

        assert_eq!(dbz[0].start, "20240101000000");
        assert_eq!(dbz[0].target_dataset(), Some("dataset1"));
        assert_eq!(dbz[1].target_dataset(), Some("dataset2"));
        assert_eq!(vrad[0].target_dataset(), Some("dataset3"));
    }

    #[test]
    fn test_ambiguous_th_prefers_same_dataset() {
        let q = |kind, dataset: &str, group: &str| Quantity {
            kind,
            elevation: 0.5,
            start: "20240601120000".to_string(),
            task: None,
            source: GroupLocation::new(dataset, group),
            target: None,
        };
        let mut dbz = vec![q(QuantityKind::Dbz, "dataset1", "data1"), q(QuantityKind::Dbz, "dataset2", "data1")];
        let mut vrad: Vec<Quantity> = Vec::new();
        assign_provisional_slots(&mut dbz, &mut vrad);

        let mut diagnostics = Diagnostics::new("Homogenization");
        let th = link_th(vec![q(QuantityKind::Th, "dataset2", "data2")], &dbz, &mut diagnostics);

        assert_eq!(th.len(), 1);
        assert_eq!(th[0].target, Some(GroupLocation::new("dataset2", "data2")));
        assert_eq!(diagnostics.warnings().len(), 1);
        assert!(diagnostics.warnings()[0].contains("matches 2 DBZ quantities"));
    }
}
