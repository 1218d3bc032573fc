//! In-memory radar container, used to build volumes without touching disk

use crate::io::container::{normalize_group, select_numbered, AttrKind, AttrValue, RadarContainer, SubgroupKind};
use crate::types::HoofResult;
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    groups: BTreeSet<String>,
    attrs: BTreeMap<String, BTreeMap<String, AttrValue>>,
    rasters: BTreeMap<String, BTreeMap<String, Array2<u8>>>,
    flushes: usize,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RadarContainer::set_attr`]
    pub fn with_attr(mut self, group: &str, name: &str, value: impl Into<AttrValue>) -> Self {
        let group = normalize_group(group);
        self.register_group(&group);
        self.attrs
            .entry(group)
            .or_default()
            .insert(name.to_string(), value.into());
        self
    }

    /// Builder form of [`RadarContainer::set_raster`]
    pub fn with_raster(mut self, group: &str, name: &str, data: Array2<u8>) -> Self {
        let group = normalize_group(group);
        self.register_group(&group);
        self.rasters
            .entry(group)
            .or_default()
            .insert(name.to_string(), data);
        self
    }

    pub fn has_group(&self, path: &str) -> bool {
        let path = normalize_group(path);
        path.is_empty() || self.groups.contains(&path)
    }

    /// Attribute names stored directly on `group`
    pub fn attr_names(&self, group: &str) -> Vec<String> {
        self.attrs
            .get(&normalize_group(group))
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of times the container has been flushed
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    fn register_group(&mut self, path: &str) {
        let mut prefix = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            self.groups.insert(prefix.clone());
        }
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let parent = normalize_group(parent);
        self.groups
            .iter()
            .filter_map(|g| {
                let rest = if parent.is_empty() {
                    g.as_str()
                } else {
                    g.strip_prefix(&parent)?.strip_prefix('/')?
                };
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }
}

impl RadarContainer for MemoryContainer {
    fn dataset_groups(&self) -> HoofResult<Vec<String>> {
        select_numbered(self.children(""), "dataset")
    }

    fn subgroups(&self, dataset: &str, kind: SubgroupKind) -> HoofResult<Vec<String>> {
        select_numbered(self.children(dataset), kind.prefix())
    }

    fn attr(&self, group: &str, name: &str, kind: AttrKind) -> HoofResult<Option<AttrValue>> {
        Ok(self
            .attrs
            .get(&normalize_group(group))
            .and_then(|a| a.get(name))
            .cloned()
            .and_then(|v| v.coerce(kind)))
    }

    fn set_attr(&mut self, group: &str, name: &str, value: &AttrValue) -> HoofResult<()> {
        let group = normalize_group(group);
        self.register_group(&group);
        self.attrs
            .entry(group)
            .or_default()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    fn raster(&self, group: &str, name: &str) -> HoofResult<Option<Array2<u8>>> {
        Ok(self
            .rasters
            .get(&normalize_group(group))
            .and_then(|r| r.get(name))
            .cloned())
    }

    fn set_raster(&mut self, group: &str, name: &str, data: &Array2<u8>) -> HoofResult<()> {
        let group = normalize_group(group);
        self.register_group(&group);
        self.rasters
            .entry(group)
            .or_default()
            .insert(name.to_string(), data.clone());
        Ok(())
    }

    fn flush(&mut self) -> HoofResult<()> {
        self.flushes += 1;
        Ok(())
    }
}
