//! Access layer for hierarchical radar containers (ODIM_H5 layout).
//!
//! Group paths are written without leading slash (`dataset1/data1/what`),
//! the file root is the empty path.

use crate::types::{HoofError, HoofResult};
use ndarray::Array2;
use regex::Regex;
use std::fmt;

/// Scalar attribute kinds understood by the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Str,
    Int,
    Float,
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrKind::Str => write!(f, "string"),
            AttrKind::Int => write!(f, "integer"),
            AttrKind::Float => write!(f, "float"),
        }
    }
}

/// A scalar attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Str(_) => AttrKind::Str,
            AttrValue::Int(_) => AttrKind::Int,
            AttrValue::Float(_) => AttrKind::Float,
        }
    }

    /// Convert to `kind`. Numbers convert into each other, strings never do.
    pub fn coerce(self, kind: AttrKind) -> Option<AttrValue> {
        match (self, kind) {
            (AttrValue::Str(s), AttrKind::Str) => Some(AttrValue::Str(s)),
            (AttrValue::Int(i), AttrKind::Int) => Some(AttrValue::Int(i)),
            (AttrValue::Int(i), AttrKind::Float) => Some(AttrValue::Float(i as f64)),
            (AttrValue::Float(x), AttrKind::Float) => Some(AttrValue::Float(x)),
            (AttrValue::Float(x), AttrKind::Int) if x.is_finite() => Some(AttrValue::Int(x.round() as i64)),
            _ => None,
        }
    }

    /// Parse the textual form of a value of the given kind
    pub fn parse(kind: AttrKind, text: &str) -> Option<AttrValue> {
        let text = text.trim();
        match kind {
            AttrKind::Str => Some(AttrValue::Str(text.to_string())),
            AttrKind::Int => text
                .parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().filter(|x| x.fract() == 0.0).map(|x| x as i64))
                .map(AttrValue::Int),
            AttrKind::Float => text.parse::<f64>().ok().map(AttrValue::Float),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            AttrValue::Float(x) if x.is_finite() => Some(x.round() as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(x) => Some(*x),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{}", s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(x: f64) -> Self {
        AttrValue::Float(x)
    }
}

/// Subgroup families inside a `datasetN` group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgroupKind {
    Data,
    Quality,
}

impl SubgroupKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SubgroupKind::Data => "data",
            SubgroupKind::Quality => "quality",
        }
    }
}

/// Read/write primitives the processing stages need from a radar file
pub trait RadarContainer {
    /// Top-level `datasetN` groups in natural order
    fn dataset_groups(&self) -> HoofResult<Vec<String>>;

    /// `dataN` or `qualityN` subgroups of a dataset in natural order
    fn subgroups(&self, dataset: &str, kind: SubgroupKind) -> HoofResult<Vec<String>>;

    /// Scalar attribute converted to `kind`, `None` when absent or not convertible
    fn attr(&self, group: &str, name: &str, kind: AttrKind) -> HoofResult<Option<AttrValue>>;

    /// Create or overwrite a scalar attribute, creating missing groups
    fn set_attr(&mut self, group: &str, name: &str, value: &AttrValue) -> HoofResult<()>;

    /// 8-bit raster stored as dataset `name` in `group`
    fn raster(&self, group: &str, name: &str) -> HoofResult<Option<Array2<u8>>>;

    /// Create or replace an 8-bit raster, creating missing groups
    fn set_raster(&mut self, group: &str, name: &str, data: &Array2<u8>) -> HoofResult<()>;

    fn flush(&mut self) -> HoofResult<()>;

    fn attr_str(&self, group: &str, name: &str) -> HoofResult<Option<String>> {
        Ok(self
            .attr(group, name, AttrKind::Str)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    fn attr_int(&self, group: &str, name: &str) -> HoofResult<Option<i64>> {
        Ok(self.attr(group, name, AttrKind::Int)?.and_then(|v| v.as_int()))
    }

    fn attr_float(&self, group: &str, name: &str) -> HoofResult<Option<f64>> {
        Ok(self.attr(group, name, AttrKind::Float)?.and_then(|v| v.as_float()))
    }
}

/// Copy a raster byte for byte between two containers.
///
/// Returns `false` when the source raster does not exist.
pub fn copy_raster(
    source: &dyn RadarContainer,
    target: &mut dyn RadarContainer,
    from_group: &str,
    to_group: &str,
    name: &str,
) -> HoofResult<bool> {
    match source.raster(from_group, name)? {
        Some(data) => {
            target.set_raster(to_group, name, &data)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Canonical form of a group path: no leading, trailing or doubled slashes
pub fn normalize_group(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join two group paths
pub fn join_group(parent: &str, child: &str) -> String {
    normalize_group(&format!("{}/{}", parent, child))
}

/// Keep names of the form `<prefix><digits>`, sorted by their numeric suffix
pub fn select_numbered(names: Vec<String>, prefix: &str) -> HoofResult<Vec<String>> {
    let pattern = Regex::new(&format!(r"^{}(\d+)$", regex::escape(prefix)))
        .map_err(|e| HoofError::Processing(format!("Regex error: {}", e)))?;

    let mut numbered: Vec<(u64, String)> = names
        .into_iter()
        .filter_map(|name| {
            let index = pattern
                .captures(&name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())?;
            Some((index, name))
        })
        .collect();
    numbered.sort();

    Ok(numbered.into_iter().map(|(_, name)| name).collect())
}
