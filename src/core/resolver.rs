//! Attribute lookup with namelist fallbacks.
//!
//! A value is taken from the source file if present, otherwise from the site
//! specific namelist section, otherwise from the common defaults. Namelist
//! groups are matched against the file group with dataset/data indices removed
//! (`dataset3/data2/what` matches `/dataset/data/what`).

use crate::io::container::{normalize_group, AttrKind, AttrValue, RadarContainer};
use crate::io::namelist::{NamelistAttribute, Settings};
use crate::types::HoofResult;

/// Remove the numeric indices from a group path
pub fn strip_indices(group: &str) -> String {
    normalize_group(group)
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect()
}

pub struct AttributeResolver<'a> {
    settings: &'a Settings,
    site: &'a str,
}

impl<'a> AttributeResolver<'a> {
    pub fn new(settings: &'a Settings, site: &'a str) -> Self {
        Self { settings, site }
    }

    pub fn site(&self) -> &str {
        self.site
    }

    /// Resolve `name` in `group`. `Ok(None)` means the attribute is missing everywhere.
    pub fn resolve(
        &self,
        source: &dyn RadarContainer,
        group: &str,
        name: &str,
        kind: AttrKind,
    ) -> HoofResult<Option<AttrValue>> {
        if let Some(value) = source.attr(group, name, kind)? {
            return Ok(Some(value));
        }
        Ok(self.default_for(group, name, kind))
    }

    /// Namelist value for `name` in `group`, site overrides first
    pub fn default_for(&self, group: &str, name: &str, kind: AttrKind) -> Option<AttrValue> {
        let pattern = strip_indices(group);
        lookup(self.settings.site_overrides(self.site), &pattern, name, kind)
            .or_else(|| lookup(&self.settings.common_attributes, &pattern, name, kind))
    }

    pub fn resolve_str(&self, source: &dyn RadarContainer, group: &str, name: &str) -> HoofResult<Option<String>> {
        Ok(self
            .resolve(source, group, name, AttrKind::Str)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn resolve_int(&self, source: &dyn RadarContainer, group: &str, name: &str) -> HoofResult<Option<i64>> {
        Ok(self.resolve(source, group, name, AttrKind::Int)?.and_then(|v| v.as_int()))
    }

    pub fn resolve_float(&self, source: &dyn RadarContainer, group: &str, name: &str) -> HoofResult<Option<f64>> {
        Ok(self.resolve(source, group, name, AttrKind::Float)?.and_then(|v| v.as_float()))
    }
}

fn lookup(attributes: &[NamelistAttribute], pattern: &str, name: &str, kind: AttrKind) -> Option<AttrValue> {
    attributes
        .iter()
        .filter(|a| a.name == name && strip_indices(&a.group) == pattern)
        .find_map(|a| a.default.clone())
        .and_then(|v| v.coerce(kind))
}
