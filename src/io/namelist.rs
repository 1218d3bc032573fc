//! Namelist (configuration) parsing.
//!
//! The namelist is a list of `[Section]` headers, each followed by its value
//! lines. Lines starting with `#` are comments.

use crate::io::container::{normalize_group, AttrKind, AttrValue};
use crate::types::{HoofError, HoofResult, QuantityKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

const SITE_SECTION_PREFIX: &str = "[Specific attributes and default values";

/// Level of the metadata group an attribute lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupLevel {
    /// `/what`, `/where`, `/how`
    Root,
    /// `/dataset/where` etc.
    Dataset,
    /// `/dataset/data/what` etc.
    Data,
    /// `/dataset/quality/how` etc.
    Quality,
}

impl GroupLevel {
    /// Classify a namelist group path such as `dataset/data/what`
    pub fn of(group: &str) -> Option<GroupLevel> {
        let group = normalize_group(group);
        let parts: Vec<&str> = group.split('/').filter(|c| !c.is_empty()).collect();
        match parts.as_slice() {
            [single] if *single != "dataset" => Some(GroupLevel::Root),
            [_, second] if *second != "data" && *second != "quality" => Some(GroupLevel::Dataset),
            [_, "data", _] => Some(GroupLevel::Data),
            [_, "quality", _] => Some(GroupLevel::Quality),
            _ => None,
        }
    }
}

/// One attribute declared in the namelist, with an optional default value
#[derive(Debug, Clone, PartialEq)]
pub struct NamelistAttribute {
    pub kind: AttrKind,
    /// Group path without leading slash, e.g. `dataset/where`
    pub group: String,
    pub name: String,
    pub default: Option<AttrValue>,
}

impl NamelistAttribute {
    /// Parse `F /dataset/where/elangle = 0.5`
    pub fn parse_line(line: &str) -> HoofResult<Self> {
        let pattern = Regex::new(r"^\s*([SIFsif])\s+(\S+)\s*=\s*(.*?)\s*$")
            .map_err(|e| HoofError::Processing(format!("Regex error: {}", e)))?;
        let captures = pattern
            .captures(line)
            .ok_or_else(|| HoofError::Namelist(format!("malformed attribute line '{}'", line)))?;

        let kind = match &captures[1] {
            "S" | "s" => AttrKind::Str,
            "I" | "i" => AttrKind::Int,
            _ => AttrKind::Float,
        };

        let path = normalize_group(&captures[2]);
        let (group, name) = match path.rsplit_once('/') {
            Some((group, name)) => (group.to_string(), name.to_string()),
            None => (String::new(), path.clone()),
        };
        if name.is_empty() {
            return Err(HoofError::Namelist(format!("attribute without name in '{}'", line)));
        }

        let text = &captures[3];
        let default = if text == "None" {
            None
        } else {
            Some(AttrValue::parse(kind, text).ok_or_else(|| {
                HoofError::Namelist(format!("cannot read '{}' as {} in '{}'", text, kind, line))
            })?)
        };

        Ok(Self {
            kind,
            group,
            name,
            default,
        })
    }

    pub fn level(&self) -> Option<GroupLevel> {
        GroupLevel::of(&self.group)
    }
}

/// Diagnostic output switches and tags
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub warning_tag: String,
    pub error_tag: String,
    pub warnings_to_console: bool,
    pub errors_to_console: bool,
    pub warnings_to_log: bool,
    pub timing_to_console: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            warning_tag: "WARNING".to_string(),
            error_tag: "ERROR".to_string(),
            warnings_to_console: false,
            errors_to_console: true,
            warnings_to_log: true,
            timing_to_console: false,
        }
    }
}

/// Source `quantity` names accepted for each canonical kind
#[derive(Debug, Clone, Default)]
pub struct QuantityNames {
    pub dbz: Vec<String>,
    pub th: Vec<String>,
    pub vrad: Vec<String>,
}

impl QuantityNames {
    pub fn classify(&self, quantity: &str) -> Option<QuantityKind> {
        let quantity = quantity.trim();
        if self.dbz.iter().any(|n| n == quantity) {
            Some(QuantityKind::Dbz)
        } else if self.th.iter().any(|n| n == quantity) {
            Some(QuantityKind::Th)
        } else if self.vrad.iter().any(|n| n == quantity) {
            Some(QuantityKind::Vrad)
        } else {
            None
        }
    }
}

/// Dealiasing parameters
#[derive(Debug, Clone)]
pub struct DealiasParams {
    pub enabled: bool,
    /// Height sector width (m)
    pub sector_height: f64,
    /// Top of the highest height sector (m)
    pub max_height: f64,
    /// Minimum number of good cells for a sector wind fit
    pub min_points: usize,
    /// Largest plausible wind speed (m/s)
    pub max_wind: f64,
}

impl Default for DealiasParams {
    fn default() -> Self {
        Self {
            enabled: false,
            sector_height: 200.0,
            max_height: 12_000.0,
            min_points: 100,
            max_wind: 48.0,
        }
    }
}

/// Superobing parameters
#[derive(Debug, Clone)]
pub struct SuperobParams {
    pub enabled: bool,
    /// Range bins per coarse bin
    pub range_factor: usize,
    /// Rays per coarse bin
    pub azimuth_factor: usize,
    /// Largest allowed arc length of a coarse bin (m)
    pub max_arc: f64,
    pub dbz_min_quality: f64,
    /// Reflectivity at or below this is clear sky (dBZ)
    pub dbz_clear_sky: f64,
    /// Fraction of a bin that must be wet to average reflectivity
    pub dbz_min_fraction: f64,
    /// Fraction of a bin that must be defined to average velocity
    pub vrad_min_fraction: f64,
    /// Largest allowed velocity standard deviation within a bin (m/s)
    pub vrad_max_std: f64,
}

impl Default for SuperobParams {
    fn default() -> Self {
        Self {
            enabled: false,
            range_factor: 4,
            azimuth_factor: 3,
            max_arc: 3000.0,
            dbz_min_quality: 0.0,
            dbz_clear_sky: 0.0,
            dbz_min_fraction: 0.0,
            vrad_min_fraction: 0.0,
            vrad_max_std: 10.0,
        }
    }
}

/// Immutable processing configuration read once at startup
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Accepted input file extensions, stored without leading dot
    pub extensions: Vec<String>,
    pub log: LogSettings,
    pub names: QuantityNames,
    /// Quality tasks every DBZ scan must carry (also the tasks kept)
    pub dbz_quality_tasks: Vec<String>,
    pub common_attributes: Vec<NamelistAttribute>,
    /// Attribute overrides keyed by 5-character site code
    pub site_attributes: BTreeMap<String, Vec<NamelistAttribute>>,
    pub dealias: DealiasParams,
    pub superob: SuperobParams,
}

impl Settings {
    /// Read and parse a namelist file
    pub fn from_file<P: AsRef<Path>>(path: P) -> HoofResult<Self> {
        let path = path.as_ref();
        log::info!("Reading namelist {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse namelist text
    pub fn parse(text: &str) -> HoofResult<Self> {
        let mut settings = Settings::default();

        for (header, body) in sections(text) {
            match header {
                "[File extensions to read]" => {
                    settings.extensions = braced_list(first_line(header, &body)?)
                        .into_iter()
                        .map(|e| e.trim_start_matches('.').to_string())
                        .collect();
                }
                "[Log keywords]" => {
                    for (key, value) in key_values(header, &body)? {
                        match key {
                            "WarningTag" => settings.log.warning_tag = value.to_string(),
                            "ErrorTag" => settings.log.error_tag = value.to_string(),
                            _ => log::debug!("Ignoring log keyword {}", key),
                        }
                    }
                }
                "[Print warnings to console]" => settings.log.warnings_to_console = parse_bool(first_line(header, &body)?),
                "[Print errors to console]" => settings.log.errors_to_console = parse_bool(first_line(header, &body)?),
                "[Print warnings to log]" => settings.log.warnings_to_log = parse_bool(first_line(header, &body)?),
                "[Print timing to console]" => settings.log.timing_to_console = parse_bool(first_line(header, &body)?),
                "[Radar moment names to save]" => {
                    for (key, value) in key_values(header, &body)? {
                        let names = braced_list(value);
                        match key {
                            "DBZ" => settings.names.dbz = names,
                            "TH" => settings.names.th = names,
                            "VRAD" => settings.names.vrad = names,
                            _ => log::debug!("Ignoring moment {}", key),
                        }
                    }
                }
                "[Required DBZ moment quality groups]" => {
                    settings.dbz_quality_tasks = braced_list(first_line(header, &body)?);
                }
                "[Common attributes and default values]" => {
                    settings.common_attributes = body
                        .iter()
                        .map(|l| NamelistAttribute::parse_line(l))
                        .collect::<HoofResult<_>>()?;
                }
                "[Dealiasing]" => settings.dealias.enabled = parse_bool(first_line(header, &body)?),
                "[Height sector size in m]" => settings.dealias.sector_height = parse_number(header, &body)?,
                "[Maximum height]" => settings.dealias.max_height = parse_number(header, &body)?,
                "[Minimum good points in height sector]" => settings.dealias.min_points = parse_number(header, &body)?,
                "[Maximum dealiased wind speed in m/s]" => settings.dealias.max_wind = parse_number(header, &body)?,
                "[Superobing]" => settings.superob.enabled = parse_bool(first_line(header, &body)?),
                "[Range bin factor]" => settings.superob.range_factor = parse_number(header, &body)?,
                "[Ray angle factor]" => settings.superob.azimuth_factor = parse_number(header, &body)?,
                "[Max arc size in m]" => settings.superob.max_arc = parse_number(header, &body)?,
                "[DBZ min quality]" => settings.superob.dbz_min_quality = parse_number(header, &body)?,
                "[DBZ clear sky threshold]" => settings.superob.dbz_clear_sky = parse_number(header, &body)?,
                "[DBZ min percentage of good points]" => settings.superob.dbz_min_fraction = parse_number(header, &body)?,
                "[VRAD min percentage of good points]" => settings.superob.vrad_min_fraction = parse_number(header, &body)?,
                "[VRAD max standard deviation]" => settings.superob.vrad_max_std = parse_number(header, &body)?,
                _ if header.starts_with(SITE_SECTION_PREFIX) => {
                    let site = header
                        .trim_matches(|c| c == '[' || c == ']')
                        .split_whitespace()
                        .last()
                        .unwrap_or_default()
                        .to_string();
                    let attributes = body
                        .iter()
                        .map(|l| NamelistAttribute::parse_line(l))
                        .collect::<HoofResult<Vec<_>>>()?;
                    settings.site_attributes.entry(site).or_default().extend(attributes);
                }
                _ => log::debug!("Ignoring unknown namelist section {}", header),
            }
        }

        if settings.superob.range_factor == 0 || settings.superob.azimuth_factor == 0 {
            return Err(HoofError::Namelist("superobing factors must be positive".to_string()));
        }
        if settings.dealias.sector_height <= 0.0 {
            return Err(HoofError::Namelist("height sector size must be positive".to_string()));
        }

        log::debug!(
            "Namelist: {} common attributes, {} site overrides, dealiasing {}, superobing {}",
            settings.common_attributes.len(),
            settings.site_attributes.len(),
            settings.dealias.enabled,
            settings.superob.enabled
        );
        Ok(settings)
    }

    /// Site-specific attribute overrides, empty for unknown sites
    pub fn site_overrides(&self, site: &str) -> &[NamelistAttribute] {
        self.site_attributes.get(site).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Attributes declared for a group level: common ones first, then
    /// site overrides of attributes the common list does not name
    pub fn declared_attributes(&self, site: &str, level: GroupLevel) -> Vec<&NamelistAttribute> {
        let mut declared: Vec<&NamelistAttribute> = Vec::new();
        for attribute in self.common_attributes.iter().chain(self.site_overrides(site)) {
            if attribute.level() != Some(level) {
                continue;
            }
            if !declared
                .iter()
                .any(|d| d.group == attribute.group && d.name == attribute.name)
            {
                declared.push(attribute);
            }
        }
        declared
    }

    /// Whether a file with this extension should be processed
    pub fn accepts_extension(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.extensions.iter().any(|e| e == extension)
    }
}

/// Split namelist text into (header, body lines), dropping comments and blank lines
fn sections(text: &str) -> Vec<(&str, Vec<&str>)> {
    let mut sections: Vec<(&str, Vec<&str>)> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') {
            sections.push((trimmed, Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(trimmed);
        }
    }
    sections
}

fn first_line<'a>(header: &str, body: &[&'a str]) -> HoofResult<&'a str> {
    body.first()
        .copied()
        .ok_or_else(|| HoofError::Namelist(format!("section {} has no value", header)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_uppercase().as_str(), "T" | "TRUE")
}

fn parse_number<T: FromStr>(header: &str, body: &[&str]) -> HoofResult<T> {
    let value = first_line(header, body)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| HoofError::Namelist(format!("cannot read '{}' in section {}", value, header)))
}

fn braced_list(value: &str) -> Vec<String> {
    value
        .replace(['{', '}'], " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn key_values<'a>(header: &str, body: &[&'a str]) -> HoofResult<Vec<(&'a str, &'a str)>> {
    body.iter()
        .map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| HoofError::Namelist(format!("expected 'key = value' in section {}: '{}'", header, line)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMELIST: &str = "\
# HOOF namelist
[File extensions to read]
{.h5 .hdf}

[Log keywords]
WarningTag = W
ErrorTag = E

[Print warnings to console]
T
[Print timing to console]
false

[Radar moment names to save]
DBZ = {DBZH DBZ}
TH = {TH}
VRAD = {VRAD VRADH}

[Required DBZ moment quality groups]
{ROPO TOTAL}

[Common attributes and default values]
S /what/object = PVOL
S /what/source = None
F /dataset/where/elangle = None
I /dataset/where/nbins = None
S /dataset/data/what/quantity = None
F /dataset/quality/what/gain = 0.00392
S /how/system = ODIM_H5/V2_2

[Specific attributes and default values - 11812]
F /where/height = 1020.5
S /what/object = SCAN

[Dealiasing]
T
[Height sector size in m]
250
[Minimum good points in height sector]
30

[Superobing]
TRUE
[Range bin factor]
5
[Ray angle factor]
4
[DBZ min percentage of good points]
0.25
";

    #[test]
    fn test_parse_full_namelist() {
        let settings = Settings::parse(NAMELIST).unwrap();

        assert_eq!(settings.extensions, vec!["h5", "hdf"]);
        assert!(settings.accepts_extension(".h5"));
        assert!(settings.accepts_extension("hdf"));
        assert!(!settings.accepts_extension("txt"));

        assert_eq!(settings.log.warning_tag, "W");
        assert_eq!(settings.log.error_tag, "E");
        assert!(settings.log.warnings_to_console);
        assert!(!settings.log.timing_to_console);

        assert_eq!(settings.names.classify("VRADH"), Some(QuantityKind::Vrad));
        assert_eq!(settings.names.classify("DBZ"), Some(QuantityKind::Dbz));
        assert_eq!(settings.names.classify("ZDR"), None);
        assert_eq!(settings.dbz_quality_tasks, vec!["ROPO", "TOTAL"]);

        assert_eq!(settings.common_attributes.len(), 7);
        assert_eq!(settings.site_overrides("11812").len(), 2);
        assert!(settings.site_overrides("99999").is_empty());

        assert!(settings.dealias.enabled);
        assert_eq!(settings.dealias.sector_height, 250.0);
        assert_eq!(settings.dealias.min_points, 30);
        assert!(settings.superob.enabled);
        assert_eq!(settings.superob.range_factor, 5);
        assert_eq!(settings.superob.azimuth_factor, 4);
        assert_eq!(settings.superob.dbz_min_fraction, 0.25);
    }

    #[test]
    fn test_attribute_line() {
        let attribute = NamelistAttribute::parse_line("F /dataset/where/elangle = None").unwrap();
        assert_eq!(attribute.kind, AttrKind::Float);
        assert_eq!(attribute.group, "dataset/where");
        assert_eq!(attribute.name, "elangle");
        assert_eq!(attribute.default, None);
        assert_eq!(attribute.level(), Some(GroupLevel::Dataset));

        let attribute = NamelistAttribute::parse_line("S /how/system = ODIM_H5/V2_2").unwrap();
        assert_eq!(attribute.default, Some(AttrValue::Str("ODIM_H5/V2_2".into())));
        assert_eq!(attribute.level(), Some(GroupLevel::Root));

        assert!(NamelistAttribute::parse_line("I /dataset/where/nbins = many").is_err());
        assert!(NamelistAttribute::parse_line("nonsense").is_err());
    }

    #[test]
    fn test_group_levels() {
        assert_eq!(GroupLevel::of("/what"), Some(GroupLevel::Root));
        assert_eq!(GroupLevel::of("dataset"), None);
        assert_eq!(GroupLevel::of("/dataset/how"), Some(GroupLevel::Dataset));
        assert_eq!(GroupLevel::of("/dataset/data/what"), Some(GroupLevel::Data));
        assert_eq!(GroupLevel::of("/dataset/quality/how"), Some(GroupLevel::Quality));
        assert_eq!(GroupLevel::of("/dataset/data"), None);
    }

    #[test]
    fn test_declared_attributes_merge_site_overrides() {
        let settings = Settings::parse(NAMELIST).unwrap();
        let root: Vec<_> = settings
            .declared_attributes("11812", GroupLevel::Root)
            .into_iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(root, vec!["object", "source", "system", "height"]);

        let root_elsewhere = settings.declared_attributes("22222", GroupLevel::Root);
        assert_eq!(root_elsewhere.len(), 3);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Settings::parse("[Range bin factor]\nfive\n").unwrap_err();
        assert!(err.to_string().contains("Range bin factor"));
    }
}
