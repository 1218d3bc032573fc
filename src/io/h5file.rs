//! ODIM_H5 file access on top of the `hdf5` crate.
//!
//! The underlying file handle is released when the container is dropped.

use crate::io::container::{normalize_group, select_numbered, AttrKind, AttrValue, RadarContainer, SubgroupKind};
use crate::types::{HoofError, HoofResult};
use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{File, Group};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Longest fixed-length string attribute we read
const MAX_FIXED_STRING: usize = 1024;

/// HDF5 backed radar container
pub struct H5Container {
    file: File,
    path: PathBuf,
}

impl H5Container {
    /// Open an existing file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> HoofResult<Self> {
        let path = path.as_ref().to_path_buf();
        log::debug!("Opening radar file {}", path.display());
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }

    /// Create a new file, truncating an existing one
    pub fn create<P: AsRef<Path>>(path: P) -> HoofResult<Self> {
        let path = path.as_ref().to_path_buf();
        log::debug!("Creating radar file {}", path.display());
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_group(&self, path: &str) -> HoofResult<Option<Group>> {
        let mut current = self.file.group("/")?;
        for component in normalize_group(path).split('/').filter(|c| !c.is_empty()) {
            if !current.link_exists(component) {
                return Ok(None);
            }
            current = current.group(component)?;
        }
        Ok(Some(current))
    }

    fn ensure_group(&self, path: &str) -> HoofResult<Group> {
        let mut current = self.file.group("/")?;
        for component in normalize_group(path).split('/').filter(|c| !c.is_empty()) {
            current = if current.link_exists(component) {
                current.group(component)?
            } else {
                current.create_group(component)?
            };
        }
        Ok(current)
    }

    fn member_names(&self, path: &str) -> HoofResult<Vec<String>> {
        match self.open_group(path)? {
            Some(group) => Ok(group.member_names()?),
            None => Ok(Vec::new()),
        }
    }
}

fn read_string(attr: &hdf5::Attribute, descriptor: &TypeDescriptor) -> HoofResult<Option<String>> {
    let value = match descriptor {
        TypeDescriptor::VarLenUnicode => attr.read_scalar::<VarLenUnicode>()?.as_str().to_string(),
        TypeDescriptor::VarLenAscii => attr.read_scalar::<VarLenAscii>()?.as_str().to_string(),
        TypeDescriptor::FixedAscii(n) if *n <= MAX_FIXED_STRING => {
            attr.read_scalar::<FixedAscii<MAX_FIXED_STRING>>()?.as_str().to_string()
        }
        TypeDescriptor::FixedUnicode(n) if *n <= MAX_FIXED_STRING => {
            attr.read_scalar::<FixedUnicode<MAX_FIXED_STRING>>()?.as_str().to_string()
        }
        _ => return Ok(None),
    };
    Ok(Some(value.trim_end_matches('\0').trim().to_string()))
}

fn is_numeric(descriptor: &TypeDescriptor) -> bool {
    matches!(
        descriptor,
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) | TypeDescriptor::Float(_)
    )
}

impl RadarContainer for H5Container {
    fn dataset_groups(&self) -> HoofResult<Vec<String>> {
        select_numbered(self.member_names("")?, "dataset")
    }

    fn subgroups(&self, dataset: &str, kind: SubgroupKind) -> HoofResult<Vec<String>> {
        select_numbered(self.member_names(dataset)?, kind.prefix())
    }

    fn attr(&self, group: &str, name: &str, kind: AttrKind) -> HoofResult<Option<AttrValue>> {
        let group = match self.open_group(group)? {
            Some(g) => g,
            None => return Ok(None),
        };
        if !group.attr_names()?.iter().any(|n| n == name) {
            return Ok(None);
        }

        let attr = group.attr(name)?;
        let descriptor = attr.dtype()?.to_descriptor()?;
        let value = match kind {
            AttrKind::Str => read_string(&attr, &descriptor)?.map(AttrValue::Str),
            AttrKind::Int if is_numeric(&descriptor) => match descriptor {
                TypeDescriptor::Float(_) => AttrValue::Float(attr.read_scalar::<f64>()?).coerce(AttrKind::Int),
                _ => Some(AttrValue::Int(attr.read_scalar::<i64>()?)),
            },
            AttrKind::Float if is_numeric(&descriptor) => Some(AttrValue::Float(attr.read_scalar::<f64>()?)),
            _ => None,
        };
        Ok(value)
    }

    fn set_attr(&mut self, group: &str, name: &str, value: &AttrValue) -> HoofResult<()> {
        let group = self.ensure_group(group)?;
        let exists = group.attr_names()?.iter().any(|n| n == name);

        match value {
            AttrValue::Str(s) => {
                let s = VarLenUnicode::from_str(s).map_err(|e| {
                    HoofError::InvalidFormat(format!("attribute {} is not valid text: {}", name, e))
                })?;
                if exists {
                    group.attr(name)?.write_scalar(&s)?;
                } else {
                    group.new_attr::<VarLenUnicode>().create(name)?.write_scalar(&s)?;
                }
            }
            AttrValue::Int(i) => {
                if exists {
                    group.attr(name)?.write_scalar(i)?;
                } else {
                    group.new_attr::<i64>().create(name)?.write_scalar(i)?;
                }
            }
            AttrValue::Float(x) => {
                if exists {
                    group.attr(name)?.write_scalar(x)?;
                } else {
                    group.new_attr::<f64>().create(name)?.write_scalar(x)?;
                }
            }
        }
        Ok(())
    }

    fn raster(&self, group: &str, name: &str) -> HoofResult<Option<Array2<u8>>> {
        let group = match self.open_group(group)? {
            Some(g) => g,
            None => return Ok(None),
        };
        if !group.link_exists(name) {
            return Ok(None);
        }
        Ok(Some(group.dataset(name)?.read_2d::<u8>()?))
    }

    fn set_raster(&mut self, group: &str, name: &str, data: &Array2<u8>) -> HoofResult<()> {
        let group = self.ensure_group(group)?;
        if group.link_exists(name) {
            group.unlink(name)?;
        }
        let dataset = group.new_dataset::<u8>().shape(data.dim()).create(name)?;
        dataset.write(data)?;
        Ok(())
    }

    fn flush(&mut self) -> HoofResult<()> {
        self.file.flush()?;
        Ok(())
    }
}
