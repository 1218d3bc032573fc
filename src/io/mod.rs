//! I/O modules for radar containers and the namelist

pub mod container;
pub mod h5file;
pub mod memory;
pub mod namelist;

pub use container::{AttrKind, AttrValue, RadarContainer, SubgroupKind};
pub use h5file::H5Container;
pub use memory::MemoryContainer;
pub use namelist::{DealiasParams, LogSettings, Settings, SuperobParams};
