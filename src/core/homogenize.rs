//! Homogenization: canonical layout and metadata for one radar file.

use crate::core::classify::QuantitySorter;
use crate::core::diagnostics::Diagnostics;
use crate::core::resolver::AttributeResolver;
use crate::core::volume::VolumeLoader;
use crate::io::container::{copy_raster, join_group, AttrValue, RadarContainer};
use crate::io::namelist::{GroupLevel, Settings};
use crate::types::{HoofError, HoofResult, Quantity, QuantityKind, Snapshot};

/// Writes sorted quantities with their resolved metadata to the target file
pub struct HomogenizedWriter<'a> {
    settings: &'a Settings,
    resolver: &'a AttributeResolver<'a>,
}

impl<'a> HomogenizedWriter<'a> {
    pub fn new(settings: &'a Settings, resolver: &'a AttributeResolver<'a>) -> Self {
        Self { settings, resolver }
    }

    /// Write metadata and rasters of every quantity, then flush the target
    pub fn write(
        &self,
        source: &dyn RadarContainer,
        target: &mut dyn RadarContainer,
        quantities: &[Quantity],
        diagnostics: &mut Diagnostics,
    ) -> HoofResult<()> {
        match self.resolver.resolve_str(source, "", "Conventions")? {
            Some(conventions) => target.set_attr("", "Conventions", &AttrValue::Str(conventions))?,
            None => diagnostics.error("Conventions attribute not found"),
        }

        self.write_level(source, target, GroupLevel::Root, "", "", None, diagnostics)?;

        if quantities.is_empty() {
            diagnostics.error("no quantities to write to output file");
            return Ok(());
        }

        for quantity in quantities {
            let destination = quantity.target.as_ref().ok_or_else(|| {
                HoofError::Processing(format!("{} in {} has no target", quantity.kind, quantity.source.path()))
            })?;

            if matches!(quantity.kind, QuantityKind::Dbz | QuantityKind::Vrad) {
                self.write_level(
                    source,
                    target,
                    GroupLevel::Dataset,
                    &quantity.source.dataset,
                    &destination.dataset,
                    None,
                    diagnostics,
                )?;
            }

            let level = if quantity.kind.is_quality() {
                GroupLevel::Quality
            } else {
                GroupLevel::Data
            };
            self.write_level(
                source,
                target,
                level,
                &quantity.source.path(),
                &destination.path(),
                Some(quantity.kind),
                diagnostics,
            )?;

            if !copy_raster(source, target, &quantity.source.path(), &destination.path(), "data")? {
                diagnostics.error(format!("raster {}/data not found", quantity.source.path()));
            }
            log::debug!("{} {} -> {}", quantity.kind, quantity.source.path(), destination.path());
        }

        target.flush()
    }

    /// Resolve and write every attribute the namelist declares for one group level
    #[allow(clippy::too_many_arguments)]
    fn write_level(
        &self,
        source: &dyn RadarContainer,
        target: &mut dyn RadarContainer,
        level: GroupLevel,
        from: &str,
        to: &str,
        kind: Option<QuantityKind>,
        diagnostics: &mut Diagnostics,
    ) -> HoofResult<()> {
        for attribute in self.settings.declared_attributes(self.resolver.site(), level) {
            let leaf = attribute.group.rsplit('/').next().unwrap_or_default();
            let from_group = join_group(from, leaf);
            let to_group = join_group(to, leaf);

            if attribute.name == "quantity" {
                if let Some(kind) = kind {
                    target.set_attr(&to_group, "quantity", &AttrValue::Str(kind.to_string()))?;
                    continue;
                }
            }

            match self.resolver.resolve(source, &from_group, &attribute.name, attribute.kind)? {
                Some(value) => target.set_attr(&to_group, &attribute.name, &value)?,
                None => diagnostics.error(format!("attribute {}/{} not found", from_group, attribute.name)),
            }
        }
        Ok(())
    }
}

/// First pipeline stage: sort, write and load one file
pub struct Homogenizer<'a> {
    settings: &'a Settings,
    site: &'a str,
    diagnostics: Diagnostics,
}

impl<'a> Homogenizer<'a> {
    pub fn new(settings: &'a Settings, site: &'a str) -> Self {
        Self {
            settings,
            site,
            diagnostics: Diagnostics::new("Homogenization"),
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Classify and order the quantities of the source file
    pub fn sort(&mut self, source: &dyn RadarContainer) -> HoofResult<Vec<Quantity>> {
        let resolver = AttributeResolver::new(self.settings, self.site);
        let sorter = QuantitySorter::new(self.settings, &resolver);
        let quantities = sorter.sort(source, &mut self.diagnostics)?;
        log::info!("{} quantities retained for site {}", quantities.len(), self.site);
        Ok(quantities)
    }

    /// Write the homogenized file
    pub fn check_and_write(
        &mut self,
        source: &dyn RadarContainer,
        target: &mut dyn RadarContainer,
        quantities: &[Quantity],
    ) -> HoofResult<()> {
        let resolver = AttributeResolver::new(self.settings, self.site);
        HomogenizedWriter::new(self.settings, &resolver).write(source, target, quantities, &mut self.diagnostics)
    }

    /// Decode the homogenized file into the in-memory snapshot
    pub fn store_data(
        &mut self,
        source: &dyn RadarContainer,
        target: &dyn RadarContainer,
        quantities: &[Quantity],
    ) -> HoofResult<Snapshot> {
        let resolver = AttributeResolver::new(self.settings, self.site);
        VolumeLoader::new(self.settings).load(&resolver, source, target, quantities, &mut self.diagnostics)
    }
}
