//! Warning and error collection for the per-file processing stages

use crate::io::namelist::LogSettings;
use crate::types::HoofResult;
use std::io::Write;

/// Warnings and errors recorded by one processing stage
#[derive(Debug, Clone)]
pub struct Diagnostics {
    stage: &'static str,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl Diagnostics {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Write recorded messages to the file log and echo them to the console.
    ///
    /// Messages are drained, so calling this twice never duplicates output.
    pub fn write_to(&mut self, log: &mut dyn Write, settings: &LogSettings) -> HoofResult<()> {
        for warning in self.warnings.drain(..) {
            if settings.warnings_to_log {
                writeln!(log, "{}: {} - {}", settings.warning_tag, self.stage, warning)?;
            }
            if settings.warnings_to_console {
                log::warn!("{} - {}", self.stage, warning);
            }
        }
        for error in self.errors.drain(..) {
            writeln!(log, "{}: {} - {}", settings.error_tag, self.stage, error)?;
            if settings.errors_to_console {
                log::error!("{} - {}", self.stage, error);
            }
        }
        log.flush()?;
        Ok(())
    }
}
